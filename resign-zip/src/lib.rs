// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rewrites a ZIP archive so that the data of every stored (uncompressed)
//! entry starts on a 4-byte boundary, the layout Android expects so that
//! stored resources can be `mmap`ed straight out of the APK.
//!
//! Compressed entries are copied through byte-for-byte. Nothing is ever
//! recompressed.

use counting_writer::CountingWriter;
use deku::DekuContainerWrite;
use extra_field::strip_alignment_padding;
use records::{
    EndOfCentralDirectory, DATA_DESCRIPTOR_MAGIC, FLAG_DATA_DESCRIPTOR, FLAG_ENCRYPTED,
    LOCAL_HEADER_FIXED_SIZE
};
use resign_common::ArchiveError;
use std::io::{self, Read, Seek, Write};
use tracing::{debug, warn};
use zip_parser::{read_central_directory, read_exact_or_truncated, read_local_header};

pub mod counting_writer;
pub mod extra_field;
pub mod records;
mod zip_parser;

/// Byte boundary the data of stored entries is aligned to.
pub const ALIGNMENT: u64 = 4;

/// Where one entry's data ended up in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAlignment {
    pub name: String,
    pub stored: bool,
    /// Offset of the first payload byte from the start of the archive.
    pub data_offset: u64
}

impl EntryAlignment {
    /// Compressed entries have no alignment requirement.
    pub fn is_aligned(&self) -> bool {
        !self.stored || self.data_offset % ALIGNMENT == 0
    }
}

/// Summary of one [align] call, in output entry order.
#[derive(Debug, Clone, Default)]
pub struct AlignReport {
    pub entries: Vec<EntryAlignment>,
    /// Zero bytes added to extra fields across all stored entries.
    pub padding_added: u64,
    pub bytes_written: u64
}

/// How many bytes must be inserted before `offset` to put it on a multiple
/// of `alignment`.
pub fn padding_for(offset: u64, alignment: u64) -> u64 {
    (alignment - (offset % alignment)) % alignment
}

/// Copies the archive in `source` to `output`, padding the extra field of
/// every stored entry so its data lands on an [ALIGNMENT] boundary.
///
/// Stored entries are buffered whole, their CRC-32 is recomputed and both
/// size fields are set from the buffered length, so a source whose headers
/// disagree with its data still produces a consistent archive.
///
/// Entries are written in central directory order and a fresh central
/// directory is written after them. Anything else between the entries and
/// the old directory, like an APK Signing Block, is dropped.
///
/// On error `output` holds a partial archive that must not be used.
pub fn align<R: Read + Seek, W: Write>(source: &mut R, output: W) -> Result<AlignReport, ArchiveError> {
    let directory = read_central_directory(source)?;
    let mut out = CountingWriter::new(output);
    let mut report = AlignReport::default();
    let mut new_directory = Vec::with_capacity(directory.entries.len());
    let mut source_end = 0;

    for entry in &directory.entries {
        let name = entry.display_name();
        let (local, raw_local) = read_local_header(source, entry.local_header_offset as u64, &name)?;
        let local_offset = out.position();
        let mut new_entry = entry.clone();
        new_entry.local_header_offset =
            u32::try_from(local_offset).map_err(|_| ArchiveError::Zip64Unsupported)?;

        let data_offset = if entry.is_stored() {
            // The CRC below would be computed over ciphertext
            if (entry.flags | local.flags) & FLAG_ENCRYPTED != 0 {
                return Err(ArchiveError::malformed(
                    format!("entry {name}"),
                    "encrypted stored entries can't be realigned"
                ));
            }
            // Size comes from the directory: with a data descriptor the local
            // header sizes are zero. The directory is untrusted, so read no
            // more than the source actually has.
            let declared = entry.compressed_size as u64;
            let mut payload = vec![];
            source.by_ref().take(declared).read_to_end(&mut payload)?;
            if payload.len() as u64 != declared {
                return Err(ArchiveError::Truncated(format!("the data of {name}")));
            }
            let crc = crc32fast::hash(&payload);
            if crc != entry.crc32 {
                warn!(entry = %name, declared = entry.crc32, actual = crc, "Stored entry CRC-32 did not match its data, rewriting it");
            }
            let size = payload.len() as u32;

            let mut extra = strip_alignment_padding(&local.extra);
            let header_end =
                local_offset + LOCAL_HEADER_FIXED_SIZE + local.name.len() as u64 + extra.len() as u64;
            let padding = padding_for(header_end, ALIGNMENT);
            extra.resize(extra.len() + padding as usize, 0);

            let mut header = local.clone();
            header.flags &= !FLAG_DATA_DESCRIPTOR;
            header.crc32 = crc;
            header.compressed_size = size;
            header.uncompressed_size = size;
            header.extra_length = u16::try_from(extra.len()).map_err(|_| {
                ArchiveError::malformed(format!("extra field of {name}"), "too long to pad")
            })?;
            header.extra = extra;
            out.write_all(&header.to_bytes()?)?;

            let data_offset = out.position();
            out.write_all(&payload)?;

            new_entry.flags &= !FLAG_DATA_DESCRIPTOR;
            new_entry.crc32 = crc;
            new_entry.compressed_size = size;
            new_entry.uncompressed_size = size;
            report.padding_added += padding;
            debug!(entry = %name, data_offset, padding, "Aligned stored entry");
            data_offset
        } else {
            out.write_all(&raw_local)?;
            let data_offset = out.position();
            copy_exact(source, &mut out, entry.compressed_size as u64, || format!("the data of {name}"))?;
            if local.has_data_descriptor() {
                copy_data_descriptor(source, &mut out, &name)?;
            }
            debug!(entry = %name, data_offset, "Copied compressed entry");
            data_offset
        };

        source_end = source_end.max(source.stream_position()?);
        report.entries.push(EntryAlignment {
            name,
            stored: entry.is_stored(),
            data_offset
        });
        new_directory.push(new_entry);
    }

    let skipped = (directory.end_record.central_directory_offset as u64).saturating_sub(source_end);
    if !directory.entries.is_empty() && skipped > 0 {
        debug!(bytes = skipped, "Dropped data between the last entry and the central directory");
    }

    let cd_start = out.position();
    for entry in &new_directory {
        out.write_all(&entry.to_bytes()?)?;
    }
    let cd_size = out.position() - cd_start;
    let end_record = EndOfCentralDirectory::new(
        directory.end_record.total_entries,
        u32::try_from(cd_size).map_err(|_| ArchiveError::Zip64Unsupported)?,
        u32::try_from(cd_start).map_err(|_| ArchiveError::Zip64Unsupported)?,
        directory.end_record.comment.clone()
    );
    out.write_all(&end_record.to_bytes()?)?;
    out.flush()?;

    report.bytes_written = out.position();
    Ok(report)
}

/// Reports where the data of each entry starts, in central directory order.
///
/// This is the `zipalign -c` check: an archive is aligned when every entry
/// [is_aligned](EntryAlignment::is_aligned).
pub fn check_alignment<R: Read + Seek>(source: &mut R) -> Result<Vec<EntryAlignment>, ArchiveError> {
    let directory = read_central_directory(source)?;
    directory
        .entries
        .iter()
        .map(|entry| {
            let name = entry.display_name();
            let offset = entry.local_header_offset as u64;
            let (local, _) = read_local_header(source, offset, &name)?;
            Ok(EntryAlignment {
                name,
                stored: entry.is_stored(),
                data_offset: offset + local.header_len()
            })
        })
        .collect()
}

fn copy_exact<R: Read, W: Write>(
    source: &mut R,
    out: &mut W,
    len: u64,
    what: impl FnOnce() -> String
) -> Result<(), ArchiveError> {
    let copied = io::copy(&mut source.by_ref().take(len), out)?;
    if copied != len {
        return Err(ArchiveError::Truncated(what()));
    }
    Ok(())
}

// CRC-32 and both sizes, optionally preceded by a signature
fn copy_data_descriptor<R: Read, W: Write>(source: &mut R, out: &mut W, name: &str) -> Result<(), ArchiveError> {
    let mut first = [0; 4];
    read_exact_or_truncated(source, &mut first, || format!("the data descriptor of {name}"))?;
    out.write_all(&first)?;
    let remaining = if &first == DATA_DESCRIPTOR_MAGIC { 12 } else { 8 };
    copy_exact(source, out, remaining, || format!("the data descriptor of {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use records::{CentralDirectoryHeader, LocalFileHeader};
    use std::io::Cursor;
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

    const STORED: CompressionMethod = CompressionMethod::Stored;
    const DEFLATED: CompressionMethod = CompressionMethod::Deflated;

    fn build_archive(files: &[(&str, CompressionMethod, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, method, data) in files {
            let options = SimpleFileOptions::default().compression_method(*method);
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn align_bytes(input: &[u8]) -> Vec<u8> {
        let mut output = vec![];
        align(&mut Cursor::new(input), &mut output).unwrap();
        output
    }

    fn mixed_archive() -> Vec<u8> {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        build_archive(&[
            ("AndroidManifest.xml", DEFLATED, text.as_bytes()),
            ("a", STORED, b"one"),
            ("res/raw/bb.bin", STORED, &[7; 33]),
            ("classes.dex", DEFLATED, &[1, 2, 3, 4, 5, 6, 7, 8, 9]),
            ("resources.arsc", STORED, &[0xAB; 1021]),
            ("res/xml/c.xml", STORED, b"")
        ])
    }

    #[test]
    fn stored_entries_start_on_boundary() {
        let output = align_bytes(&mixed_archive());

        let entries = check_alignment(&mut Cursor::new(&output)).unwrap();
        assert_eq!(entries.len(), 6);
        assert!(entries.iter().all(EntryAlignment::is_aligned));

        let mut zip = ZipArchive::new(Cursor::new(&output)).unwrap();
        for i in 0..zip.len() {
            let file = zip.by_index(i).unwrap();
            if file.compression() == STORED {
                assert_eq!(file.data_start() % ALIGNMENT, 0, "{} is misaligned", file.name());
            }
        }
    }

    #[test]
    fn stored_entries_have_matching_crc_and_sizes() {
        let input = mixed_archive();
        let output = align_bytes(&input);

        let mut before = ZipArchive::new(Cursor::new(&input)).unwrap();
        let mut after = ZipArchive::new(Cursor::new(&output)).unwrap();
        for i in 0..after.len() {
            let mut expected = vec![];
            before.by_index(i).unwrap().read_to_end(&mut expected).unwrap();
            let mut file = after.by_index(i).unwrap();
            // Reading to the end makes the zip crate check the CRC-32
            let mut actual = vec![];
            file.read_to_end(&mut actual).unwrap();
            assert_eq!(actual, expected);
            if file.compression() == STORED {
                assert_eq!(file.size(), actual.len() as u64);
                assert_eq!(file.compressed_size(), actual.len() as u64);
                assert_eq!(file.crc32(), crc32fast::hash(&actual));
            }
        }
    }

    #[test]
    fn compressed_payloads_are_untouched() {
        let input = mixed_archive();
        let output = align_bytes(&input);

        let mut before = ZipArchive::new(Cursor::new(&input)).unwrap();
        let mut after = ZipArchive::new(Cursor::new(&output)).unwrap();
        for name in ["AndroidManifest.xml", "classes.dex"] {
            let mut raw_before = vec![];
            let mut raw_after = vec![];
            let index = before.index_for_name(name).unwrap();
            before.by_index_raw(index).unwrap().read_to_end(&mut raw_before).unwrap();
            let index = after.index_for_name(name).unwrap();
            after.by_index_raw(index).unwrap().read_to_end(&mut raw_after).unwrap();
            assert_eq!(raw_after, raw_before, "{name} changed");
        }
    }

    #[test]
    fn entry_order_is_preserved() {
        let input = build_archive(&[
            ("C", STORED, b"c"),
            ("A", DEFLATED, b"aaaaaaaa"),
            ("B", STORED, b"bb")
        ]);
        let output = align_bytes(&input);

        let mut zip = ZipArchive::new(Cursor::new(&output)).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, ["C", "A", "B"]);

        // Local headers follow the same order as the directory
        let offsets: Vec<u64> = check_alignment(&mut Cursor::new(&output))
            .unwrap()
            .iter()
            .map(|e| e.data_offset)
            .collect();
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn aligning_twice_changes_nothing() {
        let once = align_bytes(&mixed_archive());
        let twice = align_bytes(&once);
        assert_eq!(twice, once);
    }

    #[test]
    fn already_aligned_input_keeps_payloads() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(STORED)
            .with_alignment(4);
        for (name, data) in [("x", &b"12345"[..]), ("yy", &b"abcdefgh"[..])] {
            zip.start_file(name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        let input = zip.finish().unwrap().into_inner();

        let output = align_bytes(&input);
        assert!(check_alignment(&mut Cursor::new(&output))
            .unwrap()
            .iter()
            .all(EntryAlignment::is_aligned));
        let mut after = ZipArchive::new(Cursor::new(&output)).unwrap();
        let mut data = String::new();
        after.by_name("yy").unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "abcdefgh");
    }

    #[test]
    fn empty_archive_stays_empty() {
        let input = build_archive(&[]);
        let mut output = vec![];
        let report = align(&mut Cursor::new(&input), &mut output).unwrap();

        assert!(report.entries.is_empty());
        assert_eq!(ZipArchive::new(Cursor::new(&output)).unwrap().len(), 0);
    }

    #[test]
    fn single_dex_entry_padding() {
        let input = build_archive(&[("classes.dex", STORED, &[0x64; 17])]);
        let mut output = vec![];
        let report = align(&mut Cursor::new(&input), &mut output).unwrap();

        // 30 byte fixed header + 11 byte name ends at 41
        let header_end = 30 + "classes.dex".len() as u64;
        assert_eq!(padding_for(header_end, ALIGNMENT), 3);
        assert_eq!(report.entries[0].data_offset, 44);
        assert_eq!(report.padding_added, 3);
        // Extra field length in the local header
        assert_eq!(u16::from_le_bytes([output[28], output[29]]), 3);
        assert_eq!(&output[44..61], &[0x64; 17]);
    }

    #[test]
    fn padding_arithmetic() {
        assert_eq!(padding_for(0, 4), 0);
        assert_eq!(padding_for(41, 4), 3);
        assert_eq!(padding_for(42, 4), 2);
        assert_eq!(padding_for(43, 4), 1);
        assert_eq!(padding_for(44, 4), 0);
    }

    #[test]
    fn rewrites_wrong_crc_on_stored_entry() {
        let mut input = build_archive(&[("assets/data.bin", STORED, b"payload")]);
        // Corrupt the CRC-32 in both the local header and the directory
        let cd_offset = u32::from_le_bytes(input[input.len() - 6..input.len() - 2].try_into().unwrap()) as usize;
        input[14..18].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        input[cd_offset + 16..cd_offset + 20].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let output = align_bytes(&input);
        let mut zip = ZipArchive::new(Cursor::new(&output)).unwrap();
        let mut data = vec![];
        zip.by_name("assets/data.bin").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"payload");
    }

    // Builds a deflate entry streamed with a data descriptor, then a stored one
    fn archive_with_data_descriptor() -> Vec<u8> {
        let compressed = vec![0x4B, 0x4C, 0x4A, 0x06, 0x00];
        let descriptor_crc = 0x352441C2u32;
        let mut bytes = vec![];
        let first = LocalFileHeader {
            version_needed: 20,
            flags: FLAG_DATA_DESCRIPTOR,
            method: 8,
            mod_time: 0,
            mod_date: 0x21,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            name_length: 5,
            extra_length: 0,
            name: b"a.txt".to_vec(),
            extra: vec![]
        };
        bytes.extend(first.to_bytes().unwrap());
        bytes.extend(&compressed);
        bytes.extend(DATA_DESCRIPTOR_MAGIC);
        bytes.extend(descriptor_crc.to_le_bytes());
        bytes.extend((compressed.len() as u32).to_le_bytes());
        bytes.extend(3u32.to_le_bytes());

        let second_offset = bytes.len() as u32;
        let second = LocalFileHeader {
            flags: 0,
            method: 0,
            crc32: crc32fast::hash(b"xyz"),
            compressed_size: 3,
            uncompressed_size: 3,
            name_length: 1,
            name: b"z".to_vec(),
            ..first.clone()
        };
        bytes.extend(second.to_bytes().unwrap());
        bytes.extend(b"xyz");

        let cd_offset = bytes.len() as u32;
        let directory = [
            (&first, 0, descriptor_crc, compressed.len() as u32, 3),
            (&second, second_offset, second.crc32, 3, 3)
        ];
        for (local, offset, crc32, compressed_size, uncompressed_size) in directory {
            let header = CentralDirectoryHeader {
                version_made_by: 20,
                version_needed: 20,
                flags: local.flags,
                method: local.method,
                mod_time: 0,
                mod_date: 0x21,
                crc32,
                compressed_size,
                uncompressed_size,
                name_length: local.name_length,
                extra_length: 0,
                comment_length: 0,
                disk_number_start: 0,
                internal_attributes: 0,
                external_attributes: 0,
                local_header_offset: offset,
                name: local.name.clone(),
                extra: vec![],
                comment: vec![]
            };
            bytes.extend(header.to_bytes().unwrap());
        }
        let cd_size = bytes.len() as u32 - cd_offset;
        bytes.extend(EndOfCentralDirectory::new(2, cd_size, cd_offset, vec![]).to_bytes().unwrap());
        bytes
    }

    #[test]
    fn copies_data_descriptor_with_compressed_entry() {
        let input = archive_with_data_descriptor();
        let output = align_bytes(&input);

        // Header + data + 16 byte descriptor copied verbatim
        let first_len = 30 + 5 + 5 + 16;
        assert_eq!(&output[..first_len], &input[..first_len]);

        let entries = check_alignment(&mut Cursor::new(&output)).unwrap();
        assert_eq!(entries[1].name, "z");
        assert!(entries[1].is_aligned());
        let data_start = entries[1].data_offset as usize;
        assert_eq!(&output[data_start..data_start + 3], b"xyz");
    }

    #[test]
    fn truncated_archive_fails() {
        let input = mixed_archive();
        let mut output = vec![];
        let half = &input[..input.len() / 2];
        assert!(align(&mut Cursor::new(half), &mut output).is_err());

        // Directory intact, but the stored data it points at is cut short
        let mut cut = build_archive(&[("big.bin", STORED, &[9; 256])]);
        let eocd = cut.len() - 22;
        let cd_offset = u32::from_le_bytes(cut[eocd + 16..eocd + 20].try_into().unwrap()) as usize;
        let mut tail = cut.split_off(cd_offset);
        cut.truncate(cd_offset - 246);
        let new_cd_offset = cut.len() as u32;
        let eocd = tail.len() - 22;
        tail[eocd + 16..eocd + 20].copy_from_slice(&new_cd_offset.to_le_bytes());
        cut.extend(tail);

        let err = align(&mut Cursor::new(&cut), vec![]).unwrap_err();
        assert!(matches!(err, ArchiveError::Truncated(_)), "{err:?}");
    }

    #[test]
    fn oversized_stored_entry_is_truncated() {
        let mut input = build_archive(&[("assets/small.bin", STORED, &[3; 16])]);
        let cd_offset = u32::from_le_bytes(input[input.len() - 6..input.len() - 2].try_into().unwrap()) as usize;
        // Directory claims almost 2 GiB of stored data
        input[cd_offset + 20..cd_offset + 24].copy_from_slice(&0x7FFF_FFF0u32.to_le_bytes());

        let err = align(&mut Cursor::new(&input), vec![]).unwrap_err();
        assert!(matches!(err, ArchiveError::Truncated(_)), "{err:?}");
    }

    #[test]
    fn encrypted_stored_entry_is_refused() {
        let mut input = build_archive(&[("a", STORED, b"one"), ("secret.bin", STORED, b"ciphertext")]);
        let cd_offset = u32::from_le_bytes(input[input.len() - 6..input.len() - 2].try_into().unwrap()) as usize;
        let u16_at = |at: usize| u16::from_le_bytes([input[at], input[at + 1]]) as usize;
        let second_cd = cd_offset + 46 + u16_at(cd_offset + 28) + u16_at(cd_offset + 30) + u16_at(cd_offset + 32);
        let local_offset = u32::from_le_bytes(input[second_cd + 42..second_cd + 46].try_into().unwrap()) as usize;
        input[local_offset + 6] |= FLAG_ENCRYPTED as u8;
        input[second_cd + 8] |= FLAG_ENCRYPTED as u8;

        let err = align(&mut Cursor::new(&input), vec![]).unwrap_err();
        assert!(
            matches!(&err, ArchiveError::Malformed { context, .. } if context == "entry secret.bin"),
            "{err:?}"
        );
    }

    #[test]
    fn non_zip_input_fails() {
        let err = align(&mut Cursor::new(b"not a zip file".repeat(10)), vec![]).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingEndOfCentralDirectory));
    }
}
