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

use byteorder::{ByteOrder, LittleEndian};
use deku::DekuContainerRead;
use resign_common::ArchiveError;
use std::io::{self, Read, Seek, SeekFrom};

use crate::records::{
    CentralDirectoryHeader, EndOfCentralDirectory, LocalFileHeader, LOCAL_HEADER_FIXED_SIZE
};

pub const EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";
pub const LOCAL_HEADER_MAGIC: &[u8; 4] = b"PK\x03\x04";
const ZIP64_LOCATOR_MAGIC: &[u8; 4] = b"PK\x06\x07";
const ZIP64_LOCATOR_SIZE: usize = 20;
const EOCD_MIN_SIZE: usize = 22;
const MAX_COMMENT_SIZE: usize = 0xFFFF;

/// The parsed tail of an archive: its End Of Central Directory record and
/// every central directory header, in directory order.
#[derive(Debug)]
pub struct CentralDirectory {
    pub end_record: EndOfCentralDirectory,
    pub entries: Vec<CentralDirectoryHeader>
}

pub fn read_central_directory<R: Read + Seek>(source: &mut R) -> Result<CentralDirectory, ArchiveError> {
    // The EOCD is the last record, followed only by a comment of at most 64KiB
    let file_len = source.seek(SeekFrom::End(0))?;
    let tail_len = file_len.min((EOCD_MIN_SIZE + MAX_COMMENT_SIZE) as u64);
    let tail_start = file_len - tail_len;
    source.seek(SeekFrom::Start(tail_start))?;
    let mut tail = vec![0; tail_len as usize];
    source.read_exact(&mut tail)?;

    let eocd_pos = find_end_record(&tail).ok_or(ArchiveError::MissingEndOfCentralDirectory)?;
    let (_, end_record) = EndOfCentralDirectory::from_bytes((&tail[eocd_pos..], 0))?;

    let has_zip64_locator = eocd_pos >= ZIP64_LOCATOR_SIZE
        && &tail[(eocd_pos - ZIP64_LOCATOR_SIZE)..(eocd_pos - ZIP64_LOCATOR_SIZE + 4)]
            == ZIP64_LOCATOR_MAGIC;
    if has_zip64_locator || end_record.needs_zip64() {
        return Err(ArchiveError::Zip64Unsupported);
    }
    if end_record.disk_number != 0 || end_record.central_directory_disk != 0 {
        return Err(ArchiveError::malformed(
            "end of central directory",
            "multi-disk archives are not supported"
        ));
    }

    let eocd_start = tail_start + eocd_pos as u64;
    let cd_start = end_record.central_directory_offset as u64;
    let cd_end = cd_start + end_record.central_directory_size as u64;
    if cd_end > eocd_start {
        return Err(ArchiveError::malformed(
            "end of central directory",
            format!("central directory ends at {cd_end}, past the record itself at {eocd_start}")
        ));
    }

    source.seek(SeekFrom::Start(cd_start))?;
    let mut cd_bytes = vec![0; end_record.central_directory_size as usize];
    read_exact_or_truncated(source, &mut cd_bytes, || "the central directory".into())?;

    let mut entries = Vec::with_capacity(end_record.total_entries as usize);
    let mut rest: &[u8] = &cd_bytes;
    for index in 0..end_record.total_entries {
        let ((next, _), header) = CentralDirectoryHeader::from_bytes((rest, 0))
            .map_err(|e| ArchiveError::malformed(format!("central directory entry {index}"), e))?;
        if header.needs_zip64() {
            return Err(ArchiveError::Zip64Unsupported);
        }
        entries.push(header);
        rest = next;
    }

    Ok(CentralDirectory {
        end_record,
        entries
    })
}

// Scans backwards so that a stray magic inside the comment loses to the real record
fn find_end_record(tail: &[u8]) -> Option<usize> {
    if tail.len() < EOCD_MIN_SIZE {
        return None;
    }
    (0..=(tail.len() - EOCD_MIN_SIZE)).rev().find(|&i| {
        let comment_len = LittleEndian::read_u16(&tail[(i + 20)..(i + 22)]) as usize;
        &tail[i..(i + 4)] == EOCD_MAGIC && i + EOCD_MIN_SIZE + comment_len <= tail.len()
    })
}

/// Reads the local header at `offset`, leaving `source` positioned on the
/// first payload byte. Also returns the header exactly as it was on disk.
pub fn read_local_header<R: Read + Seek>(
    source: &mut R,
    offset: u64,
    entry_name: &str
) -> Result<(LocalFileHeader, Vec<u8>), ArchiveError> {
    source.seek(SeekFrom::Start(offset))?;
    let mut raw = vec![0; LOCAL_HEADER_FIXED_SIZE as usize];
    read_exact_or_truncated(source, &mut raw, || format!("the local header of {entry_name}"))?;
    if &raw[0..4] != LOCAL_HEADER_MAGIC {
        return Err(ArchiveError::malformed(
            format!("local header of {entry_name}"),
            format!("no local header signature at offset {offset}")
        ));
    }

    let name_len = LittleEndian::read_u16(&raw[26..28]) as usize;
    let extra_len = LittleEndian::read_u16(&raw[28..30]) as usize;
    let fixed = raw.len();
    raw.resize(fixed + name_len + extra_len, 0);
    read_exact_or_truncated(source, &mut raw[fixed..], || {
        format!("the local header of {entry_name}")
    })?;

    let (_, header) = LocalFileHeader::from_bytes((&raw, 0))?;
    Ok((header, raw))
}

pub fn read_exact_or_truncated<R: Read>(
    source: &mut R,
    buf: &mut [u8],
    what: impl FnOnce() -> String
) -> Result<(), ArchiveError> {
    source.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ArchiveError::Truncated(what()),
        _ => e.into()
    })
}
