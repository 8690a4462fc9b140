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

// ZIP records as laid out in APPNOTE.TXT sections 4.3.7, 4.3.12 and 4.3.16
use deku::prelude::*;

pub const METHOD_STORED: u16 = 0;
// General purpose bit 0: the entry's data is encrypted
pub const FLAG_ENCRYPTED: u16 = 1;
// General purpose bit 3: CRC-32 and sizes follow the data in a descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
pub const DATA_DESCRIPTOR_MAGIC: &[u8; 4] = b"PK\x07\x08";
// Everything in a local header before the variable-length name
pub const LOCAL_HEADER_FIXED_SIZE: u64 = 30;
// ZIP64 stores this in 32-bit fields to say "look in the ZIP64 extra"
pub const ZIP64_MARKER_U32: u32 = 0xFFFF_FFFF;
pub const ZIP64_MARKER_U16: u16 = 0xFFFF;

#[derive(Debug, PartialEq, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little", magic = b"PK\x03\x04")]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_length: u16,
    pub extra_length: u16,
    #[deku(count = "name_length")]
    pub name: Vec<u8>,
    #[deku(count = "extra_length")]
    pub extra: Vec<u8>
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little", magic = b"PK\x01\x02")]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_length: u16,
    pub extra_length: u16,
    pub comment_length: u16,
    pub disk_number_start: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    // From the start of the archive
    pub local_header_offset: u32,
    #[deku(count = "name_length")]
    pub name: Vec<u8>,
    #[deku(count = "extra_length")]
    pub extra: Vec<u8>,
    #[deku(count = "comment_length")]
    pub comment: Vec<u8>
}

#[derive(Debug, PartialEq, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little", magic = b"PK\x05\x06")]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub central_directory_disk: u16,
    pub entries_on_disk: u16,
    pub total_entries: u16,
    pub central_directory_size: u32,
    // From the start of the archive
    pub central_directory_offset: u32,
    pub comment_length: u16,
    #[deku(count = "comment_length")]
    pub comment: Vec<u8>
}

impl LocalFileHeader {
    /// Bytes from the start of the signature to the first payload byte.
    pub fn header_len(&self) -> u64 {
        LOCAL_HEADER_FIXED_SIZE + self.name.len() as u64 + self.extra.len() as u64
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }
}

impl CentralDirectoryHeader {
    pub fn is_stored(&self) -> bool {
        self.method == METHOD_STORED
    }

    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    pub fn needs_zip64(&self) -> bool {
        self.compressed_size == ZIP64_MARKER_U32
            || self.uncompressed_size == ZIP64_MARKER_U32
            || self.local_header_offset == ZIP64_MARKER_U32
    }
}

impl EndOfCentralDirectory {
    /// Builds a single-disk record. `comment` comes from a source record, so
    /// it always fits in the 16-bit length.
    pub fn new(entries: u16, size: u32, offset: u32, comment: Vec<u8>) -> EndOfCentralDirectory {
        EndOfCentralDirectory {
            disk_number: 0,
            central_directory_disk: 0,
            entries_on_disk: entries,
            total_entries: entries,
            central_directory_size: size,
            central_directory_offset: offset,
            comment_length: comment.len() as u16,
            comment
        }
    }

    pub fn needs_zip64(&self) -> bool {
        self.total_entries == ZIP64_MARKER_U16
            || self.central_directory_size == ZIP64_MARKER_U32
            || self.central_directory_offset == ZIP64_MARKER_U32
    }
}
