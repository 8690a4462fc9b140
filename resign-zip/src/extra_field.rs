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

/// Header ID of the alignment record Android's zipalign writes.
pub const ALIGNMENT_EXTRA_ID: u16 = 0xD935;
// Header ID (2) + data size (2)
const EXTRA_RECORD_HEADER_SIZE: usize = 4;

/// Returns the extra field of a stored entry without any padding a previous
/// alignment pass put there.
///
/// Extra fields are a list of `id, size, data` records. Padding shows up
/// either as an [ALIGNMENT_EXTRA_ID] record or as bare zero bytes, which read
/// as a record with ID 0 (or as a tail too short to be a record at all).
/// Everything up to the first such record is kept as-is.
pub fn strip_alignment_padding(extra: &[u8]) -> Vec<u8> {
    let mut kept = Vec::with_capacity(extra.len());
    let mut pos = 0;

    while pos + EXTRA_RECORD_HEADER_SIZE <= extra.len() {
        let id = LittleEndian::read_u16(&extra[pos..]);
        let size = LittleEndian::read_u16(&extra[(pos + 2)..]) as usize;
        let end = pos + EXTRA_RECORD_HEADER_SIZE + size;
        if id == 0 || end > extra.len() {
            break;
        }
        if id != ALIGNMENT_EXTRA_ID {
            kept.extend_from_slice(&extra[pos..end]);
        }
        pos = end;
    }

    kept
}
