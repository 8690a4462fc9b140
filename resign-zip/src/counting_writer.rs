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

use std::io::{self, Write};

/// Wraps a writer and counts every byte that reaches it.
///
/// The aligner needs the absolute output offset before each local header,
/// and the output may be a pipe or a `BufWriter` with no usable `Seek`.
pub struct CountingWriter<W> {
    inner: W,
    written: u64
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> CountingWriter<W> {
        CountingWriter { inner, written: 0 }
    }

    /// Bytes written so far, which is the offset the next byte will land at.
    pub fn position(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_partial_and_whole_writes() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"PK\x03\x04").unwrap();
        assert_eq!(writer.position(), 4);
        let n = writer.write(&[0; 26]).unwrap();
        assert_eq!(writer.position(), n as u64 + 4);
        assert_eq!(writer.into_inner().len(), 30);
    }
}
