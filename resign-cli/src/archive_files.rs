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

use resign_api::{ArchiveError, ResignError, Result};
use resign_zip::{AlignReport, EntryAlignment};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::Path
};
use tracing::warn;

/// Aligns `input` into `output`. A partial output is deleted on failure.
pub fn align_file(input: &Path, output: &Path) -> Result<AlignReport> {
    if input == output {
        return Err(ResignError::Config(
            "input and output must be different files".into()
        ));
    }
    let mut source = BufReader::new(File::open(input).map_err(ArchiveError::from)?);
    let destination = BufWriter::new(File::create(output).map_err(ArchiveError::from)?);

    resign_zip::align(&mut source, destination).map_err(|e| {
        if let Err(remove_err) = fs::remove_file(output) {
            warn!("Could not remove partial output {}: {remove_err}", output.display());
        }
        e.into()
    })
}

pub fn check_file(path: &Path) -> Result<Vec<EntryAlignment>> {
    let mut source = BufReader::new(File::open(path).map_err(ArchiveError::from)?);
    Ok(resign_zip::check_alignment(&mut source)?)
}
