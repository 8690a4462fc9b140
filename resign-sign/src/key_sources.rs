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

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration
};

use base64::Engine;
use reqwest::StatusCode;
use resign_common::KeySourceError;
use tracing::debug;

/// Somewhere keystore bytes can come from.
///
/// Sources only fetch bytes. Loading them, caching them and deciding which
/// failure to report is the job of [crate::KeyChain].
pub trait KeySource: Send + Sync {
    /// Short human-readable name used in errors and logs.
    fn label(&self) -> String;

    /// `Ok(None)` means the source has nothing to offer (no file, 404),
    /// as opposed to `Err`, where it could not be asked at all.
    fn fetch(&self) -> Result<Option<Vec<u8>>, KeySourceError>;
}

/// A keystore shipped alongside the tool.
///
/// Files ending in `.b64` hold the keystore as Base64 text, which survives
/// being checked into places that mangle binary files.
pub struct BundledResource {
    pub directory: PathBuf,
    pub name: String
}

impl BundledResource {
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>) -> BundledResource {
        BundledResource {
            directory: directory.into(),
            name: name.into()
        }
    }

    fn path(&self) -> PathBuf {
        // Only the file name counts, so a resource can't escape its directory
        let file_name = Path::new(&self.name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default();
        self.directory.join(file_name)
    }

    fn error(&self, detail: impl ToString) -> KeySourceError {
        KeySourceError {
            origin: self.label(),
            detail: detail.to_string()
        }
    }
}

impl KeySource for BundledResource {
    fn label(&self) -> String {
        format!("bundled resource {}", self.path().display())
    }

    fn fetch(&self) -> Result<Option<Vec<u8>>, KeySourceError> {
        let path = self.path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no bundled keystore at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(self.error(e))
        };

        if path.extension().is_some_and(|ext| ext == "b64") {
            let text: Vec<u8> = bytes
                .into_iter()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(text)
                .map_err(|e| self.error(format!("invalid Base64: {e}")))?;
            return Ok(Some(decoded));
        }
        Ok(Some(bytes))
    }
}

/// A keystore downloaded over HTTP(S) with a plain GET.
pub struct RemoteUrl {
    pub url: String,
    pub timeout: Duration
}

impl RemoteUrl {
    pub fn new(url: impl Into<String>, timeout: Duration) -> RemoteUrl {
        RemoteUrl {
            url: url.into(),
            timeout
        }
    }

    fn error(&self, detail: impl ToString) -> KeySourceError {
        KeySourceError {
            origin: self.label(),
            detail: detail.to_string()
        }
    }
}

impl KeySource for RemoteUrl {
    fn label(&self) -> String {
        format!("remote {}", self.url)
    }

    fn fetch(&self) -> Result<Option<Vec<u8>>, KeySourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| self.error(format!("http client error: {e}")))?;

        debug!("fetching keystore from {}", self.url);
        let response = client
            .get(&self.url)
            .send()
            .map_err(|e| self.error(format!("request failed: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(self.error(format!("server returned {}", response.status())));
        }

        let bytes = response
            .bytes()
            .map_err(|e| self.error(format!("reading response: {e}")))?;
        Ok(Some(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_bundled_file_is_absent_not_an_error() {
        let dir = TempDir::new().unwrap();
        let source = BundledResource::new(dir.path(), "release.jks");
        assert_eq!(source.fetch().unwrap(), None);
    }

    #[test]
    fn reads_raw_and_base64_resources() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("release.jks"), [0xFE, 0xED, 0xFE, 0xED]).unwrap();
        fs::write(dir.path().join("release.jks.b64"), "/u3+\n7Q==\n").unwrap();

        let raw = BundledResource::new(dir.path(), "release.jks");
        assert_eq!(raw.fetch().unwrap(), Some(vec![0xFE, 0xED, 0xFE, 0xED]));
        let encoded = BundledResource::new(dir.path(), "release.jks.b64");
        assert_eq!(encoded.fetch().unwrap(), Some(vec![0xFE, 0xED, 0xFE, 0xED]));
    }

    #[test]
    fn bad_base64_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("release.b64"), "not base64 at all!").unwrap();
        let err = BundledResource::new(dir.path(), "release.b64")
            .fetch()
            .unwrap_err();
        assert!(err.to_string().contains("invalid Base64"));
    }

    #[test]
    fn resource_name_cannot_leave_directory() {
        let dir = TempDir::new().unwrap();
        let source = BundledResource::new(dir.path(), "../../etc/passwd");
        assert_eq!(source.path(), dir.path().join("passwd"));
    }

    #[test]
    fn unreachable_remote_is_an_error() {
        // Port 9 (discard) on localhost is closed on any sane test machine
        let source = RemoteUrl::new("http://127.0.0.1:9/release.jks", Duration::from_secs(2));
        let err = source.fetch().unwrap_err();
        assert!(err.origin.starts_with("remote "));
    }
}
