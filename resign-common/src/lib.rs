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

use std::{fmt, io, sync::Arc};

use deku::DekuError;
use thiserror::Error;

/// The stages of a signing job, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Ingest,
    Align,
    KeyAcquisition,
    Sign,
    Verify,
    Finalize
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingest => "ingest",
            Stage::Align => "align",
            Stage::KeyAcquisition => "key acquisition",
            Stage::Sign => "sign",
            Stage::Verify => "verify",
            Stage::Finalize => "finalize"
        };
        f.write_str(name)
    }
}

/// Something about the source archive stopped the aligner from rewriting it.
///
/// Any of these means the partial output must be thrown away.
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    /// No End Of Central Directory record in the last 64KiB of the file, so
    /// this is not a ZIP-family container at all.
    #[error("no end of central directory record found")]
    MissingEndOfCentralDirectory,
    /// The archive ended in the middle of a structure.
    #[error("archive is truncated inside {0}")]
    Truncated(String),
    /// A record was present but did not parse, or its fields contradict
    /// each other (e.g. a central directory that points past the end of
    /// the file).
    #[error("malformed {context}: {detail}")]
    Malformed { context: String, detail: String },
    /// ZIP64 size or offset markers were found. Those archives are out of
    /// scope for re-alignment.
    #[error("ZIP64 archives are not supported")]
    Zip64Unsupported,
    /// Reading the source or writing the output failed.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>)
}

impl ArchiveError {
    pub fn malformed(context: impl Into<String>, detail: impl fmt::Display) -> ArchiveError {
        ArchiveError::Malformed {
            context: context.into(),
            detail: detail.to_string()
        }
    }
}

/// A keystore's bytes were obtained but could not be turned into key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyStoreError {
    /// Not a keystore, or the contents are damaged past the integrity check.
    #[error("keystore is corrupt: {0}")]
    Corrupt(String),
    /// The integrity digest did not match. The JKS format can't tell a wrong
    /// password apart from tampered bytes, so this is reported as a
    /// credential problem.
    #[error("keystore password was rejected, or the keystore was tampered with")]
    StorePassword,
    /// The keystore opened but the private key entry did not decrypt.
    #[error("key password for alias '{alias}' was rejected")]
    KeyPassword { alias: String },
    #[error("alias '{alias}' not found in keystore")]
    AliasNotFound { alias: String },
    /// The alias exists but holds no certificates to sign with.
    #[error("alias '{alias}' has an empty certificate chain")]
    EmptyChain { alias: String }
}

impl KeyStoreError {
    /// True when the bytes were fine but a password was wrong.
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            KeyStoreError::StorePassword | KeyStoreError::KeyPassword { .. }
        )
    }

    /// True when the keystore opened but the named entry is unusable.
    pub fn is_missing_entry(&self) -> bool {
        matches!(
            self,
            KeyStoreError::AliasNotFound { .. } | KeyStoreError::EmptyChain { .. }
        )
    }
}

/// A key source could not be reached or read.
#[derive(Debug, Clone, Error)]
#[error("{origin}: {detail}")]
pub struct KeySourceError {
    pub origin: String,
    pub detail: String
}

/// An external signing or verification tool failed to run or reported an
/// error.
#[derive(Debug, Clone, Error)]
#[error("{tool}: {detail}")]
pub struct ToolFailure {
    pub tool: String,
    pub detail: String
}

/// The terminal error of a signing job.
///
/// Every stage maps its own failures onto exactly one of these, so callers
/// can branch on the kind instead of on message text.
#[derive(Debug, Clone, Error)]
pub enum ResignError {
    /// The caller's stream couldn't be read or the scratch copy couldn't be
    /// written (e.g. the disk is full).
    #[error("could not copy the source archive: {0}")]
    Ingest(Arc<io::Error>),
    #[error("archive could not be aligned: {0}")]
    Align(#[from] ArchiveError),
    /// Every key source was absent, unreachable or returned corrupt bytes.
    /// Holds one line per source tried.
    #[error("no key source produced a usable keystore ({})", .0.join("; "))]
    KeyUnavailable(Vec<String>),
    /// Keystore bytes were obtained but the store or key password is wrong.
    #[error("keystore from {origin} rejected the credentials: {cause}")]
    KeyCredential { origin: String, cause: KeyStoreError },
    /// The keystore opened but the alias is absent or its chain is empty.
    #[error("keystore from {origin} has no usable key: {cause}")]
    KeyAliasNotFound { origin: String, cause: KeyStoreError },
    #[error("signing failed: {0}")]
    Sign(ToolFailure),
    /// The verifier rejected the output, could not run, or verified it
    /// under a different set of schemes than was requested.
    #[error("signature verification failed: {0}")]
    Verification(String),
    /// The verified archive couldn't be moved into the output directory.
    /// Whatever was there before is left as it was.
    #[error("could not write the signed archive: {0}")]
    Publish(Arc<io::Error>),
    /// Removing a scratch file failed. Only ever logged.
    #[error("cleanup failed: {0}")]
    Cleanup(Arc<io::Error>),
    /// The configuration file or flags were invalid. Raised before any
    /// stage runs.
    #[error("configuration error: {0}")]
    Config(String)
}

impl ResignError {
    /// The stage this error terminates, or `None` for configuration errors.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ResignError::Ingest(_) => Some(Stage::Ingest),
            ResignError::Align(_) => Some(Stage::Align),
            ResignError::KeyUnavailable(_)
            | ResignError::KeyCredential { .. }
            | ResignError::KeyAliasNotFound { .. } => Some(Stage::KeyAcquisition),
            ResignError::Sign(_) => Some(Stage::Sign),
            ResignError::Verification(_) => Some(Stage::Verify),
            ResignError::Publish(_) | ResignError::Cleanup(_) => Some(Stage::Finalize),
            ResignError::Config(_) => None
        }
    }

    /// Sorts a keystore load failure into the credential or missing-entry
    /// bucket. Corrupt bytes are not a terminal error on their own; the
    /// caller keeps trying other sources.
    pub fn from_keystore(origin: impl Into<String>, cause: KeyStoreError) -> ResignError {
        let origin = origin.into();
        if cause.is_missing_entry() {
            ResignError::KeyAliasNotFound { origin, cause }
        } else if cause.is_credential() {
            ResignError::KeyCredential { origin, cause }
        } else {
            ResignError::KeyUnavailable(vec![format!("{origin}: {cause}")])
        }
    }
}

/// Result type where the error is always [ResignError].
pub type Result<T> = std::result::Result<T, ResignError>;

// Automatic conversion from other types of error makes the aligner cleaner
impl From<io::Error> for ArchiveError {
    fn from(value: io::Error) -> Self {
        ArchiveError::Io(value.into())
    }
}

impl From<DekuError> for ArchiveError {
    fn from(value: DekuError) -> Self {
        match value {
            DekuError::Incomplete(_) => ArchiveError::Truncated("a ZIP record".into()),
            other => ArchiveError::malformed("ZIP record", other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystore_errors_sort_into_taxonomy() {
        let wrong_key = KeyStoreError::KeyPassword {
            alias: "release".into()
        };
        let err = ResignError::from_keystore("cache", wrong_key);
        assert!(matches!(err, ResignError::KeyCredential { .. }));
        assert_eq!(err.stage(), Some(Stage::KeyAcquisition));

        let missing = KeyStoreError::EmptyChain {
            alias: "release".into()
        };
        assert!(matches!(
            ResignError::from_keystore("bundled", missing),
            ResignError::KeyAliasNotFound { .. }
        ));

        let corrupt = KeyStoreError::Corrupt("bad magic".into());
        assert!(matches!(
            ResignError::from_keystore("remote", corrupt),
            ResignError::KeyUnavailable(_)
        ));
    }

    #[test]
    fn publish_failure_ends_finalize() {
        let err = ResignError::Publish(Arc::new(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert_eq!(err.stage(), Some(Stage::Finalize));
        assert!(err.to_string().starts_with("could not write the signed archive"));
    }

    #[test]
    fn unavailable_lists_every_source() {
        let err = ResignError::KeyUnavailable(vec!["cache: absent".into(), "remote: 404".into()]);
        assert_eq!(
            err.to_string(),
            "no key source produced a usable keystore (cache: absent; remote: 404)"
        );
    }
}
