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

use std::{fmt, path::PathBuf};

use resign_common::ToolFailure;
use serde::{Deserialize, Serialize};

use crate::crypto_keys::KeyMaterial;

/// Which APK signature schemes to apply (or that a verifier accepted).
///
/// v1 is JAR signing. v2 and v3 are the APK Signing Block schemes. v4 writes
/// a separate `.idsig` file for incremental installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemeSet {
    pub v1: bool,
    pub v2: bool,
    pub v3: bool,
    pub v4: bool
}

impl Default for SchemeSet {
    // Devices older than Android 7 are not a target, so v1 stays off
    fn default() -> SchemeSet {
        SchemeSet {
            v1: false,
            v2: true,
            v3: true,
            v4: false
        }
    }
}

impl SchemeSet {
    pub const NONE: SchemeSet = SchemeSet {
        v1: false,
        v2: false,
        v3: false,
        v4: false
    };

    /// True if v2 or v3 is set.
    pub fn has_block_scheme(&self) -> bool {
        self.v2 || self.v3
    }

    pub fn is_empty(&self) -> bool {
        *self == SchemeSet::NONE
    }

    /// True if every scheme set here is also set in `verified`.
    pub fn is_satisfied_by(&self, verified: &SchemeSet) -> bool {
        (!self.v1 || verified.v1)
            && (!self.v2 || verified.v2)
            && (!self.v3 || verified.v3)
            && (!self.v4 || verified.v4)
    }

    fn names(&self) -> Vec<&'static str> {
        [
            (self.v1, "v1"),
            (self.v2, "v2"),
            (self.v3, "v3"),
            (self.v4, "v4")
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

impl fmt::Display for SchemeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join("+"))
    }
}

/// Everything a [Signer] needs for one call.
#[derive(Debug)]
pub struct SignRequest<'a> {
    pub input: PathBuf,
    pub output: PathBuf,
    pub key: &'a KeyMaterial,
    pub schemes: SchemeSet
}

/// Applies signatures to an aligned archive, writing a new file.
pub trait Signer: Send + Sync {
    fn sign(&self, request: &SignRequest<'_>) -> Result<(), ToolFailure>;
}

/// Checks the signatures on a signed archive.
///
/// `Err` means the verifier could not run; a signature that doesn't check
/// out is an `Ok` verdict with `verified` unset.
pub trait Verifier: Send + Sync {
    fn verify(&self, path: &std::path::Path) -> Result<Verdict, ToolFailure>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub verified: bool,
    /// Schemes the verifier confirmed.
    pub schemes: SchemeSet,
    pub errors: Vec<String>,
    pub warnings: Vec<String>
}

impl Verdict {
    /// Accepts the verdict only if it verified under every scheme in
    /// `requested`. A v1-only result when v2 was asked for is a downgrade,
    /// not a pass.
    pub fn check(&self, requested: &SchemeSet) -> Result<(), String> {
        if !self.verified {
            let reason = match self.errors.first() {
                Some(first) => first.clone(),
                None => "verifier rejected the signature".into()
            };
            return Err(reason);
        }
        if !requested.is_satisfied_by(&self.schemes) {
            return Err(format!(
                "requested schemes {requested} but only {} verified",
                self.schemes
            ));
        }
        Ok(())
    }
}
