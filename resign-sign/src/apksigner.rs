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

//! [Signer] and [Verifier] backed by the Android SDK's `apksigner` tool.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Output}
};

use resign_common::ToolFailure;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{
    crypto_keys::KeyMaterial,
    signer::{SchemeSet, SignRequest, Signer, Verdict, Verifier}
};

const TOOL: &str = "apksigner";
const KEY_FILE: &str = "key.pk8";
const CERT_FILE: &str = "chain.pem";

#[derive(Debug, Clone)]
pub struct ApkSigner {
    /// Path to (or bare name of) the `apksigner` executable.
    pub program: PathBuf,
    pub min_sdk_version: Option<u32>
}

impl Default for ApkSigner {
    fn default() -> ApkSigner {
        ApkSigner {
            program: PathBuf::from(TOOL),
            min_sdk_version: None
        }
    }
}

impl ApkSigner {
    pub fn new(program: impl Into<PathBuf>) -> ApkSigner {
        ApkSigner {
            program: program.into(),
            min_sdk_version: None
        }
    }

    fn sign_args(&self, request: &SignRequest<'_>, key: &Path, cert: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "sign".into(),
            "--key".into(),
            key.into(),
            "--cert".into(),
            cert.into(),
        ];
        let schemes = request.schemes;
        for (version, enabled) in [
            (1, schemes.v1),
            (2, schemes.v2),
            (3, schemes.v3),
            (4, schemes.v4)
        ] {
            args.push(format!("--v{version}-signing-enabled").into());
            args.push(enabled.to_string().into());
        }
        if let Some(min_sdk) = self.min_sdk_version {
            args.push("--min-sdk-version".into());
            args.push(min_sdk.to_string().into());
        }
        args.push("--in".into());
        args.push(request.input.clone().into());
        args.push("--out".into());
        args.push(request.output.clone().into());
        args
    }

    fn run(&self, args: &[OsString]) -> Result<Output, ToolFailure> {
        debug!("running {} {:?}", self.program.display(), args);
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| failure(format!("could not run {}: {e}", self.program.display())))
    }
}

impl Signer for ApkSigner {
    fn sign(&self, request: &SignRequest<'_>) -> Result<(), ToolFailure> {
        // Key files live only as long as this call
        let key_dir = TempDir::new().map_err(|e| failure(format!("creating key directory: {e}")))?;
        let (key_path, cert_path) = request
            .key
            .write_apksigner_files(key_dir.path())
            .map_err(|e| failure(format!("writing key material: {e}")))?;

        let output = self.run(&self.sign_args(request, &key_path, &cert_path))?;
        if !output.status.success() {
            return Err(failure(format!(
                "sign exited with {}: {}",
                output.status,
                last_lines(&output.stderr)
            )));
        }
        if let Err(e) = key_dir.close() {
            warn!("could not remove temporary key files: {e}");
        }
        Ok(())
    }
}

impl Verifier for ApkSigner {
    fn verify(&self, path: &Path) -> Result<Verdict, ToolFailure> {
        let args: Vec<OsString> = vec!["verify".into(), "--verbose".into(), path.into()];
        let output = self.run(&args)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        // apksigner exits non-zero for a bad signature too; only treat it as
        // a tool failure when it never got as far as a verdict
        let combined = format!("{stdout}\n{stderr}");
        match parse_verify_output(&combined) {
            Some(verdict) => Ok(verdict),
            None => Err(failure(format!(
                "verify exited with {} without a verdict: {}",
                output.status,
                last_lines(&output.stderr)
            )))
        }
    }
}

/// Reads the report `apksigner verify --verbose` prints. Returns `None` if
/// there's no "Verifies" / "DOES NOT VERIFY" line.
pub fn parse_verify_output(output: &str) -> Option<Verdict> {
    let mut verdict = Verdict {
        schemes: SchemeSet::NONE,
        ..Default::default()
    };
    let mut decided = false;

    for line in output.lines().map(str::trim) {
        if line == "Verifies" {
            verdict.verified = true;
            decided = true;
        } else if line == "DOES NOT VERIFY" {
            verdict.verified = false;
            decided = true;
        } else if let Some(error) = line.strip_prefix("ERROR: ") {
            verdict.errors.push(error.into());
        } else if let Some(warning) = line.strip_prefix("WARNING: ") {
            verdict.warnings.push(warning.into());
        } else if let Some(rest) = line.strip_prefix("Verified using v") {
            // e.g. "Verified using v2 scheme (APK Signature Scheme v2): true"
            let Some((version, _)) = rest.split_once(' ') else {
                continue;
            };
            let confirmed = line.ends_with(": true");
            match version {
                "1" => verdict.schemes.v1 = confirmed,
                "2" => verdict.schemes.v2 = confirmed,
                "3" => verdict.schemes.v3 = confirmed,
                "4" => verdict.schemes.v4 = confirmed,
                // v3.1 and friends are refinements of a scheme we track
                _ => {}
            }
        }
    }

    // A verdict with errors never counts as verified
    if !verdict.errors.is_empty() {
        verdict.verified = false;
    }
    decided.then_some(verdict)
}

fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file: File = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

fn last_lines(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    match lines[start..].join(" | ") {
        joined if joined.is_empty() => "no output".into(),
        joined => joined
    }
}

fn failure(detail: String) -> ToolFailure {
    ToolFailure {
        tool: TOOL.into(),
        detail
    }
}

impl KeyMaterial {
    /// Writes the key as `key.pk8` and the chain as `chain.pem` into
    /// `directory`, readable by the owner only.
    pub fn write_apksigner_files(&self, directory: &Path) -> io::Result<(PathBuf, PathBuf)> {
        let key_path = directory.join(KEY_FILE);
        let cert_path = directory.join(CERT_FILE);
        write_private(&key_path, self.private_key_der())?;
        write_private(&cert_path, self.chain_pem().as_bytes())?;
        Ok((key_path, cert_path))
    }
}
