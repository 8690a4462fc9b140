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

//! # resign API
//!
//! Takes an APK from any byte stream, aligns it, signs it with a key found
//! through the configured key chain and verifies the result.
//!
//! ## Signing an APK
//!
//! ```no_run
//! use std::{fs::File, sync::Arc};
//! use resign_api::{Pipeline, ResignConfig};
//!
//! let pipeline = Arc::new(Pipeline::new(ResignConfig::default())?);
//! let source = File::open("app-release-unsigned.apk")?;
//! let job = pipeline.spawn(Box::new(source), "app-release-unsigned.apk".into());
//! for event in job.events() {
//!     println!("{event}");
//! }
//! let result = job.join();
//! println!("{}", result.message);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The job runs on its own thread. Progress arrives over a channel and the
//! [PipelineResult] comes back from [JobHandle::join].

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver},
        Arc
    },
    thread::{self, JoinHandle}
};

use resign_sign::{KeyChain, KeyMaterial, SignRequest, Signer, Verifier};
use resign_zip::{align, check_alignment};
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};

pub use config::ResignConfig;
pub use progress::{LogSink, NullSink, ProgressEvent, ProgressKind, ProgressSink, SinkClosed};
pub use resign_common::{ArchiveError, KeyStoreError, ResignError, Result, Stage};
pub use resign_sign::SchemeSet;

pub mod config;
pub mod progress;

const INPUT_FILE: &str = "input.apk";
const ALIGNED_FILE: &str = "aligned.apk";
const SIGNED_FILE: &str = "signed.apk";
const V4_SIGNATURE_SUFFIX: &str = ".idsig";

/// The outcome of one job.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    /// One line for people.
    pub message: String,
    /// The signed archive, set only on success.
    pub output_path: Option<PathBuf>,
    /// What went wrong, set only on failure.
    pub error: Option<ResignError>
}

impl PipelineResult {
    fn from_outcome(outcome: Result<PathBuf>, schemes: &SchemeSet) -> PipelineResult {
        match outcome {
            Ok(path) => PipelineResult {
                success: true,
                message: format!("Signed {} ({schemes})", path.display()),
                output_path: Some(path),
                error: None
            },
            Err(error) => {
                let message = match error.stage() {
                    Some(stage) => format!("Failed at {stage}: {error}"),
                    None => format!("Failed: {error}")
                };
                PipelineResult {
                    success: false,
                    message,
                    output_path: None,
                    error: Some(error)
                }
            }
        }
    }
}

/// A job running on a worker thread.
pub struct JobHandle {
    events: Receiver<ProgressEvent>,
    worker: JoinHandle<PipelineResult>
}

impl JobHandle {
    /// Progress as it happens. Iterating ends once the job is done.
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Blocks until the job finishes.
    pub fn join(self) -> PipelineResult {
        self.worker.join().unwrap_or_else(|_| PipelineResult {
            success: false,
            message: "Signing job panicked".into(),
            output_path: None,
            error: None
        })
    }
}

/// Runs the ingest, align, key, sign, verify and finalize stages in order,
/// one job at a time per call.
///
/// Jobs share nothing but the key chain, which serializes access to its
/// cache, so one pipeline can run several jobs at once.
pub struct Pipeline {
    config: ResignConfig,
    key_chain: KeyChain,
    signer: Box<dyn Signer>,
    verifier: Box<dyn Verifier>
}

impl Pipeline {
    /// Uses `apksigner` for signing and verification and builds the key chain
    /// from `config`.
    pub fn new(config: ResignConfig) -> Result<Pipeline> {
        let key_chain = config.key_chain();
        let apksigner = config.apksigner();
        Pipeline::with_collaborators(config, key_chain, apksigner.clone(), apksigner)
    }

    pub fn with_collaborators(
        config: ResignConfig,
        key_chain: KeyChain,
        signer: impl Signer + 'static,
        verifier: impl Verifier + 'static
    ) -> Result<Pipeline> {
        config.validate().map_err(ResignError::Config)?;
        Ok(Pipeline {
            config,
            key_chain,
            signer: Box::new(signer),
            verifier: Box::new(verifier)
        })
    }

    pub fn config(&self) -> &ResignConfig {
        &self.config
    }

    /// Runs a job on a new thread.
    pub fn spawn(self: &Arc<Self>, source: Box<dyn Read + Send>, display_name: String) -> JobHandle {
        let (sender, events) = mpsc::channel();
        let pipeline = Arc::clone(self);
        let worker = thread::spawn(move || {
            let mut source = source;
            pipeline.run(&mut source, &display_name, &sender)
        });
        JobHandle { events, worker }
    }

    /// Runs a job on the calling thread.
    ///
    /// `display_name` is the name the caller knows the archive by; the
    /// output file name is derived from it.
    pub fn run(&self, source: &mut dyn Read, display_name: &str, sink: &dyn ProgressSink) -> PipelineResult {
        info!(name = display_name, "Starting signing job");
        let outcome = self.execute(source, display_name, sink);
        match &outcome {
            Ok(path) => info!(output = %path.display(), "Signing job succeeded"),
            Err(e) => warn!(stage = ?e.stage(), "Signing job failed: {e}")
        }
        PipelineResult::from_outcome(outcome, &self.config.schemes)
    }

    fn execute(&self, source: &mut dyn Read, display_name: &str, sink: &dyn ProgressSink) -> Result<PathBuf> {
        let scratch = self.scratch_dir().map_err(|e| ResignError::Ingest(Arc::new(e)))?;
        debug!(scratch = %scratch.path().display(), "Created scratch directory");

        let outcome = self.run_stages(scratch.path(), source, display_name, sink);

        // Scratch files go on every path; failing to remove them is not a
        // reason to fail the job
        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(scratch = %scratch_path.display(), "{}", ResignError::Cleanup(Arc::new(e)));
        }
        outcome
    }

    fn scratch_dir(&self) -> io::Result<TempDir> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("resign-job-");
            builder
        };
        match &self.config.scratch_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir()
        }
    }

    fn run_stages(
        &self,
        scratch: &Path,
        source: &mut dyn Read,
        display_name: &str,
        sink: &dyn ProgressSink
    ) -> Result<PathBuf> {
        let input = scratch.join(INPUT_FILE);
        stage(sink, Stage::Ingest, "Copying source archive", || {
            let copied = ingest(source, &input).map_err(|e| ResignError::Ingest(Arc::new(e)))?;
            detail(sink, Stage::Ingest, format!("Copied {copied} bytes"));
            Ok(())
        })?;

        let aligned = scratch.join(ALIGNED_FILE);
        stage(sink, Stage::Align, "Aligning archive", || {
            align_file(&input, &aligned, sink)
        })?;

        let key = stage(sink, Stage::KeyAcquisition, "Loading signing key", || {
            let key = self.key_chain.acquire()?;
            detail(
                sink,
                Stage::KeyAcquisition,
                format!("Using key '{}' ({})", key.alias(), key.leaf_fingerprint())
            );
            Ok(key)
        })?;

        // Signed and verified inside the scratch directory; the output
        // directory is only written once verification has passed
        let signed = scratch.join(SIGNED_FILE);
        stage(sink, Stage::Sign, "Signing", || self.sign(&aligned, &signed, &key))?;

        stage(sink, Stage::Verify, "Verifying signature", || self.verify(&signed, sink))?;

        let output = self.config.output_dir.join(output_file_name(display_name));
        stage(sink, Stage::Finalize, "Finishing", || {
            publish(&signed, &output).map_err(|e| ResignError::Publish(Arc::new(e)))?;
            detail(sink, Stage::Finalize, format!("Wrote {}", output.display()));
            Ok(())
        })?;
        Ok(output)
    }

    fn sign(&self, aligned: &Path, signed: &Path, key: &KeyMaterial) -> Result<()> {
        let request = SignRequest {
            input: aligned.to_path_buf(),
            output: signed.to_path_buf(),
            key,
            schemes: self.config.schemes
        };
        self.signer.sign(&request).map_err(ResignError::Sign)
    }

    fn verify(&self, signed: &Path, sink: &dyn ProgressSink) -> Result<()> {
        let verdict = self
            .verifier
            .verify(signed)
            .map_err(|e| ResignError::Verification(e.to_string()))?;
        for warning in &verdict.warnings {
            debug!("verifier warning: {warning}");
        }
        detail(
            sink,
            Stage::Verify,
            format!("Verified schemes: {}", verdict.schemes)
        );
        verdict
            .check(&self.config.schemes)
            .map_err(ResignError::Verification)
    }
}

/// Wraps one stage in its Started and Finished events.
fn stage<T>(
    sink: &dyn ProgressSink,
    stage: Stage,
    message: &str,
    body: impl FnOnce() -> Result<T>
) -> Result<T> {
    emit(sink, stage, ProgressKind::Started, message.into());
    let value = body()?;
    emit(sink, stage, ProgressKind::Finished, message.into());
    Ok(value)
}

fn detail(sink: &dyn ProgressSink, stage: Stage, message: String) {
    emit(sink, stage, ProgressKind::Detail, message);
}

fn emit(sink: &dyn ProgressSink, stage: Stage, kind: ProgressKind, message: String) {
    if let Err(e) = sink.report(ProgressEvent {
        stage,
        kind,
        message
    }) {
        debug!("dropping progress event: {e}");
    }
}

fn ingest(source: &mut dyn Read, destination: &Path) -> io::Result<u64> {
    let mut out = BufWriter::new(File::create(destination)?);
    let copied = io::copy(source, &mut out)?;
    out.flush()?;
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(copied)
}

fn align_file(input: &Path, aligned: &Path, sink: &dyn ProgressSink) -> Result<()> {
    let mut source = BufReader::new(File::open(input).map_err(ArchiveError::from)?);
    let output = BufWriter::new(File::create(aligned).map_err(ArchiveError::from)?);
    let report = align(&mut source, output)?;
    detail(
        sink,
        Stage::Align,
        format!(
            "{} entries, {} padding bytes added",
            report.entries.len(),
            report.padding_added
        )
    );

    // Check what actually landed on disk, not what the aligner meant to write
    let mut written = BufReader::new(File::open(aligned).map_err(ArchiveError::from)?);
    if let Some(entry) = check_alignment(&mut written)?
        .into_iter()
        .find(|entry| !entry.is_aligned())
    {
        return Err(ArchiveError::malformed(
            "aligned archive",
            format!("{} still starts at offset {}", entry.name, entry.data_offset)
        )
        .into());
    }
    Ok(())
}

/// Moves a verified archive, and its v4 signature if the signer wrote one,
/// to `output`. Each file is staged next to its destination and renamed
/// over it, so a reader never sees a partial file.
fn publish(signed: &Path, output: &Path) -> io::Result<()> {
    if let Some(directory) = output.parent() {
        fs::create_dir_all(directory)?;
    }

    // The signature goes first so the archive never appears without it
    let signature = with_suffix(signed, V4_SIGNATURE_SUFFIX);
    let published_signature = with_suffix(output, V4_SIGNATURE_SUFFIX);
    if signature.exists() {
        replace_file(&signature, &published_signature)?;
    } else {
        // One from an earlier run would not match the new archive
        match fs::remove_file(&published_signature) {
            Ok(()) => debug!("removed stale {}", published_signature.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e)
        }
    }
    replace_file(signed, output)
}

// Copies rather than renames: scratch may be on another file system
fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    let directory = match to.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new(".")
    };
    let mut staged = NamedTempFile::new_in(directory)?;
    io::copy(&mut File::open(from)?, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(to).map_err(|e| e.error)?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `app-release.apk` becomes `app-release_signed.apk`.
///
/// Only the last path component of `display_name` is used. Names without
/// an extension get `.apk`, and an empty name is treated as `unknown.apk`.
pub fn output_file_name(display_name: &str) -> String {
    let base = display_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let base = if base.is_empty() { "unknown.apk" } else { base };

    let (stem, extension) = match base.rsplit_once('.') {
        Some((stem, extension)) if !extension.is_empty() => (stem, extension),
        Some((stem, _)) => (stem, "apk"),
        None => (base, "apk")
    };
    let stem = if stem.is_empty() { "unknown" } else { stem };
    format!("{stem}_signed.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_names() {
        assert_eq!(output_file_name("app-release.apk"), "app-release_signed.apk");
        assert_eq!(output_file_name("bundle.v2.aab"), "bundle.v2_signed.aab");
        assert_eq!(output_file_name("no_extension"), "no_extension_signed.apk");
        assert_eq!(output_file_name("/home/me/Downloads/game.apk"), "game_signed.apk");
        assert_eq!(output_file_name("C:\\Users\\me\\game.apk"), "game_signed.apk");
        assert_eq!(output_file_name("../../etc/passwd"), "passwd_signed.apk");
        assert_eq!(output_file_name(""), "unknown_signed.apk");
        assert_eq!(output_file_name("dir/"), "unknown_signed.apk");
        assert_eq!(output_file_name(".apk"), "unknown_signed.apk");
        assert_eq!(output_file_name("trailing."), "trailing_signed.apk");
    }

    #[test]
    fn failure_message_names_stage() {
        let result = PipelineResult::from_outcome(
            Err(ResignError::Verification("no".into())),
            &SchemeSet::default()
        );
        assert!(!result.success);
        assert_eq!(result.message, "Failed at verify: signature verification failed: no");
        assert!(result.output_path.is_none());
    }

    #[test]
    fn publish_moves_archive_and_v4_signature() {
        let dir = TempDir::new().unwrap();
        let signed = dir.path().join("scratch").join("signed.apk");
        fs::create_dir_all(signed.parent().unwrap()).unwrap();
        fs::write(&signed, b"signed").unwrap();
        fs::write(with_suffix(&signed, V4_SIGNATURE_SUFFIX), b"v4").unwrap();

        let output = dir.path().join("out").join("app_signed.apk");
        publish(&signed, &output).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"signed");
        assert_eq!(fs::read(dir.path().join("out/app_signed.apk.idsig")).unwrap(), b"v4");
        // No staging files left behind
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 2);
    }

    #[test]
    fn publish_replaces_previous_output_and_stale_signature() {
        let dir = TempDir::new().unwrap();
        let signed = dir.path().join("signed.apk");
        fs::write(&signed, b"new").unwrap();
        let output = dir.path().join("out").join("app_signed.apk");
        fs::create_dir_all(output.parent().unwrap()).unwrap();
        fs::write(&output, b"old").unwrap();
        fs::write(with_suffix(&output, V4_SIGNATURE_SUFFIX), b"old v4").unwrap();

        publish(&signed, &output).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"new");
        assert!(!with_suffix(&output, V4_SIGNATURE_SUFFIX).exists());
    }
}
