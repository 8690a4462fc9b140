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

use archive_files::{align_file, check_file};
use clap::{Parser, Subcommand};
use resign_api::{Pipeline, ResignConfig, ResignError, Result};
use std::{
    fs::File,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod archive_files;

/// Aligns, signs and verifies APKs.
///
/// ```
/// $ resign sign app-release-unsigned.apk --config resign.toml
/// 12:00:01 [ingest] Copying source archive...
/// ...
/// Signed signed/app-release-unsigned_signed.apk (v2+v3)
/// ```
///
/// Keystore passwords are read from `RESIGN_STORE_PASSWORD` and
/// `RESIGN_KEY_PASSWORD` when set. Set `RUST_LOG=debug` for per-entry
/// detail.
#[derive(Parser, Debug)]
#[command(name = "resign", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Align, sign and verify an APK.
    Sign {
        apk: PathBuf,
        /// TOML configuration file. Built-in defaults when absent.
        #[arg(short, long, env = "RESIGN_CONFIG")]
        config: Option<PathBuf>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Keystore entry to sign with.
        #[arg(long)]
        alias: Option<String>,
        #[arg(long)]
        v1_signing_enabled: Option<bool>,
        #[arg(long)]
        v2_signing_enabled: Option<bool>,
        #[arg(long)]
        v3_signing_enabled: Option<bool>,
        #[arg(long)]
        v4_signing_enabled: Option<bool>
    },
    /// Align an archive without signing it.
    Align { input: PathBuf, output: PathBuf },
    /// Report the data offset of every entry; fails if a stored entry is
    /// misaligned.
    Check { apk: PathBuf }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Sign {
            apk,
            config,
            output_dir,
            alias,
            v1_signing_enabled,
            v2_signing_enabled,
            v3_signing_enabled,
            v4_signing_enabled
        } => load_config(config.as_deref()).and_then(|mut config| {
            if let Some(output_dir) = output_dir {
                config.output_dir = output_dir;
            }
            if let Some(alias) = alias {
                config.keystore.alias = alias;
            }
            let schemes = &mut config.schemes;
            schemes.v1 = v1_signing_enabled.unwrap_or(schemes.v1);
            schemes.v2 = v2_signing_enabled.unwrap_or(schemes.v2);
            schemes.v3 = v3_signing_enabled.unwrap_or(schemes.v3);
            schemes.v4 = v4_signing_enabled.unwrap_or(schemes.v4);
            config.validate().map_err(ResignError::Config)?;
            sign(&apk, config)
        }),
        Command::Align { input, output } => align_file(&input, &output).map(|report| {
            println!(
                "Aligned {} entries into {} ({} padding bytes)",
                report.entries.len(),
                output.display(),
                report.padding_added
            );
            true
        }),
        Command::Check { apk } => check(&apk)
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ResignConfig> {
    let mut config = match path {
        Some(path) => ResignConfig::load(path)?,
        None => ResignConfig::default()
    };
    config.apply_env();
    Ok(config)
}

fn sign(apk: &Path, config: ResignConfig) -> Result<bool> {
    let source = File::open(apk).map_err(|e| ResignError::Ingest(Arc::new(e)))?;
    let display_name = apk
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let pipeline = Arc::new(Pipeline::new(config)?);
    let job = pipeline.spawn(Box::new(source), display_name);
    for event in job.events() {
        println!("{} {event}", chrono::Local::now().format("%H:%M:%S"));
    }

    let result = job.join();
    println!("{}", result.message);
    Ok(result.success)
}

fn check(apk: &Path) -> Result<bool> {
    let entries = check_file(apk)?;
    let mut aligned = true;
    for entry in &entries {
        let status = match (entry.stored, entry.is_aligned()) {
            (false, _) => "compressed",
            (true, true) => "OK",
            (true, false) => "BAD"
        };
        println!("{:>10}  {}  {}", entry.data_offset, status, entry.name);
        aligned &= entry.is_aligned();
    }
    println!(
        "Verification {}",
        if aligned { "successful" } else { "FAILED" }
    );
    Ok(aligned)
}
