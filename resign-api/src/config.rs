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

//! Pipeline settings, read from a TOML file.
//!
//! ```toml
//! output_dir = "signed"
//!
//! [keystore]
//! alias = "release"
//! store_password = "..."
//! cache_path = "keystore-cache/release.jks"
//! bundled_dir = "resources"
//! remote_url = "https://keys.example.com/release.jks"
//!
//! [schemes]
//! v1 = true
//! ```
//!
//! Every field is optional. Passwords are better passed through the
//! `RESIGN_STORE_PASSWORD` and `RESIGN_KEY_PASSWORD` environment variables
//! than written to the file.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration
};

use resign_common::{ResignError, Result};
use resign_sign::{ApkSigner, BundledResource, KeyChain, KeyCredentials, RemoteUrl, SchemeSet};
use serde::{Deserialize, Serialize};

pub const STORE_PASSWORD_ENV: &str = "RESIGN_STORE_PASSWORD";
pub const KEY_PASSWORD_ENV: &str = "RESIGN_KEY_PASSWORD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResignConfig {
    /// Where signed archives are written. Created if missing.
    pub output_dir: PathBuf,
    /// Parent of the per-job scratch directories. The system temp
    /// directory when unset.
    pub scratch_dir: Option<PathBuf>,
    pub keystore: KeystoreConfig,
    pub schemes: SchemeSet,
    pub apksigner: ApkSignerConfig
}

impl Default for ResignConfig {
    fn default() -> ResignConfig {
        ResignConfig {
            output_dir: PathBuf::from("signed"),
            scratch_dir: None,
            keystore: KeystoreConfig::default(),
            schemes: SchemeSet::default(),
            apksigner: ApkSignerConfig::default()
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeystoreConfig {
    pub alias: String,
    pub store_password: String,
    /// Falls back to the store password, which is what `keytool` does when
    /// no separate key password is given.
    pub key_password: Option<String>,
    pub cache_path: PathBuf,
    pub bundled_dir: Option<PathBuf>,
    pub bundled_name: String,
    pub remote_url: Option<String>,
    pub fetch_timeout_secs: u64,
    pub discard_stale_cache: bool
}

impl Default for KeystoreConfig {
    fn default() -> KeystoreConfig {
        KeystoreConfig {
            alias: "release".into(),
            store_password: String::new(),
            key_password: None,
            cache_path: PathBuf::from("keystore-cache").join("release.jks"),
            bundled_dir: None,
            bundled_name: "release.jks".into(),
            remote_url: None,
            fetch_timeout_secs: 30,
            discard_stale_cache: true
        }
    }
}

impl fmt::Debug for KeystoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreConfig")
            .field("alias", &self.alias)
            .field("cache_path", &self.cache_path)
            .field("bundled_dir", &self.bundled_dir)
            .field("bundled_name", &self.bundled_name)
            .field("remote_url", &self.remote_url)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("discard_stale_cache", &self.discard_stale_cache)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApkSignerConfig {
    pub program: PathBuf,
    pub min_sdk_version: Option<u32>
}

impl Default for ApkSignerConfig {
    fn default() -> ApkSignerConfig {
        let ApkSigner {
            program,
            min_sdk_version
        } = ApkSigner::default();
        ApkSignerConfig {
            program,
            min_sdk_version
        }
    }
}

impl ResignConfig {
    /// Reads and validates a config file. Environment overrides are not
    /// applied; see [ResignConfig::apply_env].
    pub fn load(path: &Path) -> Result<ResignConfig> {
        let text = fs::read_to_string(path)
            .map_err(|e| ResignError::Config(format!("reading {}: {e}", path.display())))?;
        let config = ResignConfig::from_toml_str(&text)
            .map_err(|e| ResignError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> std::result::Result<ResignConfig, String> {
        let config: ResignConfig = toml::from_str(text).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Fills passwords from [STORE_PASSWORD_ENV] and [KEY_PASSWORD_ENV].
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Like [ResignConfig::apply_env], with a caller-supplied lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(STORE_PASSWORD_ENV) {
            self.keystore.store_password = password;
        }
        if let Some(password) = lookup(KEY_PASSWORD_ENV) {
            self.keystore.key_password = Some(password);
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.schemes.has_block_scheme() {
            return Err(format!(
                "schemes {} leave out both v2 and v3; at least one is required",
                self.schemes
            ));
        }
        if self.keystore.alias.trim().is_empty() {
            return Err("keystore alias must not be empty".into());
        }
        if self.keystore.fetch_timeout_secs == 0 {
            return Err("keystore fetch_timeout_secs must be positive".into());
        }
        Ok(())
    }

    pub fn key_credentials(&self) -> KeyCredentials {
        let keystore = &self.keystore;
        KeyCredentials {
            alias: keystore.alias.clone(),
            store_password: keystore.store_password.clone(),
            key_password: keystore
                .key_password
                .clone()
                .unwrap_or_else(|| keystore.store_password.clone())
        }
    }

    /// Cache, then the bundled resource, then the remote URL, skipping the
    /// ones that aren't configured.
    pub fn key_chain(&self) -> KeyChain {
        let keystore = &self.keystore;
        let mut chain = KeyChain::new(&keystore.cache_path, self.key_credentials())
            .discard_stale_cache(keystore.discard_stale_cache);
        if let Some(directory) = &keystore.bundled_dir {
            chain = chain.with_source(BundledResource::new(directory, &keystore.bundled_name));
        }
        if let Some(url) = &keystore.remote_url {
            chain = chain.with_source(RemoteUrl::new(
                url,
                Duration::from_secs(keystore.fetch_timeout_secs)
            ));
        }
        chain
    }

    pub fn apksigner(&self) -> ApkSigner {
        ApkSigner {
            program: self.apksigner.program.clone(),
            min_sdk_version: self.apksigner.min_sdk_version
        }
    }
}
