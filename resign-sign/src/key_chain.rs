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
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex
};

use resign_common::{KeyStoreError, ResignError};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{crypto_keys::KeyMaterial, key_sources::KeySource, keystore::KeyStore};

/// What it takes to get a key out of a keystore.
#[derive(Clone)]
pub struct KeyCredentials {
    pub alias: String,
    pub store_password: String,
    pub key_password: String
}

impl fmt::Debug for KeyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCredentials")
            .field("alias", &self.alias)
            .field("store_password", &"<redacted>")
            .field("key_password", &"<redacted>")
            .finish()
    }
}

/// Finds a usable keystore: the local cache first, then each source in the
/// order it was added.
///
/// The first source whose bytes load with the configured credentials wins,
/// and those bytes replace the cache so later jobs never hit the network.
pub struct KeyChain {
    cache_path: PathBuf,
    credentials: KeyCredentials,
    sources: Vec<Box<dyn KeySource>>,
    discard_stale_cache: bool,
    // Two jobs must not race on the cache file
    lock: Mutex<()>
}

impl KeyChain {
    pub fn new(cache_path: impl Into<PathBuf>, credentials: KeyCredentials) -> KeyChain {
        KeyChain {
            cache_path: cache_path.into(),
            credentials,
            sources: vec![],
            discard_stale_cache: true,
            lock: Mutex::new(())
        }
    }

    pub fn with_source(mut self, source: impl KeySource + 'static) -> KeyChain {
        self.sources.push(Box::new(source));
        self
    }

    /// Whether a cached keystore that no longer loads gets deleted. On by
    /// default; off leaves it for someone to inspect.
    pub fn discard_stale_cache(mut self, discard: bool) -> KeyChain {
        self.discard_stale_cache = discard;
        self
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Runs the acquisition chain.
    ///
    /// When nothing loads, the most recent credential or alias failure is
    /// reported in preference to a plain [ResignError::KeyUnavailable], since
    /// it names the thing the operator has to fix.
    pub fn acquire(&self) -> Result<KeyMaterial, ResignError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tried: Vec<String> = vec![];
        let mut last_failure: Option<ResignError> = None;

        let cache_label = format!("cache {}", self.cache_path.display());
        match fs::read(&self.cache_path) {
            Ok(bytes) => match self.load(&bytes) {
                Ok(material) => {
                    info!("using cached keystore at {}", self.cache_path.display());
                    return Ok(material);
                }
                Err(cause) => {
                    warn!("cached keystore at {} is unusable: {cause}", self.cache_path.display());
                    self.record_failure(&cache_label, cause, &mut tried, &mut last_failure);
                    if self.discard_stale_cache {
                        self.remove_cache();
                    }
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no cached keystore at {}", self.cache_path.display());
            }
            Err(e) => tried.push(format!("{cache_label}: {e}"))
        }

        for source in &self.sources {
            let label = source.label();
            let bytes = match source.fetch() {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    tried.push(format!("{label}: not available"));
                    continue;
                }
                Err(e) => {
                    warn!("{e}");
                    tried.push(e.to_string());
                    continue;
                }
            };

            match self.load(&bytes) {
                Ok(material) => {
                    info!("loaded keystore from {label}");
                    if let Err(e) = self.write_cache(&bytes) {
                        warn!(
                            "could not cache keystore at {}: {e}",
                            self.cache_path.display()
                        );
                    }
                    return Ok(material);
                }
                Err(cause) => self.record_failure(&label, cause, &mut tried, &mut last_failure)
            }
        }

        Err(last_failure.unwrap_or(ResignError::KeyUnavailable(tried)))
    }

    fn load(&self, bytes: &[u8]) -> Result<KeyMaterial, KeyStoreError> {
        let store = KeyStore::load(bytes, &self.credentials.store_password)?;
        store.key_material(&self.credentials.alias, &self.credentials.key_password)
    }

    fn record_failure(
        &self,
        label: &str,
        cause: KeyStoreError,
        tried: &mut Vec<String>,
        last_failure: &mut Option<ResignError>
    ) {
        tried.push(format!("{label}: {cause}"));
        if cause.is_credential() || cause.is_missing_entry() {
            *last_failure = Some(ResignError::from_keystore(label, cause));
        }
    }

    fn remove_cache(&self) {
        match fs::remove_file(&self.cache_path) {
            Ok(()) => info!("deleted stale keystore cache {}", self.cache_path.display()),
            Err(e) => warn!(
                "could not delete stale keystore cache {}: {e}",
                self.cache_path.display()
            )
        }
    }

    // Written beside the target and renamed over it, so a reader never sees
    // half a keystore
    fn write_cache(&self, bytes: &[u8]) -> io::Result<()> {
        let directory = match self.cache_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from(".")
        };
        fs::create_dir_all(&directory)?;
        let mut temp = NamedTempFile::new_in(&directory)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.cache_path).map_err(|e| e.error)?;
        debug!("cached keystore at {}", self.cache_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{testing_key_material, JksBuilder, Pkcs12Builder};
    use resign_common::KeySourceError;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc
    };
    use tempfile::TempDir;

    struct FakeSource {
        bytes: Option<Vec<u8>>,
        fetches: Arc<AtomicUsize>
    }

    impl FakeSource {
        fn new(bytes: Option<Vec<u8>>) -> (FakeSource, Arc<AtomicUsize>) {
            let fetches = Arc::new(AtomicUsize::new(0));
            (
                FakeSource {
                    bytes,
                    fetches: fetches.clone()
                },
                fetches
            )
        }
    }

    impl KeySource for FakeSource {
        fn label(&self) -> String {
            "fake".into()
        }

        fn fetch(&self) -> Result<Option<Vec<u8>>, KeySourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.bytes.clone())
        }
    }

    struct BrokenSource;

    impl KeySource for BrokenSource {
        fn label(&self) -> String {
            "broken".into()
        }

        fn fetch(&self) -> Result<Option<Vec<u8>>, KeySourceError> {
            Err(KeySourceError {
                origin: "broken".into(),
                detail: "connection refused".into()
            })
        }
    }

    fn credentials() -> KeyCredentials {
        KeyCredentials {
            alias: "release".into(),
            store_password: "store-secret".into(),
            key_password: "key-secret".into()
        }
    }

    fn keystore() -> Vec<u8> {
        JksBuilder::new()
            .private_key(&testing_key_material("release"), "key-secret")
            .build("store-secret")
    }

    #[test]
    fn remote_bytes_are_cached_and_reused() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("keys").join("release.jks");
        let store = keystore();
        let (remote, fetches) = FakeSource::new(Some(store.clone()));
        let chain = KeyChain::new(&cache, credentials()).with_source(remote);

        let first = chain.acquire().unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(&cache).unwrap(), store);

        let second = chain.acquire().unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(first.private_key_der(), second.private_key_der());
    }

    #[test]
    fn pkcs12_keystore_from_a_source() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache.p12");
        let store = Pkcs12Builder::new()
            .private_key(&testing_key_material("release"), "key-secret")
            .build("store-secret");
        let (bundled, _) = FakeSource::new(Some(store.clone()));
        let chain = KeyChain::new(&cache, credentials()).with_source(bundled);

        assert_eq!(chain.acquire().unwrap().alias(), "release");
        assert_eq!(fs::read(&cache).unwrap(), store);
    }

    #[test]
    fn first_usable_source_wins() {
        let dir = TempDir::new().unwrap();
        let (absent, _) = FakeSource::new(None);
        let (bundled, bundled_fetches) = FakeSource::new(Some(keystore()));
        let (remote, remote_fetches) = FakeSource::new(Some(keystore()));
        let chain = KeyChain::new(dir.path().join("cache.jks"), credentials())
            .with_source(BrokenSource)
            .with_source(absent)
            .with_source(bundled)
            .with_source(remote);

        chain.acquire().unwrap();
        assert_eq!(bundled_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(remote_fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_cache_is_replaced() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache.jks");
        fs::write(&cache, b"garbage left by an old build").unwrap();
        let store = keystore();
        let (remote, fetches) = FakeSource::new(Some(store.clone()));
        let chain = KeyChain::new(&cache, credentials()).with_source(remote);

        chain.acquire().unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(&cache).unwrap(), store);
    }

    #[test]
    fn stale_cache_can_be_kept() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache.jks");
        fs::write(&cache, b"garbage").unwrap();
        let chain = KeyChain::new(&cache, credentials()).discard_stale_cache(false);

        let err = chain.acquire().unwrap_err();
        assert!(matches!(err, ResignError::KeyUnavailable(_)));
        assert_eq!(fs::read(&cache).unwrap(), b"garbage");
    }

    #[test]
    fn wrong_key_password_is_credential_error() {
        let dir = TempDir::new().unwrap();
        let (remote, _) = FakeSource::new(Some(keystore()));
        let mut wrong = credentials();
        wrong.key_password = "guess".into();
        let chain = KeyChain::new(dir.path().join("cache.jks"), wrong).with_source(remote);

        match chain.acquire().unwrap_err() {
            ResignError::KeyCredential { origin, cause } => {
                assert_eq!(origin, "fake");
                assert_eq!(
                    cause,
                    KeyStoreError::KeyPassword {
                        alias: "release".into()
                    }
                );
            }
            other => panic!("unexpected error {other:?}")
        }
        // Nothing usable, so nothing cached
        assert!(!dir.path().join("cache.jks").exists());
    }

    #[test]
    fn missing_alias_is_reported() {
        let dir = TempDir::new().unwrap();
        let (remote, _) = FakeSource::new(Some(keystore()));
        let mut other_alias = credentials();
        other_alias.alias = "upload".into();
        let chain = KeyChain::new(dir.path().join("cache.jks"), other_alias).with_source(remote);

        assert!(matches!(
            chain.acquire().unwrap_err(),
            ResignError::KeyAliasNotFound { .. }
        ));
    }

    #[test]
    fn nothing_available() {
        let dir = TempDir::new().unwrap();
        let (absent, _) = FakeSource::new(None);
        let chain = KeyChain::new(dir.path().join("cache.jks"), credentials())
            .with_source(absent)
            .with_source(BrokenSource);

        match chain.acquire().unwrap_err() {
            ResignError::KeyUnavailable(tried) => {
                assert_eq!(
                    tried,
                    vec![
                        "fake: not available".to_string(),
                        "broken: connection refused".to_string()
                    ]
                );
            }
            other => panic!("unexpected error {other:?}")
        }
    }

    #[test]
    fn credentials_are_redacted() {
        let printed = format!("{:?}", credentials());
        assert!(!printed.contains("secret"));
    }
}
