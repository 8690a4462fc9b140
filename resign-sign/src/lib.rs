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

//! Key acquisition and the signing/verification seam.
//!
//! Signing itself is delegated to a [Signer]; this crate finds the key to
//! hand it, through a [KeyChain] of cache, bundled resource and remote
//! [KeySource]s, and reads the answer back from a [Verifier]. Keystores may
//! be JKS or PKCS#12.

pub mod apksigner;
pub mod crypto_keys;
mod key_chain;
pub mod key_sources;
pub mod keystore;
mod pkcs12;
mod signer;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use apksigner::ApkSigner;
pub use crypto_keys::KeyMaterial;
pub use key_chain::{KeyChain, KeyCredentials};
pub use key_sources::{BundledResource, KeySource, RemoteUrl};
pub use keystore::KeyStore;
pub use signer::{SchemeSet, SignRequest, Signer, Verdict, Verifier};
