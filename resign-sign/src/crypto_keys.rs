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

use std::fmt;

use pem::Pem;
use pkcs8::PrivateKeyInfo;
use rasn_pkix::Certificate;
use resign_common::KeyStoreError;
use sha2::{Digest, Sha256};

/// Holds the private key and certificate chain used for one signing call.
///
/// Only ever built through [KeyMaterial::from_der], which checks that the
/// key is PKCS#8 and that every certificate is X.509, so a signer never sees
/// bytes it can't use.
#[derive(Clone)]
pub struct KeyMaterial {
    alias: String,
    /// PKCS#8 PrivateKeyInfo in ASN.1 DER form
    private_key: Vec<u8>,
    /// X.509 certificates in ASN.1 DER form, leaf first
    certificate_chain: Vec<Vec<u8>>
}

impl KeyMaterial {
    pub fn from_der(
        alias: &str,
        private_key: Vec<u8>,
        certificate_chain: Vec<Vec<u8>>
    ) -> Result<KeyMaterial, KeyStoreError> {
        PrivateKeyInfo::try_from(private_key.as_slice()).map_err(|e| {
            KeyStoreError::Corrupt(format!("key for alias '{alias}' is not PKCS#8: {e}"))
        })?;

        if certificate_chain.is_empty() {
            return Err(KeyStoreError::EmptyChain {
                alias: alias.into()
            });
        }
        for (index, certificate) in certificate_chain.iter().enumerate() {
            rasn::der::decode::<Certificate>(certificate).map_err(|e| {
                KeyStoreError::Corrupt(format!(
                    "certificate {index} for alias '{alias}' is not X.509: {e}"
                ))
            })?;
        }

        Ok(KeyMaterial {
            alias: alias.into(),
            private_key,
            certificate_chain
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Returns the private key as PKCS#8 DER, the form `apksigner --key` takes.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }

    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.certificate_chain
    }

    /// The signing certificate itself.
    pub fn leaf_certificate(&self) -> &[u8] {
        // from_der refuses empty chains
        &self.certificate_chain[0]
    }

    /// SHA-256 of the leaf certificate as lowercase hex, the digest Android
    /// tooling prints for a signer.
    pub fn leaf_fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.leaf_certificate()))
    }

    /// The whole chain as concatenated `CERTIFICATE` PEM blocks.
    pub fn chain_pem(&self) -> String {
        let blocks: Vec<Pem> = self
            .certificate_chain
            .iter()
            .map(|der| Pem::new("CERTIFICATE", der.clone()))
            .collect();
        pem::encode_many(&blocks)
    }
}

// Never print key bytes, not even in debug logs
impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("alias", &self.alias)
            .field("certificates", &self.certificate_chain.len())
            .field("leaf_fingerprint", &self.leaf_fingerprint())
            .finish_non_exhaustive()
    }
}
