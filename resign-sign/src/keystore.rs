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

//! Keystore loading. JKS files are read here; PKCS#12 files are handed to
//! [crate::pkcs12]. The format is picked by magic: JKS starts with
//! `0xFEEDFEED`, PKCS#12 is a DER SEQUENCE.
//!
//! A JKS file is big-endian throughout:
//!
//! ```text
//! magic 0xFEEDFEED | version (1 or 2) | entry count
//! entries...
//! SHA-1(password as UTF-16BE | "Mighty Aphrodite" | everything above)
//! ```
//!
//! The trailing digest is how a wrong store password is detected. Private
//! keys are additionally protected with their own password using Sun's
//! SHA-1 keystream scheme, which carries its own check digest.

use byteorder::{BigEndian, ReadBytesExt};
use rasn::types::{OctetString, Oid};
use rasn::{AsnType, Decode, Decoder, Encode};
use rasn_pkix::AlgorithmIdentifier;
use resign_common::KeyStoreError;
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read};

use crate::crypto_keys::KeyMaterial;
use crate::pkcs12;

pub const JKS_MAGIC: u32 = 0xFEED_FEED;
pub(crate) const JKS_VERSION: u32 = 2;
pub(crate) const PRIVATE_KEY_TAG: u32 = 1;
pub(crate) const TRUSTED_CERT_TAG: u32 = 2;
pub(crate) const INTEGRITY_SALT: &[u8] = b"Mighty Aphrodite";
// Sun's proprietary key protection algorithm
pub(crate) const KEY_PROTECTOR: &Oid = Oid::const_new(&[1, 3, 6, 1, 4, 1, 42, 2, 17, 1, 1]);
pub(crate) const SHA1_LEN: usize = 20;
const DER_SEQUENCE: u8 = 0x30;

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct EncryptedPrivateKeyInfo {
    pub encryption_algorithm: AlgorithmIdentifier,
    pub encrypted_data: OctetString
}

pub(crate) enum ProtectedKey {
    /// Sun's key protector, from a JKS file
    Jks(Vec<u8>),
    /// A PKCS#12 shrouded key bag
    Pkcs12(EncryptedPrivateKeyInfo),
    /// A PKCS#12 key bag, stored in the clear
    Plain(Vec<u8>)
}

pub(crate) enum Entry {
    PrivateKey {
        alias: String,
        protected_key: ProtectedKey,
        chain: Vec<Vec<u8>>
    },
    TrustedCertificate {
        alias: String
    }
}

impl Entry {
    fn alias(&self) -> &str {
        match self {
            Entry::PrivateKey { alias, .. } | Entry::TrustedCertificate { alias } => alias
        }
    }
}

/// A JKS or PKCS#12 keystore whose integrity has been checked against its
/// store password. Private keys stay encrypted until [KeyStore::key_material]
/// is called.
pub struct KeyStore {
    entries: Vec<Entry>
}

impl KeyStore {
    pub fn load(bytes: &[u8], store_password: &str) -> Result<KeyStore, KeyStoreError> {
        let entries = match bytes {
            [0xFE, 0xED, 0xFE, 0xED, ..] => read_jks(bytes, store_password)?,
            [DER_SEQUENCE, ..] => pkcs12::read_entries(bytes, store_password)?,
            _ => {
                return Err(KeyStoreError::Corrupt(
                    "neither a JKS nor a PKCS#12 keystore".into()
                ))
            }
        };
        Ok(KeyStore { entries })
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(Entry::alias)
    }

    /// Decrypts the private key stored under `alias` and returns it with its
    /// certificate chain. Both formats lowercase aliases, so the lookup
    /// ignores case.
    pub fn key_material(&self, alias: &str, key_password: &str) -> Result<KeyMaterial, KeyStoreError> {
        let wanted = alias.to_lowercase();
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.alias().to_lowercase() == wanted);

        match entry {
            Some(Entry::PrivateKey {
                protected_key,
                chain,
                ..
            }) => {
                if chain.is_empty() {
                    return Err(KeyStoreError::EmptyChain {
                        alias: alias.into()
                    });
                }
                let private_key = match protected_key {
                    ProtectedKey::Jks(protected) => recover_key(protected, alias, key_password)?,
                    ProtectedKey::Pkcs12(info) => pkcs12::decrypt_key(info, alias, key_password)?,
                    ProtectedKey::Plain(key) => key.clone()
                };
                KeyMaterial::from_der(alias, private_key, chain.clone())
            }
            // A certificate-only entry has nothing to sign with
            Some(Entry::TrustedCertificate { .. }) | None => Err(KeyStoreError::AliasNotFound {
                alias: alias.into()
            })
        }
    }
}

fn read_jks(bytes: &[u8], store_password: &str) -> Result<Vec<Entry>, KeyStoreError> {
    if bytes.len() < 12 + SHA1_LEN {
        return Err(KeyStoreError::Corrupt("too short to be a keystore".into()));
    }
    let (body, digest) = bytes.split_at(bytes.len() - SHA1_LEN);
    let mut reader = Cursor::new(body);

    let magic = reader.read_u32::<BigEndian>().map_err(truncated)?;
    if magic != JKS_MAGIC {
        return Err(KeyStoreError::Corrupt(format!(
            "not a JKS keystore (magic {magic:#010x})"
        )));
    }
    let version = reader.read_u32::<BigEndian>().map_err(truncated)?;
    if version != 1 && version != JKS_VERSION {
        return Err(KeyStoreError::Corrupt(format!(
            "unsupported JKS version {version}"
        )));
    }
    // Checked before parsing entries so a wrong password never gets
    // reported as corruption
    if integrity_digest(store_password, body).as_slice() != digest {
        return Err(KeyStoreError::StorePassword);
    }

    let count = reader.read_u32::<BigEndian>().map_err(truncated)?;
    let mut entries = vec![];
    for _ in 0..count {
        entries.push(read_entry(&mut reader, version)?);
    }
    if reader.position() != body.len() as u64 {
        return Err(KeyStoreError::Corrupt(
            "unexpected bytes after the last entry".into()
        ));
    }

    Ok(entries)
}

fn read_entry(reader: &mut Cursor<&[u8]>, version: u32) -> Result<Entry, KeyStoreError> {
    let tag = reader.read_u32::<BigEndian>().map_err(truncated)?;
    let alias = read_utf(reader)?;
    // Creation date in milliseconds, not needed
    reader.read_u64::<BigEndian>().map_err(truncated)?;

    match tag {
        PRIVATE_KEY_TAG => {
            let protected_key = read_blob(reader)?;
            let chain_len = reader.read_u32::<BigEndian>().map_err(truncated)?;
            let mut chain = vec![];
            for _ in 0..chain_len {
                chain.push(read_certificate(reader, version)?);
            }
            Ok(Entry::PrivateKey {
                alias,
                protected_key: ProtectedKey::Jks(protected_key),
                chain
            })
        }
        TRUSTED_CERT_TAG => {
            read_certificate(reader, version)?;
            Ok(Entry::TrustedCertificate { alias })
        }
        other => Err(KeyStoreError::Corrupt(format!(
            "unknown entry tag {other} for alias '{alias}'"
        )))
    }
}

fn read_certificate(reader: &mut Cursor<&[u8]>, version: u32) -> Result<Vec<u8>, KeyStoreError> {
    // Version 2 names the certificate type, which is always X.509 in practice
    if version == 2 {
        let cert_type = read_utf(reader)?;
        if cert_type != "X.509" {
            return Err(KeyStoreError::Corrupt(format!(
                "unsupported certificate type {cert_type}"
            )));
        }
    }
    read_blob(reader)
}

// Java's DataOutput.writeUTF: u16 length, then (modified) UTF-8
fn read_utf(reader: &mut Cursor<&[u8]>) -> Result<String, KeyStoreError> {
    let len = reader.read_u16::<BigEndian>().map_err(truncated)?;
    let bytes = read_exact_vec(reader, len as u64)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn read_blob(reader: &mut Cursor<&[u8]>) -> Result<Vec<u8>, KeyStoreError> {
    let len = reader.read_u32::<BigEndian>().map_err(truncated)?;
    read_exact_vec(reader, len as u64)
}

fn read_exact_vec(reader: &mut Cursor<&[u8]>, len: u64) -> Result<Vec<u8>, KeyStoreError> {
    // Lengths come from untrusted bytes; don't allocate past what's there
    let remaining = reader.get_ref().len() as u64 - reader.position();
    if len > remaining {
        return Err(truncated(()));
    }
    let mut bytes = vec![0; len as usize];
    reader.read_exact(&mut bytes).map_err(truncated)?;
    Ok(bytes)
}

fn truncated<E>(_: E) -> KeyStoreError {
    KeyStoreError::Corrupt("keystore ends in the middle of an entry".into())
}

/// Java passwords are `char[]`, hashed as two big-endian bytes per char.
pub(crate) fn password_bytes(password: &str) -> Vec<u8> {
    password.encode_utf16().flat_map(u16::to_be_bytes).collect()
}

pub(crate) fn integrity_digest(store_password: &str, body: &[u8]) -> [u8; SHA1_LEN] {
    Sha1::new()
        .chain_update(password_bytes(store_password))
        .chain_update(INTEGRITY_SALT)
        .chain_update(body)
        .finalize()
        .into()
}

/// The key protector's XOR stream: SHA-1 chained from the salt, each round
/// hashing the password followed by the previous digest.
pub(crate) fn keystream(password: &[u8], salt: &[u8], len: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(len + SHA1_LEN);
    let mut digest = salt.to_vec();
    while stream.len() < len {
        digest = Sha1::new()
            .chain_update(password)
            .chain_update(&digest)
            .finalize()
            .to_vec();
        stream.extend_from_slice(&digest);
    }
    stream.truncate(len);
    stream
}

pub(crate) fn key_check(password: &[u8], plain_key: &[u8]) -> [u8; SHA1_LEN] {
    Sha1::new()
        .chain_update(password)
        .chain_update(plain_key)
        .finalize()
        .into()
}

// Protected key layout: salt (20) | key XOR keystream | check digest (20)
fn recover_key(protected_key: &[u8], alias: &str, key_password: &str) -> Result<Vec<u8>, KeyStoreError> {
    let info: EncryptedPrivateKeyInfo = rasn::der::decode(protected_key).map_err(|e| {
        KeyStoreError::Corrupt(format!("protected key for alias '{alias}': {e}"))
    })?;
    if *info.encryption_algorithm.algorithm != *KEY_PROTECTOR {
        return Err(KeyStoreError::Corrupt(format!(
            "alias '{alias}' uses unsupported key protection {:?}",
            info.encryption_algorithm.algorithm
        )));
    }

    let data = &info.encrypted_data[..];
    if data.len() < 2 * SHA1_LEN {
        return Err(KeyStoreError::Corrupt(format!(
            "protected key for alias '{alias}' is too short"
        )));
    }
    let (salt, rest) = data.split_at(SHA1_LEN);
    let (encrypted, check) = rest.split_at(rest.len() - SHA1_LEN);

    let password = password_bytes(key_password);
    let plain_key: Vec<u8> = encrypted
        .iter()
        .zip(keystream(&password, salt, encrypted.len()))
        .map(|(byte, key)| byte ^ key)
        .collect();

    if key_check(&password, &plain_key).as_slice() != check {
        return Err(KeyStoreError::KeyPassword {
            alias: alias.into()
        });
    }
    Ok(plain_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{testing_key_material, JksBuilder};

    fn two_password_store() -> (KeyMaterial, Vec<u8>) {
        let material = testing_key_material("release");
        let store = JksBuilder::new()
            .private_key(&material, "key-secret")
            .trusted_certificate("ca", material.leaf_certificate())
            .build("store-secret");
        (material, store)
    }

    #[test]
    fn loads_key_with_both_passwords() {
        let (material, store) = two_password_store();
        let keystore = KeyStore::load(&store, "store-secret").unwrap();
        assert_eq!(keystore.aliases().collect::<Vec<_>>(), ["release", "ca"]);

        let loaded = keystore.key_material("RELEASE", "key-secret").unwrap();
        assert_eq!(loaded.private_key_der(), material.private_key_der());
        assert_eq!(loaded.certificate_chain(), material.certificate_chain());
    }

    #[test]
    fn wrong_store_password_is_credential_error() {
        let (_, store) = two_password_store();
        let err = KeyStore::load(&store, "key-secret").err().unwrap();
        assert_eq!(err, KeyStoreError::StorePassword);
        assert!(err.is_credential());
    }

    #[test]
    fn wrong_key_password_is_credential_error() {
        let (_, store) = two_password_store();
        let keystore = KeyStore::load(&store, "store-secret").unwrap();
        let err = keystore.key_material("release", "store-secret").unwrap_err();
        assert_eq!(
            err,
            KeyStoreError::KeyPassword {
                alias: "release".into()
            }
        );
    }

    #[test]
    fn missing_alias_and_certificate_entries() {
        let (_, store) = two_password_store();
        let keystore = KeyStore::load(&store, "store-secret").unwrap();
        assert!(matches!(
            keystore.key_material("debug", "key-secret"),
            Err(KeyStoreError::AliasNotFound { .. })
        ));
        assert!(matches!(
            keystore.key_material("ca", "key-secret"),
            Err(KeyStoreError::AliasNotFound { .. })
        ));
    }

    #[test]
    fn corrupt_bytes() {
        for bytes in [&b"short"[..], &b"PK\x03\x04 an APK, not a keystore"[..]] {
            assert!(matches!(
                KeyStore::load(bytes, "x"),
                Err(KeyStoreError::Corrupt(_))
            ));
        }
        // JKS magic with nothing behind it
        assert!(matches!(
            KeyStore::load(&[0xFE, 0xED, 0xFE, 0xED, 0, 0, 0, 2], "x"),
            Err(KeyStoreError::Corrupt(_))
        ));
        // A truncated PKCS#12 header
        let mut truncated_pfx = vec![0x30, 0x82, 0x0A, 0x54];
        truncated_pfx.extend([0; 40]);
        assert!(matches!(
            KeyStore::load(&truncated_pfx, "x"),
            Err(KeyStoreError::Corrupt(_))
        ));
    }

    #[test]
    fn flipped_byte_fails_integrity_check() {
        let (_, mut store) = two_password_store();
        let middle = store.len() / 2;
        store[middle] ^= 0x01;
        assert_eq!(
            KeyStore::load(&store, "store-secret").err(),
            Some(KeyStoreError::StorePassword)
        );
    }

    #[test]
    fn keystream_spans_multiple_digests() {
        let stream = keystream(b"pw", &[7; SHA1_LEN], 45);
        assert_eq!(stream.len(), 45);
        // The first block is SHA-1(password | salt)
        let first: [u8; SHA1_LEN] = key_check(b"pw", &[7; SHA1_LEN]);
        assert_eq!(&stream[..SHA1_LEN], &first);
    }
}
