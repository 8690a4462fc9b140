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

//! Throwaway keys and keystores for tests.
//!
//! Keys from here are self-signed and random on every call. Never sign a
//! real release with them: updates have to be signed with the same key as
//! the first upload.

use std::borrow::Cow;

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use rasn::types::{Any, ObjectIdentifier, OctetString, Oid};
use rasn::Encode;
use rasn_pkix::AlgorithmIdentifier;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::crypto_keys::KeyMaterial;
use crate::keystore::{
    integrity_digest, key_check, keystream, password_bytes, EncryptedPrivateKeyInfo, JKS_MAGIC,
    JKS_VERSION, KEY_PROTECTOR, PRIVATE_KEY_TAG, TRUSTED_CERT_TAG
};
use crate::pkcs12::{
    self, BagAttribute, BmpBytes, CertBag, ContentInfo, DigestInfo, EncryptedContentInfo,
    EncryptedData, MacData, Pbes2Parameters, Pbkdf2Parameters, Pfx, SafeBag, AES256_CBC,
    CERT_BAG, DATA, ENCRYPTED_DATA, FRIENDLY_NAME, HMAC_SHA256, LOCAL_KEY_ID, PBES2, PBKDF2,
    PFX_VERSION, SHA256_OID, SHROUDED_KEY_BAG, X509_CERTIFICATE
};

const PKCS12_ROUNDS: u32 = 2048;
// DER NULL
const NULL_PARAMETERS: [u8; 2] = [0x05, 0x00];

/// Generates a self-signed ECDSA key and certificate.
pub fn testing_key_material(alias: &str) -> KeyMaterial {
    let certified = rcgen::generate_simple_self_signed(vec![format!("{alias}.resign.test")])
        .expect("rcgen failed to generate a testing key");
    KeyMaterial::from_der(
        alias,
        certified.key_pair.serialize_der(),
        vec![certified.cert.der().to_vec()]
    )
    .expect("rcgen produced unusable key material")
}

/// Writes JKS keystores, the inverse of [crate::KeyStore::load] for that
/// format.
#[derive(Default)]
pub struct JksBuilder {
    entries: Vec<Vec<u8>>
}

impl JksBuilder {
    pub fn new() -> JksBuilder {
        JksBuilder::default()
    }

    /// Adds a private key entry protected with `key_password`.
    pub fn private_key(mut self, material: &KeyMaterial, key_password: &str) -> JksBuilder {
        let mut entry = vec![];
        entry.extend_from_slice(&PRIVATE_KEY_TAG.to_be_bytes());
        write_utf(&mut entry, material.alias());
        entry.extend_from_slice(&0u64.to_be_bytes());
        write_blob(&mut entry, &protect_key(material, key_password));
        entry.extend_from_slice(&(material.certificate_chain().len() as u32).to_be_bytes());
        for certificate in material.certificate_chain() {
            write_utf(&mut entry, "X.509");
            write_blob(&mut entry, certificate);
        }
        self.entries.push(entry);
        self
    }

    pub fn trusted_certificate(mut self, alias: &str, certificate: &[u8]) -> JksBuilder {
        let mut entry = vec![];
        entry.extend_from_slice(&TRUSTED_CERT_TAG.to_be_bytes());
        write_utf(&mut entry, alias);
        entry.extend_from_slice(&0u64.to_be_bytes());
        write_utf(&mut entry, "X.509");
        write_blob(&mut entry, certificate);
        self.entries.push(entry);
        self
    }

    pub fn build(self, store_password: &str) -> Vec<u8> {
        let mut body = vec![];
        body.extend_from_slice(&JKS_MAGIC.to_be_bytes());
        body.extend_from_slice(&JKS_VERSION.to_be_bytes());
        body.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            body.extend_from_slice(entry);
        }
        let digest = integrity_digest(store_password, &body);
        body.extend_from_slice(&digest);
        body
    }
}

fn protect_key(material: &KeyMaterial, key_password: &str) -> Vec<u8> {
    let password = password_bytes(key_password);
    let plain_key = material.private_key_der();
    // Any 20 bytes will do; derive them so builds are reproducible
    let salt = Sha1::digest(material.alias().as_bytes());

    let mut protected = salt.to_vec();
    protected.extend(
        plain_key
            .iter()
            .zip(keystream(&password, &salt, plain_key.len()))
            .map(|(byte, key)| byte ^ key)
    );
    protected.extend_from_slice(&key_check(&password, plain_key));

    let info = EncryptedPrivateKeyInfo {
        encryption_algorithm: AlgorithmIdentifier {
            algorithm: oid(KEY_PROTECTOR),
            parameters: Some(Any::new(NULL_PARAMETERS.to_vec()))
        },
        encrypted_data: OctetString::from(protected)
    };
    encode(&info)
}

fn write_utf(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn write_blob(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
}

struct Pkcs12Key {
    alias: Option<String>,
    private_key: Vec<u8>,
    chain: Vec<Vec<u8>>,
    password: String
}

/// Writes PKCS#12 keystores the way `openssl pkcs12 -export` does: PBES2
/// with AES-256 and an HMAC-SHA256 MAC. Unlike openssl, keys can have a
/// password of their own.
#[derive(Default)]
pub struct Pkcs12Builder {
    keys: Vec<Pkcs12Key>,
    certificates: Vec<(String, Vec<u8>)>
}

impl Pkcs12Builder {
    pub fn new() -> Pkcs12Builder {
        Pkcs12Builder::default()
    }

    pub fn private_key(self, material: &KeyMaterial, key_password: &str) -> Pkcs12Builder {
        let chain = material.certificate_chain().to_vec();
        self.key(Some(material.alias()), material, chain, key_password)
    }

    /// Adds a key with no friendly name, so no alias reaches it.
    pub fn unnamed_private_key(self, material: &KeyMaterial, key_password: &str) -> Pkcs12Builder {
        let chain = material.certificate_chain().to_vec();
        self.key(None, material, chain, key_password)
    }

    pub fn private_key_without_certificate(
        self,
        material: &KeyMaterial,
        key_password: &str
    ) -> Pkcs12Builder {
        self.key(Some(material.alias()), material, vec![], key_password)
    }

    pub fn trusted_certificate(mut self, alias: &str, certificate: &[u8]) -> Pkcs12Builder {
        self.certificates.push((alias.into(), certificate.to_vec()));
        self
    }

    fn key(
        mut self,
        alias: Option<&str>,
        material: &KeyMaterial,
        chain: Vec<Vec<u8>>,
        key_password: &str
    ) -> Pkcs12Builder {
        self.keys.push(Pkcs12Key {
            alias: alias.map(str::to_owned),
            private_key: material.private_key_der().to_vec(),
            chain,
            password: key_password.into()
        });
        self
    }

    pub fn build(self, store_password: &str) -> Vec<u8> {
        let mut key_bags = vec![];
        let mut cert_bags = vec![];
        for (index, key) in self.keys.iter().enumerate() {
            let mut attributes = vec![BagAttribute {
                attr_id: oid(LOCAL_KEY_ID),
                attr_values: vec![der_any(&OctetString::from(vec![index as u8 + 1]))]
            }];
            if let Some(alias) = &key.alias {
                attributes.push(friendly_name(alias));
            }

            let key_salt = salt(&format!("key {index}"));
            let (encryption_algorithm, ciphertext) =
                pbes2_encrypt(&key.private_key, &key.password, &key_salt);
            let shrouded = EncryptedPrivateKeyInfo {
                encryption_algorithm,
                encrypted_data: OctetString::from(ciphertext)
            };
            key_bags.push(SafeBag {
                bag_id: oid(SHROUDED_KEY_BAG),
                bag_value: der_any(&shrouded),
                bag_attributes: Some(attributes.clone())
            });

            // Only the leaf carries the key's attributes
            for (position, certificate) in key.chain.iter().enumerate() {
                let attributes = (position == 0).then(|| attributes.clone());
                cert_bags.push(cert_bag(certificate, attributes));
            }
        }
        for (alias, certificate) in &self.certificates {
            cert_bags.push(cert_bag(certificate, Some(vec![friendly_name(alias)])));
        }

        let (algorithm, ciphertext) =
            pbes2_encrypt(&encode(&cert_bags), store_password, &salt("certificates"));
        let encrypted_certificates = ContentInfo {
            content_type: oid(ENCRYPTED_DATA),
            content: der_any(&EncryptedData {
                version: 0,
                encrypted_content_info: EncryptedContentInfo {
                    content_type: oid(DATA),
                    content_encryption_algorithm: algorithm,
                    encrypted_content: Some(OctetString::from(ciphertext))
                }
            })
        };
        let keys = ContentInfo {
            content_type: oid(DATA),
            content: der_any(&OctetString::from(encode(&key_bags)))
        };
        let auth_safe = encode(&vec![encrypted_certificates, keys]);

        let mac_salt = salt("mac");
        let digest = pkcs12::mac(&oid(SHA256_OID), store_password, &mac_salt, PKCS12_ROUNDS, &auth_safe)
            .expect("SHA-256 MACs are supported");
        let pfx = Pfx {
            version: PFX_VERSION,
            auth_safe: ContentInfo {
                content_type: oid(DATA),
                content: der_any(&OctetString::from(auth_safe))
            },
            mac_data: Some(MacData {
                mac: DigestInfo {
                    digest_algorithm: AlgorithmIdentifier {
                        algorithm: oid(SHA256_OID),
                        parameters: Some(Any::new(NULL_PARAMETERS.to_vec()))
                    },
                    digest: OctetString::from(digest)
                },
                mac_salt: OctetString::from(mac_salt),
                iterations: Some(PKCS12_ROUNDS)
            })
        };
        encode(&pfx)
    }
}

fn cert_bag(certificate: &[u8], attributes: Option<Vec<BagAttribute>>) -> SafeBag {
    SafeBag {
        bag_id: oid(CERT_BAG),
        bag_value: der_any(&CertBag {
            cert_id: oid(X509_CERTIFICATE),
            cert_value: OctetString::from(certificate.to_vec())
        }),
        bag_attributes: attributes
    }
}

fn friendly_name(alias: &str) -> BagAttribute {
    let utf16: Vec<u8> = alias.encode_utf16().flat_map(u16::to_be_bytes).collect();
    BagAttribute {
        attr_id: oid(FRIENDLY_NAME),
        attr_values: vec![der_any(&BmpBytes(OctetString::from(utf16)))]
    }
}

// PBKDF2-HMAC-SHA256 into AES-256-CBC
fn pbes2_encrypt(plain: &[u8], password: &str, salt: &[u8]) -> (AlgorithmIdentifier, Vec<u8>) {
    let iv = Sha1::digest(salt)[..16].to_vec();
    let mut key = [0; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PKCS12_ROUNDS, &mut key);
    let ciphertext = cbc::Encryptor::<Aes256>::new_from_slices(&key, &iv)
        .expect("AES-256 takes a 32 byte key and a 16 byte IV")
        .encrypt_padded_vec_mut::<Pkcs7>(plain);

    let kdf = Pbkdf2Parameters {
        salt: OctetString::from(salt.to_vec()),
        iteration_count: PKCS12_ROUNDS,
        key_length: None,
        prf: Some(AlgorithmIdentifier {
            algorithm: oid(HMAC_SHA256),
            parameters: Some(Any::new(NULL_PARAMETERS.to_vec()))
        })
    };
    let params = Pbes2Parameters {
        key_derivation_func: AlgorithmIdentifier {
            algorithm: oid(PBKDF2),
            parameters: Some(der_any(&kdf))
        },
        encryption_scheme: AlgorithmIdentifier {
            algorithm: oid(AES256_CBC),
            parameters: Some(der_any(&OctetString::from(iv)))
        }
    };
    let algorithm = AlgorithmIdentifier {
        algorithm: oid(PBES2),
        parameters: Some(der_any(&params))
    };
    (algorithm, ciphertext)
}

// Fixed salts keep builds reproducible
fn salt(label: &str) -> Vec<u8> {
    Sha1::digest(label.as_bytes())[..16].to_vec()
}

fn oid(value: &Oid) -> ObjectIdentifier {
    ObjectIdentifier::new_unchecked(Cow::Owned(value.to_vec()))
}

fn encode<T: Encode>(value: &T) -> Vec<u8> {
    rasn::der::encode(value).expect("PKCS#12 structures always encode")
}

fn der_any<T: Encode>(value: &T) -> Any {
    Any::new(encode(value))
}
