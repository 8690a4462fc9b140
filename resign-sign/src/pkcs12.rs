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

//! Reader for PKCS#12 keystores, the format `keytool` and `openssl pkcs12`
//! write by default.
//!
//! ```text
//! PFX { version 3, authSafe: data(AuthenticatedSafe), macData }
//! AuthenticatedSafe = SEQUENCE OF data(SafeContents) | encryptedData(SafeContents)
//! SafeContents = SEQUENCE OF SafeBag { bagId, bagValue, attributes }
//! ```
//!
//! Only password integrity mode is supported. The MAC is checked with the
//! store password before anything is decrypted. Certificate bags are
//! decrypted with the store password on load; shrouded key bags stay
//! encrypted until [crate::KeyStore::key_material] opens them with the key
//! password.
//!
//! Both the PBES2 schemes current tools write (PBKDF2 with AES-CBC) and the
//! older PKCS#12 PBE schemes (3DES and RC2 keyed from the PKCS#12 KDF) are
//! readable.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, InnerIvInit, KeyIvInit};
use cbc::Decryptor;
use des::TdesEde3;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rasn::types::{Any, ObjectIdentifier, OctetString, Oid};
use rasn::{AsnType, Decode, Decoder, Encode, Encoder};
use rasn_pkix::{AlgorithmIdentifier, Certificate};
use rc2::Rc2;
use resign_common::KeyStoreError;
use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384, Sha512};
use tracing::debug;

use crate::keystore::{EncryptedPrivateKeyInfo, Entry, ProtectedKey};

pub(crate) const PFX_VERSION: u32 = 3;

pub(crate) const DATA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 7, 1]);
pub(crate) const ENCRYPTED_DATA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 7, 6]);

const KEY_BAG: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 12, 10, 1, 1]);
pub(crate) const SHROUDED_KEY_BAG: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 12, 10, 1, 2]);
pub(crate) const CERT_BAG: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 12, 10, 1, 3]);
pub(crate) const X509_CERTIFICATE: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 9, 22, 1]);

pub(crate) const FRIENDLY_NAME: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 9, 20]);
pub(crate) const LOCAL_KEY_ID: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 9, 21]);

const SHA1_OID: &Oid = Oid::const_new(&[1, 3, 14, 3, 2, 26]);
pub(crate) const SHA256_OID: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 1]);
const SHA384_OID: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 2]);
const SHA512_OID: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 3]);

pub(crate) const PBES2: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 5, 13]);
pub(crate) const PBKDF2: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 5, 12]);
const HMAC_SHA1: &Oid = Oid::const_new(&[1, 2, 840, 113549, 2, 7]);
pub(crate) const HMAC_SHA256: &Oid = Oid::const_new(&[1, 2, 840, 113549, 2, 9]);
const HMAC_SHA384: &Oid = Oid::const_new(&[1, 2, 840, 113549, 2, 10]);
const HMAC_SHA512: &Oid = Oid::const_new(&[1, 2, 840, 113549, 2, 11]);
const AES128_CBC: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 1, 2]);
const AES192_CBC: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 1, 22]);
pub(crate) const AES256_CBC: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 1, 42]);
const DES_EDE3_CBC: &Oid = Oid::const_new(&[1, 2, 840, 113549, 3, 7]);

const PBE_SHA1_RC2_128: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 12, 1, 5]);
const PBE_SHA1_RC2_40: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 12, 1, 6]);
const PBE_SHA1_3DES: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 12, 1, 3]);

// Diversifiers for the PKCS#12 key derivation function
const KDF_KEY: u8 = 1;
const KDF_IV: u8 = 2;
const KDF_MAC: u8 = 3;

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct Pfx {
    pub version: u32,
    pub auth_safe: ContentInfo,
    pub mac_data: Option<MacData>
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct ContentInfo {
    pub content_type: ObjectIdentifier,
    #[rasn(tag(explicit(0)))]
    pub content: Any
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct MacData {
    pub mac: DigestInfo,
    pub mac_salt: OctetString,
    // DEFAULT 1
    pub iterations: Option<u32>
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct DigestInfo {
    pub digest_algorithm: AlgorithmIdentifier,
    pub digest: OctetString
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct EncryptedData {
    pub version: u32,
    pub encrypted_content_info: EncryptedContentInfo
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct EncryptedContentInfo {
    pub content_type: ObjectIdentifier,
    pub content_encryption_algorithm: AlgorithmIdentifier,
    #[rasn(tag(0))]
    pub encrypted_content: Option<OctetString>
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct SafeBag {
    pub bag_id: ObjectIdentifier,
    #[rasn(tag(explicit(0)))]
    pub bag_value: Any,
    #[rasn(tag(universal, 17))]
    pub bag_attributes: Option<Vec<BagAttribute>>
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct BagAttribute {
    pub attr_id: ObjectIdentifier,
    #[rasn(tag(universal, 17))]
    pub attr_values: Vec<Any>
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct CertBag {
    pub cert_id: ObjectIdentifier,
    #[rasn(tag(explicit(0)))]
    pub cert_value: OctetString
}

/// The content octets of a BMPString, UTF-16BE.
#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
#[rasn(tag(universal, 30), delegate)]
pub(crate) struct BmpBytes(pub OctetString);

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct PbeParameter {
    pub salt: OctetString,
    pub iterations: u32
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct Pbes2Parameters {
    pub key_derivation_func: AlgorithmIdentifier,
    pub encryption_scheme: AlgorithmIdentifier
}

#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
pub(crate) struct Pbkdf2Parameters {
    pub salt: OctetString,
    pub iteration_count: u32,
    pub key_length: Option<u32>,
    // DEFAULT hmacWithSHA1
    pub prf: Option<AlgorithmIdentifier>
}

struct KeyBag {
    name: Option<String>,
    local_key_id: Option<Vec<u8>>,
    key: ProtectedKey
}

struct CertificateBag {
    name: Option<String>,
    local_key_id: Option<Vec<u8>>,
    der: Vec<u8>,
    parsed: Certificate
}

/// Checks the MAC and collects the keystore's entries. Keys without a
/// friendly name have no alias to look them up by and are skipped.
pub(crate) fn read_entries(bytes: &[u8], store_password: &str) -> Result<Vec<Entry>, KeyStoreError> {
    let pfx: Pfx = decode(bytes, "PKCS#12 keystore")?;
    if pfx.version != PFX_VERSION {
        return Err(KeyStoreError::Corrupt(format!(
            "unsupported PKCS#12 version {}",
            pfx.version
        )));
    }
    if !is(&pfx.auth_safe.content_type, DATA) {
        return Err(KeyStoreError::Corrupt(
            "only password-protected PKCS#12 keystores are supported".into()
        ));
    }
    let auth_safe: OctetString = decode(pfx.auth_safe.content.as_bytes(), "authenticated safe")?;

    match &pfx.mac_data {
        Some(mac_data) => {
            let expected = mac(
                &mac_data.mac.digest_algorithm.algorithm,
                store_password,
                &mac_data.mac_salt,
                mac_data.iterations.unwrap_or(1),
                &auth_safe
            )?;
            if expected != mac_data.mac.digest[..] {
                return Err(KeyStoreError::StorePassword);
            }
        }
        None => debug!("PKCS#12 keystore has no MAC, skipping integrity check")
    }

    let mut keys = vec![];
    let mut certificates = vec![];
    let contents: Vec<ContentInfo> = decode(&auth_safe, "authenticated safe")?;
    for content in contents {
        let safe_contents = if is(&content.content_type, DATA) {
            let data: OctetString = decode(content.content.as_bytes(), "safe contents")?;
            data.to_vec()
        } else if is(&content.content_type, ENCRYPTED_DATA) {
            let encrypted: EncryptedData = decode(content.content.as_bytes(), "encrypted safe contents")?;
            let info = encrypted.encrypted_content_info;
            let Some(ciphertext) = info.encrypted_content else {
                continue;
            };
            decrypt(
                &info.content_encryption_algorithm,
                &ciphertext,
                store_password,
                KeyStoreError::StorePassword
            )?
        } else {
            debug!("Skipping PKCS#12 content of type {:?}", content.content_type);
            continue;
        };

        let bags: Vec<SafeBag> = decode(&safe_contents, "safe contents")?;
        for bag in bags {
            read_bag(bag, &mut keys, &mut certificates)?;
        }
    }

    let mut entries = vec![];
    for key in keys {
        let Some(alias) = key.name else {
            debug!("Skipping PKCS#12 key without a friendly name");
            continue;
        };
        let leaf = certificates.iter().find(|cert| match (&key.local_key_id, &cert.local_key_id) {
            (Some(key_id), Some(cert_id)) => key_id == cert_id,
            (None, _) => cert.name.as_deref() == Some(alias.as_str()),
            _ => false
        });
        let chain = match leaf {
            Some(leaf) => certificate_chain(leaf, &certificates),
            None => vec![]
        };
        entries.push(Entry::PrivateKey {
            alias,
            protected_key: key.key,
            chain
        });
    }
    // Named certificates that belong to no key are trusted certificate entries
    for cert in &certificates {
        if let (Some(name), None) = (&cert.name, &cert.local_key_id) {
            entries.push(Entry::TrustedCertificate {
                alias: name.clone()
            });
        }
    }
    Ok(entries)
}

fn read_bag(
    bag: SafeBag,
    keys: &mut Vec<KeyBag>,
    certificates: &mut Vec<CertificateBag>
) -> Result<(), KeyStoreError> {
    let mut name = None;
    let mut local_key_id = None;
    for attribute in bag.bag_attributes.iter().flatten() {
        let Some(value) = attribute.attr_values.first() else {
            continue;
        };
        if is(&attribute.attr_id, FRIENDLY_NAME) {
            let bmp: BmpBytes = decode(value.as_bytes(), "friendly name")?;
            name = Some(from_bmp(&bmp.0)?);
        } else if is(&attribute.attr_id, LOCAL_KEY_ID) {
            let id: OctetString = decode(value.as_bytes(), "local key id")?;
            local_key_id = Some(id.to_vec());
        }
    }

    let value = bag.bag_value.as_bytes();
    if is(&bag.bag_id, SHROUDED_KEY_BAG) {
        keys.push(KeyBag {
            name,
            local_key_id,
            key: ProtectedKey::Pkcs12(decode(value, "shrouded key bag")?)
        });
    } else if is(&bag.bag_id, KEY_BAG) {
        keys.push(KeyBag {
            name,
            local_key_id,
            key: ProtectedKey::Plain(value.to_vec())
        });
    } else if is(&bag.bag_id, CERT_BAG) {
        let cert_bag: CertBag = decode(value, "certificate bag")?;
        if !is(&cert_bag.cert_id, X509_CERTIFICATE) {
            debug!("Skipping certificate of type {:?}", cert_bag.cert_id);
            return Ok(());
        }
        let der = cert_bag.cert_value.to_vec();
        certificates.push(CertificateBag {
            name,
            local_key_id,
            parsed: decode(&der, "certificate")?,
            der
        });
    } else {
        debug!("Skipping PKCS#12 bag of type {:?}", bag.bag_id);
    }
    Ok(())
}

// Leaf first, then each issuer found in the keystore up to a self-signed root
fn certificate_chain(leaf: &CertificateBag, certificates: &[CertificateBag]) -> Vec<Vec<u8>> {
    let mut chain = vec![leaf.der.clone()];
    let mut current = leaf;
    while chain.len() < certificates.len() {
        let tbs = &current.parsed.tbs_certificate;
        if tbs.issuer == tbs.subject {
            break;
        }
        let issuer = certificates.iter().find(|cert| {
            cert.parsed.tbs_certificate.subject == tbs.issuer && !chain.contains(&cert.der)
        });
        match issuer {
            Some(issuer) => {
                chain.push(issuer.der.clone());
                current = issuer;
            }
            None => break
        }
    }
    chain
}

/// Opens a shrouded key bag. A padding failure or a result that isn't a
/// PKCS#8 key both mean the key password is wrong.
pub(crate) fn decrypt_key(
    info: &EncryptedPrivateKeyInfo,
    alias: &str,
    key_password: &str
) -> Result<Vec<u8>, KeyStoreError> {
    let wrong_password = || KeyStoreError::KeyPassword {
        alias: alias.into()
    };
    let plain = decrypt(
        &info.encryption_algorithm,
        &info.encrypted_data,
        key_password,
        wrong_password()
    )?;
    // Wrong keys still pass the padding check about one time in 256
    if pkcs8::PrivateKeyInfo::try_from(plain.as_slice()).is_err() {
        return Err(wrong_password());
    }
    Ok(plain)
}

/// Decrypts `data` with a password-based scheme. Returns `wrong_password`
/// when the padding doesn't check out.
pub(crate) fn decrypt(
    algorithm: &AlgorithmIdentifier,
    data: &[u8],
    password: &str,
    wrong_password: KeyStoreError
) -> Result<Vec<u8>, KeyStoreError> {
    let oid = &algorithm.algorithm;
    let (cipher, key, iv) = if is(oid, PBES2) {
        let params: Pbes2Parameters = parameters(algorithm)?;
        let cipher = pbes2_cipher(&params.encryption_scheme.algorithm)?;
        let iv: OctetString = parameters(&params.encryption_scheme)?;
        let key = pbkdf2_key(&params.key_derivation_func, password, cipher.key_len())?;
        (cipher, key, iv.to_vec())
    } else {
        let cipher = if is(oid, PBE_SHA1_3DES) {
            Cipher::TripleDes
        } else if is(oid, PBE_SHA1_RC2_128) {
            Cipher::Rc2 { bits: 128 }
        } else if is(oid, PBE_SHA1_RC2_40) {
            Cipher::Rc2 { bits: 40 }
        } else {
            return Err(unsupported(oid));
        };
        let params: PbeParameter = parameters(algorithm)?;
        let password = bmp_password(password);
        let key = derive_key::<Sha1>(64, &password, &params.salt, KDF_KEY, params.iterations, cipher.key_len());
        let iv = derive_key::<Sha1>(64, &password, &params.salt, KDF_IV, params.iterations, 8);
        (cipher, key, iv)
    };

    let bad_length = |_| KeyStoreError::Corrupt("cipher IV has the wrong length".into());
    let plain = match cipher {
        Cipher::Aes128 => Decryptor::<Aes128>::new_from_slices(&key, &iv)
            .map_err(bad_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        Cipher::Aes192 => Decryptor::<Aes192>::new_from_slices(&key, &iv)
            .map_err(bad_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        Cipher::Aes256 => Decryptor::<Aes256>::new_from_slices(&key, &iv)
            .map_err(bad_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        Cipher::TripleDes => Decryptor::<TdesEde3>::new_from_slices(&key, &iv)
            .map_err(bad_length)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        Cipher::Rc2 { bits } => {
            Decryptor::<Rc2>::inner_iv_slice_init(Rc2::new_with_eff_key_len(&key, bits), &iv)
                .map_err(bad_length)?
                .decrypt_padded_vec_mut::<Pkcs7>(data)
        }
    };
    plain.map_err(|_| wrong_password)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cipher {
    Aes128,
    Aes192,
    Aes256,
    TripleDes,
    Rc2 { bits: usize }
}

impl Cipher {
    fn key_len(self) -> usize {
        match self {
            Cipher::Aes128 => 16,
            Cipher::Aes192 | Cipher::TripleDes => 24,
            Cipher::Aes256 => 32,
            Cipher::Rc2 { bits } => bits / 8
        }
    }
}

fn pbes2_cipher(oid: &ObjectIdentifier) -> Result<Cipher, KeyStoreError> {
    if is(oid, AES128_CBC) {
        Ok(Cipher::Aes128)
    } else if is(oid, AES192_CBC) {
        Ok(Cipher::Aes192)
    } else if is(oid, AES256_CBC) {
        Ok(Cipher::Aes256)
    } else if is(oid, DES_EDE3_CBC) {
        Ok(Cipher::TripleDes)
    } else {
        Err(unsupported(oid))
    }
}

// PBES2 hands the password to PBKDF2 as UTF-8
fn pbkdf2_key(kdf: &AlgorithmIdentifier, password: &str, key_len: usize) -> Result<Vec<u8>, KeyStoreError> {
    if !is(&kdf.algorithm, PBKDF2) {
        return Err(unsupported(&kdf.algorithm));
    }
    let params: Pbkdf2Parameters = parameters(kdf)?;
    let key_len = params.key_length.map_or(key_len, |len| len as usize);
    let (password, salt, rounds) = (password.as_bytes(), &params.salt[..], params.iteration_count);

    let mut key = vec![0; key_len];
    match params.prf.as_ref().map(|prf| &prf.algorithm) {
        None => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, rounds, &mut key),
        Some(prf) if is(prf, HMAC_SHA1) => pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, rounds, &mut key),
        Some(prf) if is(prf, HMAC_SHA256) => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, rounds, &mut key)
        }
        Some(prf) if is(prf, HMAC_SHA384) => {
            pbkdf2::pbkdf2_hmac::<Sha384>(password, salt, rounds, &mut key)
        }
        Some(prf) if is(prf, HMAC_SHA512) => {
            pbkdf2::pbkdf2_hmac::<Sha512>(password, salt, rounds, &mut key)
        }
        Some(prf) => return Err(unsupported(prf))
    }
    Ok(key)
}

/// The keystore MAC: HMAC keyed from the store password through the PKCS#12
/// KDF, over the encoded authenticated safe.
pub(crate) fn mac(
    digest: &ObjectIdentifier,
    store_password: &str,
    salt: &[u8],
    rounds: u32,
    data: &[u8]
) -> Result<Vec<u8>, KeyStoreError> {
    let password = bmp_password(store_password);
    if is(digest, SHA1_OID) {
        hmac_tag::<Hmac<Sha1>>(&derive_key::<Sha1>(64, &password, salt, KDF_MAC, rounds, 20), data)
    } else if is(digest, SHA256_OID) {
        hmac_tag::<Hmac<Sha256>>(&derive_key::<Sha256>(64, &password, salt, KDF_MAC, rounds, 32), data)
    } else if is(digest, SHA384_OID) {
        hmac_tag::<Hmac<Sha384>>(&derive_key::<Sha384>(128, &password, salt, KDF_MAC, rounds, 48), data)
    } else if is(digest, SHA512_OID) {
        hmac_tag::<Hmac<Sha512>>(&derive_key::<Sha512>(128, &password, salt, KDF_MAC, rounds, 64), data)
    } else {
        Err(unsupported(digest))
    }
}

fn hmac_tag<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| KeyStoreError::Corrupt("MAC key has the wrong length".into()))?;
    Mac::update(&mut mac, data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// The PKCS#12 key derivation function (RFC 7292 appendix B.2).
/// `block_len` is the digest's input block size.
pub(crate) fn derive_key<D: Digest>(
    block_len: usize,
    password: &[u8],
    salt: &[u8],
    id: u8,
    rounds: u32,
    len: usize
) -> Vec<u8> {
    let fill = |source: &[u8]| -> Vec<u8> {
        let filled_len = source.len().div_ceil(block_len) * block_len;
        source.iter().cycle().take(filled_len).copied().collect()
    };
    let diversifier = vec![id; block_len];
    let mut input = fill(salt);
    input.extend(fill(password));

    let mut out = Vec::with_capacity(len);
    loop {
        let mut block = D::new()
            .chain_update(&diversifier)
            .chain_update(&input)
            .finalize();
        for _ in 1..rounds {
            block = D::digest(&block);
        }
        out.extend_from_slice(&block);
        if out.len() >= len {
            out.truncate(len);
            return out;
        }

        // Each input block becomes (block + B + 1) mod 2^(8 * block_len)
        let b: Vec<u8> = block.iter().cycle().take(block_len).copied().collect();
        for chunk in input.chunks_mut(block_len) {
            let mut carry = 1u16;
            for (byte, add) in chunk.iter_mut().zip(&b).rev() {
                let sum = *byte as u16 + *add as u16 + carry;
                *byte = sum as u8;
                carry = sum >> 8;
            }
        }
    }
}

/// PKCS#12 passwords are BMPStrings with a two byte terminator.
pub(crate) fn bmp_password(password: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = password.encode_utf16().flat_map(u16::to_be_bytes).collect();
    bytes.extend([0, 0]);
    bytes
}

fn from_bmp(bytes: &[u8]) -> Result<String, KeyStoreError> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| KeyStoreError::Corrupt("friendly name is not valid UTF-16".into()))
}

fn parameters<T: Decode>(algorithm: &AlgorithmIdentifier) -> Result<T, KeyStoreError> {
    let params = algorithm.parameters.as_ref().ok_or_else(|| {
        KeyStoreError::Corrupt(format!("{:?} is missing its parameters", algorithm.algorithm))
    })?;
    decode(params.as_bytes(), "algorithm parameters")
}

fn decode<T: Decode>(bytes: &[u8], what: &str) -> Result<T, KeyStoreError> {
    rasn::der::decode(bytes).map_err(|e| KeyStoreError::Corrupt(format!("{what}: {e}")))
}

fn is(oid: &ObjectIdentifier, expected: &Oid) -> bool {
    **oid == *expected
}

fn unsupported(oid: &Oid) -> KeyStoreError {
    KeyStoreError::Corrupt(format!("unsupported algorithm {oid:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{testing_key_material, JksBuilder, Pkcs12Builder};
    use crate::KeyStore;

    const AES_FIXTURE: &[u8] = include_bytes!("../testdata/release-aes.p12");
    const LEGACY_FIXTURE: &[u8] = include_bytes!("../testdata/release-legacy.p12");
    const FIXTURE_KEY: &[u8] = include_bytes!("../testdata/release.pk8");
    const FIXTURE_CERT: &[u8] = include_bytes!("../testdata/release.der");

    #[test]
    fn kdf_matches_published_vectors() {
        let salt = [0x0a, 0x58, 0xcf, 0x64, 0x53, 0x0d, 0x82, 0x3f];
        let password = bmp_password("smeg");
        assert_eq!(
            hex::encode(derive_key::<Sha1>(64, &password, &salt, KDF_KEY, 1, 24)),
            "8aaae6297b6cb04642ab5b077851284eb7128f1a2a7fbca3"
        );
        assert_eq!(
            hex::encode(derive_key::<Sha1>(64, &password, &salt, KDF_IV, 1, 8)),
            "79993dfe048d3b76"
        );
    }

    #[test]
    fn reads_openssl_keystores() {
        // `openssl pkcs12 -export -name release`, with and without -legacy
        for fixture in [AES_FIXTURE, LEGACY_FIXTURE] {
            let keystore = KeyStore::load(fixture, "store-secret").unwrap();
            assert_eq!(keystore.aliases().collect::<Vec<_>>(), ["release"]);

            let material = keystore.key_material("release", "store-secret").unwrap();
            assert_eq!(material.private_key_der(), FIXTURE_KEY);
            assert_eq!(material.certificate_chain(), [FIXTURE_CERT.to_vec()]);
        }
    }

    #[test]
    fn wrong_store_password_fails_the_mac() {
        for fixture in [AES_FIXTURE, LEGACY_FIXTURE] {
            assert_eq!(
                KeyStore::load(fixture, "HEZWIN123").err(),
                Some(KeyStoreError::StorePassword)
            );
        }
    }

    #[test]
    fn separate_key_password() {
        let material = testing_key_material("release");
        let store = Pkcs12Builder::new()
            .private_key(&material, "key-secret")
            .build("store-secret");

        let keystore = KeyStore::load(&store, "store-secret").unwrap();
        let loaded = keystore.key_material("release", "key-secret").unwrap();
        assert_eq!(loaded.private_key_der(), material.private_key_der());
        assert_eq!(loaded.certificate_chain(), material.certificate_chain());

        let err = keystore.key_material("release", "store-secret").unwrap_err();
        assert_eq!(
            err,
            KeyStoreError::KeyPassword {
                alias: "release".into()
            }
        );
        assert!(err.is_credential());
    }

    #[test]
    fn aliases_come_from_friendly_names() {
        let release = testing_key_material("release");
        let store = Pkcs12Builder::new()
            .private_key(&release, "store-secret")
            .unnamed_private_key(&testing_key_material("upload"), "store-secret")
            .trusted_certificate("ca", release.leaf_certificate())
            .build("store-secret");
        let keystore = KeyStore::load(&store, "store-secret").unwrap();
        assert_eq!(keystore.aliases().collect::<Vec<_>>(), ["release", "ca"]);

        assert!(keystore.key_material("Release", "store-secret").is_ok());
        for missing in ["upload", "ca", "debug"] {
            assert_eq!(
                keystore.key_material(missing, "store-secret").err(),
                Some(KeyStoreError::AliasNotFound {
                    alias: missing.into()
                })
            );
        }
    }

    #[test]
    fn key_without_certificate_has_empty_chain() {
        let material = testing_key_material("release");
        let store = Pkcs12Builder::new()
            .private_key_without_certificate(&material, "store-secret")
            .build("store-secret");
        let keystore = KeyStore::load(&store, "store-secret").unwrap();
        assert!(matches!(
            keystore.key_material("release", "store-secret"),
            Err(KeyStoreError::EmptyChain { .. })
        ));
    }

    #[test]
    fn detects_format_by_magic() {
        let material = testing_key_material("release");
        let jks = JksBuilder::new()
            .private_key(&material, "store-secret")
            .build("store-secret");
        let p12 = Pkcs12Builder::new()
            .private_key(&material, "store-secret")
            .build("store-secret");
        for store in [jks, p12] {
            let keystore = KeyStore::load(&store, "store-secret").unwrap();
            assert!(keystore.key_material("release", "store-secret").is_ok());
        }

        // A SEQUENCE that is no PFX
        assert!(matches!(
            KeyStore::load(&[0x30, 0x03, 0x02, 0x01, 0x03], "x"),
            Err(KeyStoreError::Corrupt(_))
        ));
    }
}
