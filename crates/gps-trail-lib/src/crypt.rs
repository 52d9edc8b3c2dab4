//! Record encryption
//!
//! An encrypted row is laid out as
//! `[key id: 4 bytes LE, optional][iv: 24 bytes][cipher output][tag: 32 bytes]`.
//! The cipher is XSalsa20, so the output is exactly as long as the plain row and every
//! encrypted record of a table has the same size. The tag is a keyed BLAKE3 hash of the IV and
//! the cipher output; a record whose tag does not match is never decrypted.

use crate::{DataError, Result};
use dashmap::DashMap;
use rand::RngCore;
use salsa20::XSalsa20;
use salsa20::cipher::{KeyIvInit, StreamCipher};
use std::fmt;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 24;
pub const KEY_ID_LEN: usize = 4;
pub const TAG_LEN: usize = blake3::OUT_LEN;

const MAC_KEY_CONTEXT: &str = "gps-trail 2024 encrypted row tag";

/// Symmetric key for one user-data key id
#[derive(Clone, PartialEq, Eq)]
pub struct CryptKey([u8; KEY_LEN]);

impl CryptKey {
    /// A fresh random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn apply_keystream(&self, iv: &[u8; IV_LEN], buf: &mut [u8]) {
        let key = salsa20::Key::from(self.0);
        let nonce = salsa20::XNonce::from(*iv);
        let mut cipher = XSalsa20::new(&key, &nonce);
        cipher.apply_keystream(buf);
    }

    /// Tag over `iv || body`, keyed by a key derived from this one
    fn tag(&self, iv: &[u8; IV_LEN], body: &[u8]) -> blake3::Hash {
        let mac_key = blake3::derive_key(MAC_KEY_CONTEXT, &self.0);
        let mut hasher = blake3::Hasher::new_keyed(&mac_key);
        hasher.update(iv);
        hasher.update(body);
        hasher.finalize()
    }
}

impl fmt::Debug for CryptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CryptKey(..)")
    }
}

/// Resolves user-data key ids to keys
///
/// Shared between the flushing writer and any loader threads.
#[derive(Debug)]
pub struct KeyRegistry {
    keys: DashMap<u32, CryptKey>,
    default_key_id: u32,
}

impl KeyRegistry {
    /// A registry whose default key (used for new records) is `key` under `key_id`
    pub fn new(key_id: u32, key: CryptKey) -> Self {
        let keys = DashMap::new();
        keys.insert(key_id, key);
        Self {
            keys,
            default_key_id: key_id,
        }
    }

    /// Register an additional key, e.g. an older one still referenced by stored rows
    pub fn insert(&self, key_id: u32, key: CryptKey) {
        self.keys.insert(key_id, key);
    }

    pub fn get(&self, key_id: u32) -> Result<CryptKey> {
        self.keys
            .get(&key_id)
            .map(|entry| entry.value().clone())
            .ok_or(DataError::UnknownKey(key_id))
    }

    pub fn default_key_id(&self) -> u32 {
        self.default_key_id
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Encoder/decoder for encrypted rows
pub struct EncryptedRow;

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl EncryptedRow {
    /// Size of an encrypted record holding `row_size` plain bytes
    pub const fn encrypted_size(row_size: usize, with_key_id: bool) -> usize {
        let prefix = if with_key_id { KEY_ID_LEN } else { 0 };
        prefix + IV_LEN + row_size + TAG_LEN
    }

    /// Encrypt with an explicit key, without a key id prefix
    pub fn encode(key: &CryptKey, plain: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encrypted_size(plain.len(), false));
        Self::encode_into(key, plain, &mut out);
        out
    }

    /// Encrypt with the registry's default key, prefixing the key id
    pub fn encode_with_encoded_key(keys: &KeyRegistry, plain: &[u8]) -> Result<Vec<u8>> {
        let key_id = keys.default_key_id();
        let key = keys.get(key_id)?;
        let mut out = Vec::with_capacity(Self::encrypted_size(plain.len(), true));
        out.extend_from_slice(&key_id.to_le_bytes());
        Self::encode_into(&key, plain, &mut out);
        Ok(out)
    }

    fn encode_into(key: &CryptKey, plain: &[u8], out: &mut Vec<u8>) {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);
        out.extend_from_slice(&iv);
        let start = out.len();
        out.extend_from_slice(plain);
        key.apply_keystream(&iv, &mut out[start..]);
        let tag = key.tag(&iv, &out[start..]);
        out.extend_from_slice(tag.as_bytes());
    }

    /// Decrypt a record produced by [`EncryptedRow::encode`]
    pub fn decode(key: &CryptKey, data: &[u8]) -> Result<Vec<u8>> {
        let Some((iv, rest)) = data.split_first_chunk::<IV_LEN>() else {
            tracing::warn!("Encrypted row of {} bytes is shorter than its IV", data.len());
            return Err(DataError::Decrypt(format!(
                "record of {} bytes has no room for an IV",
                data.len()
            )));
        };
        let Some((body, tag)) = rest.split_last_chunk::<TAG_LEN>() else {
            tracing::warn!("Encrypted row of {} bytes is shorter than its tag", data.len());
            return Err(DataError::Decrypt(format!(
                "record of {} bytes has no room for a tag",
                data.len()
            )));
        };
        // Hash equality is constant time
        if key.tag(iv, body) != blake3::Hash::from(*tag) {
            return Err(DataError::Decrypt(
                "record is corrupt or was written with another key".to_string(),
            ));
        }
        let mut plain = body.to_vec();
        key.apply_keystream(iv, &mut plain);
        Ok(plain)
    }

    /// Decrypt a record produced by [`EncryptedRow::encode_with_encoded_key`]
    pub fn decode_with_encoded_key(keys: &KeyRegistry, data: &[u8]) -> Result<Vec<u8>> {
        let Some((key_id, rest)) = data.split_first_chunk::<KEY_ID_LEN>() else {
            tracing::warn!("Encrypted row of {} bytes is shorter than its key id", data.len());
            return Err(DataError::Decrypt(format!(
                "record of {} bytes has no room for a key id",
                data.len()
            )));
        };
        let key_id = u32::from_le_bytes(*key_id);
        let key = keys.get(key_id).inspect_err(|_| {
            tracing::warn!("Encrypted row references unknown key id {key_id}");
        })?;
        Self::decode(&key, rest)
    }
}
