//! Key-management service capability
//!
//! The network client for a KMS lives outside this crate; the envelope code
//! only needs the two calls below. [`MemoryKeyWrapService`] is a local stand-in
//! used by tests and demos.

use crate::{gcm, keys::NONCE_SIZE};
use anyhow::{anyhow, bail, Context};
use rand::{rngs::OsRng, RngCore};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

/// Encryption context passed to the KMS, must round-trip unchanged
pub type EncryptionContext = BTreeMap<String, String>;

/// Plaintext key returned by the KMS
pub struct UnwrappedKey {
    /// Key the blob was encrypted under, as reported by the service
    pub key_id: String,
    /// The recovered key
    pub plaintext: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for UnwrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwrappedKey")
            .field("key_id", &self.key_id)
            .field("plaintext", &"[REDACTED]")
            .finish()
    }
}

/// Remote key wrapping, e.g. a cloud KMS
pub trait KeyWrapService: Send + Sync {
    /// Encrypt `plaintext_key` under `key_id`, binding `context`
    fn encrypt(
        &self,
        key_id: &str,
        plaintext_key: &[u8],
        context: &EncryptionContext,
    ) -> anyhow::Result<Vec<u8>>;

    /// Decrypt a blob produced by [`KeyWrapService::encrypt`]
    fn decrypt(&self, ciphertext_blob: &[u8], context: &EncryptionContext)
        -> anyhow::Result<UnwrappedKey>;
}

/// In-process KMS holding its master keys in memory
///
/// Blobs are `len(key_id) || key_id || nonce || AES-GCM(master, context)`.
#[derive(Default)]
pub struct MemoryKeyWrapService {
    keys: BTreeMap<String, Zeroizing<Vec<u8>>>,
}

impl MemoryKeyWrapService {
    /// Create a service with no keys
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly generated 256-bit master key
    pub fn with_key(mut self, key_id: impl Into<String>) -> Self {
        let mut key = Zeroizing::new(vec![0u8; 32]);
        OsRng.fill_bytes(&mut key);
        self.keys.insert(key_id.into(), key);
        self
    }

    fn master(&self, key_id: &str) -> anyhow::Result<&[u8]> {
        self.keys
            .get(key_id)
            .map(|k| k.as_slice())
            .ok_or_else(|| anyhow!("key '{}' not found", key_id))
    }
}

fn context_aad(context: &EncryptionContext) -> anyhow::Result<Vec<u8>> {
    serde_json::to_vec(context).context("encoding encryption context")
}

impl KeyWrapService for MemoryKeyWrapService {
    fn encrypt(
        &self,
        key_id: &str,
        plaintext_key: &[u8],
        context: &EncryptionContext,
    ) -> anyhow::Result<Vec<u8>> {
        let master = self.master(key_id)?;
        let id_len = u8::try_from(key_id.len()).context("key id longer than 255 bytes")?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let sealed = gcm::seal(master, &nonce, &context_aad(context)?, plaintext_key)?;

        let mut blob = Vec::with_capacity(1 + key_id.len() + NONCE_SIZE + sealed.len());
        blob.push(id_len);
        blob.extend_from_slice(key_id.as_bytes());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    fn decrypt(
        &self,
        ciphertext_blob: &[u8],
        context: &EncryptionContext,
    ) -> anyhow::Result<UnwrappedKey> {
        let (&id_len, rest) = ciphertext_blob
            .split_first()
            .ok_or_else(|| anyhow!("empty ciphertext blob"))?;
        let id_len = usize::from(id_len);
        if rest.len() < id_len + NONCE_SIZE {
            bail!("ciphertext blob truncated");
        }
        let (id, rest) = rest.split_at(id_len);
        let (nonce, sealed) = rest.split_at(NONCE_SIZE);
        let key_id = std::str::from_utf8(id).context("key id is not UTF-8")?;

        let master = self.master(key_id)?;
        let plaintext = gcm::open(master, nonce, &context_aad(context)?, sealed)
            .context("ciphertext blob does not match key or encryption context")?;
        Ok(UnwrappedKey {
            key_id: key_id.to_string(),
            plaintext: Zeroizing::new(plaintext),
        })
    }
}
