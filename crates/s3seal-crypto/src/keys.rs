//! Data encryption keys
//!
//! A DEK is generated fresh for every object (and once per multipart upload),
//! lives only in memory, and is zeroized when dropped.

use crate::{CryptoError, Result};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of a legacy CBC initialization vector in bytes
pub const CBC_IV_SIZE: usize = 16;

/// AES key lengths accepted for content and key-encryption keys
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum KeyLength {
    /// AES-128
    Aes128,
    /// AES-192
    Aes192,
    /// AES-256
    #[default]
    Aes256,
}

impl KeyLength {
    /// Key size in bytes
    pub fn bytes(&self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    /// Key size in bits
    pub fn bits(&self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Look up the key length for a raw key
    pub fn from_key_bytes(len: usize) -> Result<Self> {
        match len {
            16 => Ok(Self::Aes128),
            24 => Ok(Self::Aes192),
            32 => Ok(Self::Aes256),
            other => Err(CryptoError::InvalidKey(format!(
                "AES keys must be 16, 24 or 32 bytes, got {}",
                other
            ))),
        }
    }
}

impl TryFrom<u32> for KeyLength {
    type Error = CryptoError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            128 => Ok(Self::Aes128),
            192 => Ok(Self::Aes192),
            256 => Ok(Self::Aes256),
            other => Err(CryptoError::InvalidKey(format!(
                "unsupported key length {} bits",
                other
            ))),
        }
    }
}

impl From<KeyLength> for u32 {
    fn from(len: KeyLength) -> u32 {
        len.bits()
    }
}

/// A Data Encryption Key together with the IV or nonce it is used with
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl DataKey {
    /// Generate a random key of the given length and a random GCM nonce
    pub fn generate(length: KeyLength) -> Self {
        let mut key = vec![0u8; length.bytes()];
        let mut iv = vec![0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut key);
        rand::RngCore::fill_bytes(&mut OsRng, &mut iv);
        Self { key, iv }
    }

    /// Create a DEK from raw parts
    pub fn from_parts(key: &[u8], iv: &[u8]) -> Result<Self> {
        KeyLength::from_key_bytes(key.len())?;
        if iv.len() != NONCE_SIZE && iv.len() != CBC_IV_SIZE {
            return Err(CryptoError::InvalidNonce(format!(
                "iv must be {} or {} bytes, got {}",
                NONCE_SIZE,
                CBC_IV_SIZE,
                iv.len()
            )));
        }
        Ok(Self {
            key: key.to_vec(),
            iv: iv.to_vec(),
        })
    }

    /// Get the key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Get the IV or nonce bytes
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Length of the key
    pub fn length(&self) -> KeyLength {
        // Lengths are validated on construction
        KeyLength::from_key_bytes(self.key.len()).unwrap_or_default()
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("key", &"[REDACTED]")
            .field("bits", &(self.key.len() * 8))
            .finish()
    }
}
