//! # s3seal Crypto
//!
//! Client-side envelope encryption for object storage.
//!
//! This crate provides:
//! - **Streaming AES-GCM**: encrypt and decrypt object bodies as `Read` adapters
//! - **Ranged decryption**: resume the keystream at any block-aligned offset
//! - **Envelope codec**: the wrapped key and cipher parameters as a flat map
//! - **Key wrapping**: KMS-with-context, RSA-OAEP and AES-GCM key wrap
//!
//! ## Security Model
//!
//! - A fresh DEK encrypts every object and never leaves memory unwrapped
//! - The storage service only ever sees ciphertext and wrapped keys
//! - Objects written by the prior client generation can be read when the
//!   security profile opts in, but are never written
//!
//! ## Example
//!
//! ```rust,ignore
//! use s3seal_crypto::{DataKey, DecryptingReader, EncryptingReader, KeyLength};
//!
//! let dek = DataKey::generate(KeyLength::Aes256);
//! let mut sealed = Vec::new();
//! EncryptingReader::new(body, &dek, b"", 128)?.read_to_end(&mut sealed)?;
//!
//! let mut plaintext = Vec::new();
//! DecryptingReader::new(&sealed[..], &dek, b"", 128)?.read_to_end(&mut plaintext)?;
//! ```

pub mod envelope;
pub mod error;
pub mod gcm;
pub mod keys;
pub mod keywrap;
pub mod kms;
pub mod range;
pub mod streaming;

pub use envelope::{
    ContentCipher, DecodeHints, EnvelopeFormat, EnvelopeMetadata, MetadataMap, SecurityProfile,
    WrapAlgorithm, WrappedKey,
};
pub use error::{CryptoError, Result};
pub use gcm::{GcmKeys, SegmentDigest, TagAccumulator, BLOCK_SIZE, DEFAULT_TAG_LENGTH_BITS};
pub use keys::{DataKey, KeyLength};
pub use keywrap::{AesKek, EncryptionMaterials, KeyWrapStrategy, RsaKek};
pub use kms::{EncryptionContext, KeyWrapService, MemoryKeyWrapService, UnwrappedKey};
pub use range::{aligned_request, AlignedRequest, ByteRange};
pub use streaming::{
    CbcDecryptingReader, DecryptingReader, EncryptingReader, RangedDecryptingReader, SegmentFinish,
};

/// Re-exported so callers can build RSA key-encryption keys
pub use rsa;
