//! # s3seal Client
//!
//! Client-side envelope encryption for S3-compatible object stores.
//!
//! ## Features
//!
//! - **Transparent**: objects are encrypted before they leave the process and
//!   decrypted as they are read back
//! - **Envelope storage**: wrapped keys live in object metadata or in a
//!   sidecar instruction object
//! - **Ranged reads**: decrypt any byte range without fetching the object
//! - **Multipart**: parts of one object can be encrypted on many threads
//! - **Legacy read**: objects from the prior client generation decrypt when
//!   the security profile allows it
//!
//! ## Example
//!
//! ```rust,ignore
//! use s3seal_client::{ClientConfig, EncryptedClient, MemoryObjectStore};
//! use s3seal_crypto::{AesKek, EncryptionMaterials, KeyLength};
//! use std::io::Read;
//!
//! let materials = EncryptionMaterials::aes(AesKek::generate(KeyLength::Aes256));
//! let client = EncryptedClient::new(
//!     MemoryObjectStore::new(),
//!     ClientConfig::default(),
//!     &materials,
//!     None,
//! )?;
//!
//! client.put_object("hello.txt", &b"Hello, World!"[..], 13)?;
//!
//! let mut content = String::new();
//! client.get_object("hello.txt")?.read_to_string(&mut content)?;
//! ```

mod config;
mod encryption;
mod error;
mod multipart;
mod operation;
mod store;

pub use config::{ClientConfig, StorageMode};
pub use encryption::{DecryptedObject, EncryptedClient, PutObjectOutput};
pub use error::{ClientError, Result};
pub use multipart::{MultipartUpload, MAX_PARTS};
pub use operation::{FailureKind, OperationState};
pub use store::{Body, CompletedPart, GetObjectOutput, MemoryObjectStore, ObjectStore, RequestRange};

// Re-export the crypto types needed to configure a client
pub use s3seal_crypto::{
    AesKek, EncryptionContext, EncryptionMaterials, EnvelopeMetadata, KeyLength, KeyWrapService,
    MemoryKeyWrapService, RsaKek, SecurityProfile,
};
