//! Client error types

use crate::operation::FailureKind;
use s3seal_crypto::CryptoError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Encryption, decryption, envelope or key wrap failure
    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// The object store failed (propagated unchanged)
    #[error("Object store error: {0}")]
    Store(#[source] anyhow::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No encryption context is registered for this upload id
    #[error("Unknown multipart upload: {0}")]
    UnknownUpload(String),

    /// An encryption context already exists for this upload id
    #[error("Multipart upload already registered: {0}")]
    DuplicateUpload(String),

    /// Parts that must be encrypted first have not been
    #[error("Upload {upload_id}: part {part_number} is waiting on parts {missing:?}")]
    PartsOutstanding {
        upload_id: String,
        part_number: u32,
        missing: Vec<u32>,
    },

    /// Completion was asked for before every part was uploaded
    #[error("Upload {upload_id} cannot complete, parts {missing:?} were never uploaded")]
    Incomplete { upload_id: String, missing: Vec<u32> },

    /// Part number out of range, or already uploaded
    #[error("Invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },

    /// IO error while reading a body
    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl ClientError {
    /// Wrap an object store error, recovering crypto errors raised by our
    /// own readers while the store was consuming them
    pub fn from_store(err: anyhow::Error) -> Self {
        let carries_crypto = err
            .downcast_ref::<std::io::Error>()
            .and_then(|e| e.get_ref())
            .is_some_and(|inner| inner.is::<CryptoError>());
        if carries_crypto {
            return match err.downcast::<std::io::Error>() {
                Ok(io) => Self::from(io),
                Err(err) => Self::Store(err),
            };
        }
        Self::Store(err)
    }

    /// Check if the stored object failed its integrity check
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Crypto(e) if e.is_integrity_failure())
    }

    /// Classify for the operation state machine
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Crypto(e) => FailureKind::from_crypto(e),
            Self::Store(_) | Self::Io(_) => FailureKind::Transport,
            Self::Config(_)
            | Self::UnknownUpload(_)
            | Self::DuplicateUpload(_)
            | Self::PartsOutstanding { .. }
            | Self::Incomplete { .. }
            | Self::InvalidPart { .. } => FailureKind::Usage,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match CryptoError::from(err) {
            CryptoError::Io(io) => Self::Io(io),
            other => Self::Crypto(other),
        }
    }
}
