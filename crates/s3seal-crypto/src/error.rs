//! Error types for the s3seal-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur while encrypting, decrypting or wrapping keys
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Malformed range descriptor or envelope field
    #[error("malformed {field}: {reason}")]
    Format { field: String, reason: String },

    /// Ranged decryption was asked to start inside a cipher block
    #[error(
        "ranged decrypt must start on a block boundary: offset {offset} is not a multiple of block size {block_size} (nearest boundary {block_boundary})"
    )]
    InvalidRangeAlignment {
        block_boundary: u64,
        block_size: u64,
        offset: u64,
    },

    /// Authentication tag did not match
    #[error("authentication failed for {algorithm} after {bytes} bytes ({tag_length_bits}-bit tag)")]
    AuthenticationFailure {
        algorithm: String,
        tag_length_bits: u32,
        bytes: u64,
    },

    /// The wrapped data key could not be recovered
    #[error("failed to unwrap data key with {algorithm}: {reason}")]
    Unwrap { algorithm: String, reason: String },

    /// The key that wrapped the data key is not the configured one
    #[error("key mismatch: expected {expected}, object was wrapped with {actual}")]
    KeyMismatch { expected: String, actual: String },

    /// Prior-generation wire format seen while the profile forbids it
    #[error("legacy format '{identifier}' is not accepted by the current security profile")]
    UnsupportedLegacyFormat { identifier: String },

    /// Caller's encryption context uses a key reserved for the envelope
    #[error("encryption context must not contain reserved key '{0}'")]
    ReservedContextKey(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid nonce or IV
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// A stream carried a different number of bytes than declared
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Tag length outside of what GCM permits
    #[error("invalid tag length: {0} bits")]
    InvalidTagLength(u32),

    /// Key wrap service failed (propagated unchanged)
    #[error("key wrap service error: {0}")]
    KeyService(#[source] anyhow::Error),

    /// IO error from the underlying stream
    #[error("io error: {0}")]
    Io(std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CryptoError {
    /// Build a `Format` error for a required field that is absent
    pub fn missing(field: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: "required field is missing".to_string(),
        }
    }

    /// Build a `Format` error for a field with an unusable value
    pub fn format(field: &str, reason: impl Into<String>) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap this error so it can travel through `std::io::Read`
    pub fn into_io(self) -> std::io::Error {
        match self {
            Self::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }

    /// Rebuild an equal error so a reader can report it again on later reads
    pub(crate) fn replay(&self) -> Self {
        match self {
            Self::Format { field, reason } => Self::Format {
                field: field.clone(),
                reason: reason.clone(),
            },
            Self::InvalidRangeAlignment {
                block_boundary,
                block_size,
                offset,
            } => Self::InvalidRangeAlignment {
                block_boundary: *block_boundary,
                block_size: *block_size,
                offset: *offset,
            },
            Self::AuthenticationFailure {
                algorithm,
                tag_length_bits,
                bytes,
            } => Self::AuthenticationFailure {
                algorithm: algorithm.clone(),
                tag_length_bits: *tag_length_bits,
                bytes: *bytes,
            },
            Self::Unwrap { algorithm, reason } => Self::Unwrap {
                algorithm: algorithm.clone(),
                reason: reason.clone(),
            },
            Self::KeyMismatch { expected, actual } => Self::KeyMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::UnsupportedLegacyFormat { identifier } => Self::UnsupportedLegacyFormat {
                identifier: identifier.clone(),
            },
            Self::ReservedContextKey(key) => Self::ReservedContextKey(key.clone()),
            Self::InvalidKey(msg) => Self::InvalidKey(msg.clone()),
            Self::InvalidNonce(msg) => Self::InvalidNonce(msg.clone()),
            Self::LengthMismatch { expected, actual } => Self::LengthMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::InvalidTagLength(bits) => Self::InvalidTagLength(*bits),
            Self::KeyService(e) => Self::KeyService(anyhow::Error::msg(e.to_string())),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Serialization(msg) => Self::Serialization(msg.clone()),
        }
    }

    /// Whether this error means the stored object failed an integrity check
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailure { .. })
    }
}

impl From<std::io::Error> for CryptoError {
    /// Recovers a `CryptoError` that was raised inside a reader
    fn from(err: std::io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<CryptoError>())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(crypto) = inner.downcast::<CryptoError>() {
                    return *crypto;
                }
            }
            return Self::Serialization("unrecoverable reader error".to_string());
        }
        Self::Io(err)
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
