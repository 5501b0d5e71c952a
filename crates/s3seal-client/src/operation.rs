//! Per-operation state machine
//!
//! `Start → MaterialsResolved → BodyTransformInProgress → Complete | Failed`.
//! `Failed` is terminal. Nothing here retries: cryptographic failures would
//! fail the same way again, and transport retries belong to the store.

use s3seal_crypto::CryptoError;
use tracing::{debug, warn};

/// Why an operation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed envelope or range descriptor
    Format,
    /// Ranged decrypt did not start on a block boundary
    RangeAlignment,
    /// Authentication tag mismatch
    Authentication,
    /// The DEK could not be unwrapped
    Unwrap,
    /// The DEK was wrapped under a different key
    KeyMismatch,
    /// Legacy envelope under the `Current` profile
    UnsupportedLegacyFormat,
    /// Body length differed from the declared length
    LengthMismatch,
    /// The key wrap service failed
    KeyService,
    /// The object store or the body stream failed
    Transport,
    /// The caller misused the API
    Usage,
}

impl FailureKind {
    /// Classify a crypto error
    pub fn from_crypto(err: &CryptoError) -> Self {
        match err {
            CryptoError::Format { .. }
            | CryptoError::Serialization(_)
            | CryptoError::InvalidTagLength(_) => Self::Format,
            CryptoError::InvalidRangeAlignment { .. } => Self::RangeAlignment,
            CryptoError::AuthenticationFailure { .. } => Self::Authentication,
            CryptoError::Unwrap { .. } | CryptoError::InvalidKey(_) | CryptoError::InvalidNonce(_) => {
                Self::Unwrap
            }
            CryptoError::KeyMismatch { .. } => Self::KeyMismatch,
            CryptoError::UnsupportedLegacyFormat { .. } => Self::UnsupportedLegacyFormat,
            CryptoError::LengthMismatch { .. } => Self::LengthMismatch,
            CryptoError::KeyService(_) => Self::KeyService,
            CryptoError::Io(_) => Self::Transport,
            CryptoError::ReservedContextKey(_) => Self::Usage,
        }
    }

    /// Classify an error surfaced through `std::io::Read`
    pub fn from_io(err: &std::io::Error) -> Self {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<CryptoError>())
            .map(Self::from_crypto)
            .unwrap_or(Self::Transport)
    }
}

/// State of one put or get
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    Start,
    MaterialsResolved,
    BodyTransformInProgress,
    Complete,
    Failed(FailureKind),
}

impl OperationState {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

/// Tracks and logs one operation's state
#[derive(Debug)]
pub(crate) struct OperationTracker {
    operation: &'static str,
    key: String,
    state: OperationState,
}

impl OperationTracker {
    pub(crate) fn start(operation: &'static str, key: &str) -> Self {
        debug!(operation, key, "operation started");
        Self {
            operation,
            key: key.to_string(),
            state: OperationState::Start,
        }
    }

    pub(crate) fn state(&self) -> OperationState {
        self.state
    }

    /// Move forward; transitions out of a terminal state are ignored
    pub(crate) fn advance(&mut self, next: OperationState) {
        if self.state.is_terminal() {
            return;
        }
        debug!(
            operation = self.operation,
            key = %self.key,
            from = ?self.state,
            to = ?next,
            "operation state"
        );
        self.state = next;
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, err: &dyn std::fmt::Display) {
        if self.state.is_terminal() {
            return;
        }
        warn!(
            operation = self.operation,
            key = %self.key,
            kind = ?kind,
            error = %err,
            "operation failed"
        );
        self.state = OperationState::Failed(kind);
    }

    /// Record the outcome of a fallible step
    pub(crate) fn observe<T>(&mut self, result: crate::Result<T>) -> crate::Result<T> {
        if let Err(err) = &result {
            self.fail(err.failure_kind(), err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_is_terminal() {
        let mut tracker = OperationTracker::start("get", "k");
        tracker.advance(OperationState::MaterialsResolved);
        tracker.fail(FailureKind::Unwrap, &"bad key");
        tracker.advance(OperationState::Complete);
        assert_eq!(tracker.state(), OperationState::Failed(FailureKind::Unwrap));
    }

    #[test]
    fn test_classify_io_error() {
        let io = CryptoError::AuthenticationFailure {
            algorithm: "AES/GCM/NoPadding".to_string(),
            tag_length_bits: 128,
            bytes: 0,
        }
        .into_io();
        assert_eq!(FailureKind::from_io(&io), FailureKind::Authentication);

        let plain = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(FailureKind::from_io(&plain), FailureKind::Transport);
    }
}
