//! Range-response descriptors
//!
//! Parses the `Content-Range` value a storage service returns for a ranged GET
//! (`bytes <start>-<end>/<total>`) and computes block-aligned requests.

use crate::{gcm::BLOCK_SIZE, CryptoError, Result};

/// A byte range of a stored object, `end` inclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    start: u64,
    end: u64,
    total: u64,
}

impl ByteRange {
    /// Build a range, enforcing `start <= end < total`
    pub fn new(start: u64, end: u64, total: u64) -> Result<Self> {
        if start > end {
            return Err(CryptoError::format(
                "content-range",
                format!("start {} is after end {}", start, end),
            ));
        }
        if end >= total {
            return Err(CryptoError::format(
                "content-range",
                format!("end {} is not below total {}", end, total),
            ));
        }
        Ok(Self { start, end, total })
    }

    /// Parse a descriptor of the form `bytes <start>-<end>/<total>`
    pub fn parse(descriptor: &str) -> Result<Self> {
        if descriptor.is_empty() {
            return Err(CryptoError::format("content-range", "descriptor is empty"));
        }

        let parts: Vec<&str> = descriptor.split('/').collect();
        if parts.len() != 2 {
            return Err(CryptoError::format(
                "content-range",
                format!("expected '<range>/<total>' in '{}'", descriptor),
            ));
        }

        let unit_and_span: Vec<&str> = parts[0].split(' ').collect();
        if unit_and_span.len() != 2 || unit_and_span[0] != "bytes" {
            return Err(CryptoError::format(
                "content-range",
                format!("expected 'bytes <start>-<end>' in '{}'", descriptor),
            ));
        }

        let bounds: Vec<&str> = unit_and_span[1].split('-').collect();
        if bounds.len() != 2 {
            return Err(CryptoError::format(
                "content-range",
                format!("expected '<start>-<end>' in '{}'", descriptor),
            ));
        }

        let start = parse_field("content-range start", bounds[0])?;
        let end = parse_field("content-range end", bounds[1])?;
        let total = parse_field("content-range total", parts[1])?;

        Self::new(start, end, total)
    }

    /// First byte of the range
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last byte of the range (inclusive)
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Total size of the stored object
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A parsed range always covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Index of the cipher block containing `start`
    pub fn block_index(&self) -> u64 {
        self.start / BLOCK_SIZE as u64
    }

    /// Offset of `start` inside its cipher block
    pub fn intra_block_offset(&self) -> u64 {
        self.start % BLOCK_SIZE as u64
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Inclusive range to request from the store, plus how many leading bytes to
/// skip after decryption to land on the plaintext the caller asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlignedRequest {
    /// First ciphertext byte to request (block aligned)
    pub start: u64,
    /// Last ciphertext byte to request (inclusive)
    pub end: u64,
    /// Bytes to discard from the front of the decrypted output
    pub skip: u64,
    /// Bytes to return after skipping
    pub len: u64,
}

/// Compute the block-aligned ciphertext range for plaintext bytes `start..=end`
///
/// `end` is clamped to the last plaintext byte. Returns `None` when the range
/// falls entirely past the end of the plaintext.
pub fn aligned_request(start: u64, end: u64, plaintext_len: u64) -> Result<Option<AlignedRequest>> {
    if start > end {
        return Err(CryptoError::format(
            "range",
            format!("start {} is after end {}", start, end),
        ));
    }
    if start >= plaintext_len {
        return Ok(None);
    }
    let end = end.min(plaintext_len - 1);
    let aligned_start = start - start % BLOCK_SIZE as u64;
    Ok(Some(AlignedRequest {
        start: aligned_start,
        end,
        skip: start - aligned_start,
        len: end - start + 1,
    }))
}

fn parse_field(field: &str, value: &str) -> Result<u64> {
    // `u64::from_str` also takes a leading '+'
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CryptoError::format(
            field,
            format!("'{}' is not a decimal number", value),
        ));
    }
    value
        .parse::<u64>()
        .map_err(|e| CryptoError::format(field, format!("'{}' is not a u64: {}", value, e)))
}
