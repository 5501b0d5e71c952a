//! Streaming content encryption
//!
//! Every transform here is a `std::io::Read` adapter over a forward-only
//! source, so a live network body can be encrypted or decrypted without ever
//! holding the whole object:
//!
//! - [`EncryptingReader`]: AES-GCM, appends the tag after the last byte
//! - [`DecryptingReader`]: AES-GCM, holds back the tag tail and verifies at EOF
//! - [`RangedDecryptingReader`]: CTR decryption of a block-aligned byte range
//! - [`CbcDecryptingReader`]: legacy AES/CBC/PKCS5Padding content
//!
//! Errors raised while reading surface as `io::Error`; convert them back with
//! `CryptoError::from` to get the structured error.

use crate::{
    gcm::{GcmKeys, Keystream, SegmentDigest, TagAccumulator, BLOCK_SIZE, DEFAULT_TAG_LENGTH_BITS},
    keys::{DataKey, CBC_IV_SIZE},
    range::ByteRange,
    CryptoError, Result,
};
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use std::io::{self, Read};

/// Bytes pulled from the source per refill
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Algorithm id reported in GCM authentication failures
pub const GCM_ALGORITHM: &str = "AES/GCM/NoPadding";

/// Called once the source is exhausted with the GHASH digest of everything
/// encrypted; the returned bytes are emitted after the ciphertext
pub type SegmentFinish = Box<dyn FnOnce(SegmentDigest) -> Result<Vec<u8>> + Send>;

/// Read from `inner`, retrying on `Interrupted`
fn read_source<R: Read>(inner: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match inner.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Serve buffered output into `buf`
fn drain(out: &[u8], pos: &mut usize, buf: &mut [u8]) -> usize {
    let n = (out.len() - *pos).min(buf.len());
    buf[..n].copy_from_slice(&out[*pos..*pos + n]);
    *pos += n;
    n
}

/// Turn a `fill` result into a read result, remembering the first
/// non-I/O failure in `failed`
///
/// Source I/O errors leave the reader where it was, so a retry may succeed.
/// Anything else means the stream can no longer be trusted and every later
/// read must fail the same way.
fn settle(failed: &mut Option<CryptoError>, result: Result<()>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(CryptoError::Io(e)) => Err(e),
        Err(err) => {
            let reported = err.replay().into_io();
            *failed = Some(err);
            Err(reported)
        }
    }
}

/// Lazily encrypts a plaintext stream with AES-GCM
pub struct EncryptingReader<R> {
    inner: R,
    keystream: Keystream,
    accumulator: Option<TagAccumulator>,
    finish: Option<SegmentFinish>,
    out: Vec<u8>,
    pos: usize,
    consumed: u64,
    expected_len: Option<u64>,
    failed: Option<CryptoError>,
    done: bool,
}

impl<R: Read> EncryptingReader<R> {
    /// Encrypt a whole object; the tag is appended after the last byte
    pub fn new(inner: R, dek: &DataKey, aad: &[u8], tag_length_bits: u32) -> Result<Self> {
        let keys = GcmKeys::new(dek.key(), dek.iv(), tag_length_bits)?;
        let keystream = keys.keystream_at(0)?;
        let accumulator = keys.accumulator(aad);
        let finish: SegmentFinish =
            Box::new(move |digest| Ok(keys.tag(digest.y, digest.aad_len, digest.text_len)));
        Ok(Self::from_parts(inner, keystream, accumulator, finish))
    }

    /// Encrypt one segment of a longer stream, starting at plaintext byte
    /// `offset`. `finish` decides what (if anything) follows the ciphertext.
    pub fn segment(inner: R, keys: &GcmKeys, offset: u64, finish: SegmentFinish) -> Result<Self> {
        let keystream = keys.keystream_at(offset)?;
        Ok(Self::from_parts(inner, keystream, keys.accumulator(b""), finish))
    }

    fn from_parts(
        inner: R,
        keystream: Keystream,
        accumulator: TagAccumulator,
        finish: SegmentFinish,
    ) -> Self {
        Self {
            inner,
            keystream,
            accumulator: Some(accumulator),
            finish: Some(finish),
            out: Vec::with_capacity(STREAM_CHUNK_SIZE),
            pos: 0,
            consumed: 0,
            expected_len: None,
            failed: None,
            done: false,
        }
    }

    /// Fail at EOF unless exactly `len` plaintext bytes were read
    pub fn with_expected_len(mut self, len: u64) -> Self {
        self.expected_len = Some(len);
        self
    }

    /// Plaintext bytes consumed so far
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    fn fill(&mut self) -> Result<()> {
        self.out.resize(STREAM_CHUNK_SIZE, 0);
        self.pos = 0;
        let n = match read_source(&mut self.inner, &mut self.out) {
            Ok(n) => n,
            Err(e) => {
                self.out.clear();
                return Err(e.into());
            }
        };
        self.out.truncate(n);

        if n > 0 {
            self.consumed += n as u64;
            self.keystream.apply(&mut self.out)?;
            if let Some(acc) = self.accumulator.as_mut() {
                acc.absorb(&self.out);
            }
            return Ok(());
        }

        self.done = true;
        if let Some(expected) = self.expected_len {
            if expected != self.consumed {
                return Err(CryptoError::LengthMismatch {
                    expected,
                    actual: self.consumed,
                });
            }
        }
        if let (Some(acc), Some(finish)) = (self.accumulator.take(), self.finish.take()) {
            self.out = finish(acc.digest())?;
        }
        Ok(())
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(err) = &self.failed {
                return Err(err.replay().into_io());
            }
            if self.pos < self.out.len() {
                return Ok(drain(&self.out, &mut self.pos, buf));
            }
            if self.done {
                return Ok(0);
            }
            let result = self.fill();
            settle(&mut self.failed, result)?;
        }
    }
}

/// Lazily decrypts an AES-GCM stream of `ciphertext || tag`
///
/// Holds back the last `tag_len` bytes seen and only checks them once the
/// source is exhausted. Plaintext handed out before that point is not yet
/// authenticated.
pub struct DecryptingReader<R> {
    inner: R,
    keys: GcmKeys,
    keystream: Keystream,
    accumulator: Option<TagAccumulator>,
    tail: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    produced: u64,
    expected_len: Option<u64>,
    failed: Option<CryptoError>,
    done: bool,
}

impl<R: Read> DecryptingReader<R> {
    /// Create a decrypting reader
    pub fn new(inner: R, dek: &DataKey, aad: &[u8], tag_length_bits: u32) -> Result<Self> {
        let keys = GcmKeys::new(dek.key(), dek.iv(), tag_length_bits)?;
        let keystream = keys.keystream_at(0)?;
        let accumulator = keys.accumulator(aad);
        Ok(Self {
            inner,
            keystream,
            accumulator: Some(accumulator),
            tail: Vec::with_capacity(keys.tag_len()),
            keys,
            out: Vec::with_capacity(STREAM_CHUNK_SIZE),
            pos: 0,
            produced: 0,
            expected_len: None,
            failed: None,
            done: false,
        })
    }

    /// Fail at EOF unless exactly `len` plaintext bytes were produced
    pub fn with_expected_len(mut self, len: u64) -> Self {
        self.expected_len = Some(len);
        self
    }

    /// Plaintext bytes produced so far
    pub fn bytes_produced(&self) -> u64 {
        self.produced
    }

    fn auth_failure(&self) -> CryptoError {
        CryptoError::AuthenticationFailure {
            algorithm: GCM_ALGORITHM.to_string(),
            tag_length_bits: self.keys.tag_length_bits(),
            bytes: self.produced,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        let n = read_source(&mut self.inner, &mut chunk)?;
        chunk.truncate(n);
        self.pos = 0;

        if n == 0 {
            self.out.clear();
            self.done = true;
            let acc = self.accumulator.take().ok_or_else(|| self.auth_failure())?;
            if self.tail.len() < self.keys.tag_len() {
                return Err(self.auth_failure());
            }
            let digest = acc.digest();
            if !self
                .keys
                .verify(digest.y, digest.aad_len, digest.text_len, &self.tail)
            {
                return Err(self.auth_failure());
            }
            if let Some(expected) = self.expected_len {
                if expected != self.produced {
                    return Err(CryptoError::LengthMismatch {
                        expected,
                        actual: self.produced,
                    });
                }
            }
            return Ok(());
        }

        let mut data = std::mem::take(&mut self.tail);
        data.extend_from_slice(&chunk);
        let release = data.len().saturating_sub(self.keys.tag_len());
        self.tail = data.split_off(release);

        if let Some(acc) = self.accumulator.as_mut() {
            acc.absorb(&data);
        }
        self.keystream.apply(&mut data)?;
        self.produced += data.len() as u64;
        self.out = data;
        Ok(())
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(err) = &self.failed {
                return Err(err.replay().into_io());
            }
            if self.pos < self.out.len() {
                return Ok(drain(&self.out, &mut self.pos, buf));
            }
            if self.done {
                return Ok(0);
            }
            let result = self.fill();
            settle(&mut self.failed, result)?;
        }
    }
}

/// CTR decryption of a ranged GET body
///
/// The body must start on a cipher block boundary. Nothing is authenticated:
/// GCM tags cover the whole object, so a range cannot be verified on its own.
pub struct RangedDecryptingReader<R> {
    inner: R,
    keystream: Keystream,
    remaining: u64,
}

impl<R: Read> RangedDecryptingReader<R> {
    /// Position the keystream at `range.start()`
    ///
    /// With `plaintext_len` known, output stops at the end of the plaintext so
    /// tag bytes inside the range are never returned.
    pub fn new(inner: R, dek: &DataKey, range: &ByteRange, plaintext_len: Option<u64>) -> Result<Self> {
        if range.intra_block_offset() != 0 {
            return Err(CryptoError::InvalidRangeAlignment {
                block_boundary: range.block_index() * BLOCK_SIZE as u64,
                block_size: BLOCK_SIZE as u64,
                offset: range.start(),
            });
        }
        let keys = GcmKeys::new(dek.key(), dek.iv(), DEFAULT_TAG_LENGTH_BITS)?;
        let keystream = keys.keystream_at(range.block_index() * BLOCK_SIZE as u64)?;
        let remaining = match plaintext_len {
            Some(len) => range.len().min(len.saturating_sub(range.start())),
            None => range.len(),
        };
        Ok(Self {
            inner,
            keystream,
            remaining,
        })
    }

    /// Plaintext bytes still to be produced
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: Read> Read for RangedDecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = read_source(&mut self.inner, &mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range body ended with {} bytes outstanding", self.remaining),
            ));
        }
        self.keystream
            .apply(&mut buf[..n])
            .map_err(CryptoError::into_io)?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

enum CbcState {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl CbcState {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if iv.len() != CBC_IV_SIZE {
            return Err(CryptoError::InvalidNonce(format!(
                "CBC IV must be {} bytes, got {}",
                CBC_IV_SIZE,
                iv.len()
            )));
        }
        let invalid = |_| CryptoError::InvalidKey(format!("AES key of {} bytes", key.len()));
        match key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map(Self::Aes128)
                .map_err(invalid),
            24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map(Self::Aes192)
                .map_err(invalid),
            32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map(Self::Aes256)
                .map_err(invalid),
            other => Err(CryptoError::InvalidKey(format!(
                "AES keys must be 16, 24 or 32 bytes, got {}",
                other
            ))),
        }
    }

    fn decrypt_blocks(&mut self, data: &mut [u8]) {
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = aes::Block::from_mut_slice(chunk);
            match self {
                Self::Aes128(c) => c.decrypt_block_mut(block),
                Self::Aes192(c) => c.decrypt_block_mut(block),
                Self::Aes256(c) => c.decrypt_block_mut(block),
            }
        }
    }
}

/// Decrypts prior-generation AES/CBC/PKCS5Padding content
///
/// The last full block is held back until EOF so the padding can be removed.
pub struct CbcDecryptingReader<R> {
    inner: R,
    state: CbcState,
    held: Vec<u8>,
    out: Vec<u8>,
    pos: usize,
    produced: u64,
    expected_len: Option<u64>,
    failed: Option<CryptoError>,
    done: bool,
}

impl<R: Read> CbcDecryptingReader<R> {
    /// Create a reader from a DEK carrying a 16-byte IV
    pub fn new(inner: R, dek: &DataKey) -> Result<Self> {
        Ok(Self {
            inner,
            state: CbcState::new(dek.key(), dek.iv())?,
            held: Vec::with_capacity(2 * BLOCK_SIZE),
            out: Vec::new(),
            pos: 0,
            produced: 0,
            expected_len: None,
            failed: None,
            done: false,
        })
    }

    /// Fail at EOF unless exactly `len` plaintext bytes were produced
    pub fn with_expected_len(mut self, len: u64) -> Self {
        self.expected_len = Some(len);
        self
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        let n = read_source(&mut self.inner, &mut chunk)?;
        chunk.truncate(n);
        self.pos = 0;

        if n == 0 {
            self.done = true;
            if self.held.len() != BLOCK_SIZE {
                return Err(CryptoError::format(
                    "content",
                    format!(
                        "CBC ciphertext is not a positive multiple of {} bytes",
                        BLOCK_SIZE
                    ),
                ));
            }
            let mut last = std::mem::take(&mut self.held);
            self.state.decrypt_blocks(&mut last);
            let pad = usize::from(last[BLOCK_SIZE - 1]);
            if pad == 0 || pad > BLOCK_SIZE || last[BLOCK_SIZE - pad..].iter().any(|&b| usize::from(b) != pad) {
                return Err(CryptoError::format("content", "invalid PKCS#5 padding"));
            }
            last.truncate(BLOCK_SIZE - pad);
            self.produced += last.len() as u64;
            self.out = last;
            if let Some(expected) = self.expected_len {
                if expected != self.produced {
                    return Err(CryptoError::LengthMismatch {
                        expected,
                        actual: self.produced,
                    });
                }
            }
            return Ok(());
        }

        let mut data = std::mem::take(&mut self.held);
        data.extend_from_slice(&chunk);
        // Keep a trailing partial block plus the last whole block
        let keep = match data.len() % BLOCK_SIZE {
            0 => BLOCK_SIZE,
            partial => partial + BLOCK_SIZE,
        }
        .min(data.len());
        let release = data.len() - keep;
        self.held = data.split_off(release);
        self.state.decrypt_blocks(&mut data);
        self.produced += data.len() as u64;
        self.out = data;
        Ok(())
    }
}

impl<R: Read> Read for CbcDecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(err) = &self.failed {
                return Err(err.replay().into_io());
            }
            if self.pos < self.out.len() {
                return Ok(drain(&self.out, &mut self.pos, buf));
            }
            if self.done {
                return Ok(0);
            }
            let result = self.fill();
            settle(&mut self.failed, result)?;
        }
    }
}
