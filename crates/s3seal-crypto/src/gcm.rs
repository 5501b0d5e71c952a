//! AES-GCM assembled from its parts
//!
//! The content cipher is AES-GCM, but the streaming engine needs two things a
//! one-shot AEAD API cannot give it: a keystream that can be positioned at any
//! block, and a GHASH state that can be fed incrementally (and, for multipart
//! uploads, computed per part and chained afterwards). This module exposes
//! those pieces:
//!
//! - [`GcmKeys`]: per-(key, nonce) material (`H`, `E(K, J0)`, counter base)
//! - [`Keystream`]: 32-bit big-endian CTR keystream starting at `J0 + 1`
//! - [`TagAccumulator`]: incremental GHASH over ciphertext
//!
//! Only 96-bit nonces are supported, so `J0 = nonce || 0^31 || 1`.

use crate::{CryptoError, Result, keys::NONCE_SIZE};
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::{Aes128, Aes192, Aes256};
use ghash::GHash;
use universal_hash::UniversalHash;
use zeroize::Zeroizing;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Default authentication tag length
pub const DEFAULT_TAG_LENGTH_BITS: u32 = 128;

/// Tag lengths GCM allows for general use (NIST SP 800-38D)
pub const ALLOWED_TAG_LENGTHS_BITS: [u32; 5] = [96, 104, 112, 120, 128];

type Block = aes::Block;

/// Validate a tag length and return it in bytes
pub fn tag_len_bytes(tag_length_bits: u32) -> Result<usize> {
    if ALLOWED_TAG_LENGTHS_BITS.contains(&tag_length_bits) {
        Ok(tag_length_bits as usize / 8)
    } else {
        Err(CryptoError::InvalidTagLength(tag_length_bits))
    }
}

#[derive(Clone)]
enum BlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Result<Self> {
        let invalid = |_| CryptoError::InvalidKey(format!("AES key of {} bytes", key.len()));
        match key.len() {
            16 => Aes128::new_from_slice(key).map(Self::Aes128).map_err(invalid),
            24 => Aes192::new_from_slice(key).map(Self::Aes192).map_err(invalid),
            32 => Aes256::new_from_slice(key).map(Self::Aes256).map_err(invalid),
            other => Err(CryptoError::InvalidKey(format!(
                "AES keys must be 16, 24 or 32 bytes, got {}",
                other
            ))),
        }
    }

    fn encrypt(&self, input: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = Block::from(input);
        match self {
            Self::Aes128(c) => c.encrypt_block(&mut block),
            Self::Aes192(c) => c.encrypt_block(&mut block),
            Self::Aes256(c) => c.encrypt_block(&mut block),
        }
        block.into()
    }
}

enum CtrState {
    Aes128(ctr::Ctr32BE<Aes128>),
    Aes192(ctr::Ctr32BE<Aes192>),
    Aes256(ctr::Ctr32BE<Aes256>),
}

/// CTR keystream over the GCM counter space
pub struct Keystream {
    state: CtrState,
}

impl Keystream {
    fn new(key: &[u8], counter: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let invalid = |_| CryptoError::InvalidKey(format!("AES key of {} bytes", key.len()));
        let state = match key.len() {
            16 => ctr::Ctr32BE::<Aes128>::new_from_slices(key, counter)
                .map(CtrState::Aes128)
                .map_err(invalid)?,
            24 => ctr::Ctr32BE::<Aes192>::new_from_slices(key, counter)
                .map(CtrState::Aes192)
                .map_err(invalid)?,
            32 => ctr::Ctr32BE::<Aes256>::new_from_slices(key, counter)
                .map(CtrState::Aes256)
                .map_err(invalid)?,
            other => {
                return Err(CryptoError::InvalidKey(format!(
                    "AES keys must be 16, 24 or 32 bytes, got {}",
                    other
                )))
            }
        };
        Ok(Self { state })
    }

    /// Move to an absolute byte position in the keystream
    pub fn seek(&mut self, position: u64) -> Result<()> {
        let result = match &mut self.state {
            CtrState::Aes128(c) => c.try_seek(position),
            CtrState::Aes192(c) => c.try_seek(position),
            CtrState::Aes256(c) => c.try_seek(position),
        };
        result.map_err(|_| {
            CryptoError::format(
                "offset",
                format!("{} is beyond the GCM keystream limit", position),
            )
        })
    }

    /// XOR the next `buf.len()` keystream bytes into `buf`
    pub fn apply(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = match &mut self.state {
            CtrState::Aes128(c) => c.try_apply_keystream(buf),
            CtrState::Aes192(c) => c.try_apply_keystream(buf),
            CtrState::Aes256(c) => c.try_apply_keystream(buf),
        };
        result.map_err(|_| CryptoError::format("content", "GCM keystream exhausted"))
    }
}

/// Key material derived once per (key, nonce)
#[derive(Clone)]
pub struct GcmKeys {
    key: Zeroizing<Vec<u8>>,
    h: [u8; BLOCK_SIZE],
    tag_mask: [u8; BLOCK_SIZE],
    counter_base: [u8; BLOCK_SIZE],
    tag_len: usize,
}

impl GcmKeys {
    /// Derive GCM material for `key` and a 96-bit `nonce`
    pub fn new(key: &[u8], nonce: &[u8], tag_length_bits: u32) -> Result<Self> {
        let tag_len = tag_len_bytes(tag_length_bits)?;
        if nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonce(format!(
                "GCM nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let cipher = BlockCipher::new(key)?;

        let h = cipher.encrypt([0u8; BLOCK_SIZE]);

        let mut j0 = [0u8; BLOCK_SIZE];
        j0[..NONCE_SIZE].copy_from_slice(nonce);
        j0[BLOCK_SIZE - 1] = 1;
        let tag_mask = cipher.encrypt(j0);

        let mut counter_base = j0;
        counter_base[BLOCK_SIZE - 1] = 2;

        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
            h,
            tag_mask,
            counter_base,
            tag_len,
        })
    }

    /// Tag length in bytes
    pub fn tag_len(&self) -> usize {
        self.tag_len
    }

    /// Tag length in bits
    pub fn tag_length_bits(&self) -> u32 {
        self.tag_len as u32 * 8
    }

    /// Keystream positioned at byte `offset` of the plaintext
    pub fn keystream_at(&self, offset: u64) -> Result<Keystream> {
        let mut keystream = Keystream::new(&self.key, &self.counter_base)?;
        if offset > 0 {
            keystream.seek(offset)?;
        }
        Ok(keystream)
    }

    /// Fresh GHASH accumulator that has already absorbed `aad`
    pub fn accumulator(&self, aad: &[u8]) -> TagAccumulator {
        let mut ghash = self.ghash();
        if !aad.is_empty() {
            ghash.update_padded(aad);
        }
        TagAccumulator {
            ghash,
            pending: [0u8; BLOCK_SIZE],
            pending_len: 0,
            aad_len: aad.len() as u64,
            text_len: 0,
        }
    }

    /// Append a segment digest to a running chain: `acc * H^blocks + y`
    ///
    /// GHASH is a polynomial in `H`, so digests of consecutive segments
    /// computed independently combine into the digest of their concatenation.
    /// Every segment except the last must be a whole number of blocks.
    pub fn chain(&self, acc: [u8; BLOCK_SIZE], segment: &SegmentDigest) -> [u8; BLOCK_SIZE] {
        let blocks = segment.blocks();
        if blocks == 0 || acc == [0u8; BLOCK_SIZE] {
            return xor(&acc, &segment.y);
        }
        xor(&gf_mul(acc, self.h_power(blocks)), &segment.y)
    }

    /// `H^n` by square-and-multiply, `n > 0`
    fn h_power(&self, mut n: u64) -> [u8; BLOCK_SIZE] {
        let mut result: Option<[u8; BLOCK_SIZE]> = None;
        let mut base = self.h;
        while n > 0 {
            if n & 1 == 1 {
                result = Some(match result {
                    Some(r) => gf_mul(r, base),
                    None => base,
                });
            }
            n >>= 1;
            if n > 0 {
                base = gf_mul(base, base);
            }
        }
        result.unwrap_or(base)
    }

    /// Compute the (truncated) tag for a finished GHASH state
    pub fn tag(&self, y: [u8; BLOCK_SIZE], aad_len: u64, text_len: u64) -> Vec<u8> {
        let mut lengths = [0u8; BLOCK_SIZE];
        lengths[..8].copy_from_slice(&(aad_len * 8).to_be_bytes());
        lengths[8..].copy_from_slice(&(text_len * 8).to_be_bytes());

        let mut ghash = self.ghash();
        ghash.update(&[Block::from(xor(&y, &lengths))]);
        let s: [u8; BLOCK_SIZE] = ghash.finalize().into();

        xor(&s, &self.tag_mask)[..self.tag_len].to_vec()
    }

    /// Constant-time tag check
    pub fn verify(&self, y: [u8; BLOCK_SIZE], aad_len: u64, text_len: u64, tag: &[u8]) -> bool {
        let expected = self.tag(y, aad_len, text_len);
        if expected.len() != tag.len() {
            return false;
        }
        expected
            .iter()
            .zip(tag)
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
    }

    fn ghash(&self) -> GHash {
        GHash::new(&Block::from(self.h))
    }
}

/// GHASH state over a run of ciphertext
#[derive(Clone)]
pub struct TagAccumulator {
    ghash: GHash,
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
    aad_len: u64,
    text_len: u64,
}

impl TagAccumulator {
    /// Feed ciphertext bytes, in order
    pub fn absorb(&mut self, mut data: &[u8]) {
        self.text_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (BLOCK_SIZE - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < BLOCK_SIZE {
                return;
            }
            self.ghash.update(&[Block::from(self.pending)]);
            self.pending_len = 0;
        }

        let mut chunks = data.chunks_exact(BLOCK_SIZE);
        for chunk in &mut chunks {
            self.ghash.update(&[Block::clone_from_slice(chunk)]);
        }
        let rest = chunks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    /// Ciphertext bytes absorbed so far
    pub fn text_len(&self) -> u64 {
        self.text_len
    }

    /// Close the run, zero-padding a trailing partial block
    pub fn digest(mut self) -> SegmentDigest {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }
        SegmentDigest {
            y: self.ghash.finalize().into(),
            aad_len: self.aad_len,
            text_len: self.text_len,
        }
    }
}

/// GHASH output for one run of ciphertext
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentDigest {
    /// GHASH state after the run
    pub y: [u8; BLOCK_SIZE],
    /// Associated data absorbed before the run
    pub aad_len: u64,
    /// Ciphertext bytes in the run
    pub text_len: u64,
}

impl SegmentDigest {
    /// Number of GHASH blocks the run occupies
    pub fn blocks(&self) -> u64 {
        self.text_len.div_ceil(BLOCK_SIZE as u64)
    }
}

/// Encrypt `plaintext` in one shot, returning `ciphertext || tag` (128-bit tag)
pub fn seal(key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let keys = GcmKeys::new(key, nonce, DEFAULT_TAG_LENGTH_BITS)?;
    let mut out = plaintext.to_vec();
    keys.keystream_at(0)?.apply(&mut out)?;
    let mut acc = keys.accumulator(aad);
    acc.absorb(&out);
    let digest = acc.digest();
    out.extend_from_slice(&keys.tag(digest.y, digest.aad_len, digest.text_len));
    Ok(out)
}

/// Decrypt `ciphertext || tag` produced by [`seal`]
pub fn open(key: &[u8], nonce: &[u8], aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    let keys = GcmKeys::new(key, nonce, DEFAULT_TAG_LENGTH_BITS)?;
    if sealed.len() < keys.tag_len() {
        return Err(CryptoError::AuthenticationFailure {
            algorithm: "AES/GCM".to_string(),
            tag_length_bits: keys.tag_length_bits(),
            bytes: sealed.len() as u64,
        });
    }
    let (ciphertext, tag) = sealed.split_at(sealed.len() - keys.tag_len());
    let mut acc = keys.accumulator(aad);
    acc.absorb(ciphertext);
    let digest = acc.digest();
    if !keys.verify(digest.y, digest.aad_len, digest.text_len, tag) {
        return Err(CryptoError::AuthenticationFailure {
            algorithm: "AES/GCM".to_string(),
            tag_length_bits: keys.tag_length_bits(),
            bytes: ciphertext.len() as u64,
        });
    }
    let mut out = ciphertext.to_vec();
    keys.keystream_at(0)?.apply(&mut out)?;
    Ok(out)
}

/// Product in GHASH's field: a one-block GHASH keyed with `a` is `b * a`
fn gf_mul(a: [u8; BLOCK_SIZE], b: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut ghash = GHash::new(&Block::from(a));
    ghash.update(&[Block::from(b)]);
    ghash.finalize().into()
}

fn xor(a: &[u8; BLOCK_SIZE], b: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::{Aead, KeyInit as _, Payload};
    use aes_gcm::{Aes128Gcm, Aes256Gcm};

    // NIST GCM test case 4 (AES-128, 60-byte plaintext, 20-byte AAD)
    const NIST_KEY: &str = "feffe9928665731c6d6a8f9467308308";
    const NIST_IV: &str = "cafebabefacedbaddecaf888";
    const NIST_AAD: &str = "feedfacedeadbeeffeedfacedeadbeefabaddad2";
    const NIST_PT: &str = "d9313225f88406e5a55909c5aff5269a86a7a9531534f7da2e4c303d8a318a721c3c0c95956809532fcf0e2449a6b525b16aedf5aa0de657ba637b39";
    const NIST_CT: &str = "42831ec2217774244b7221b784d0d49ce3aa212f2c02a4e035c17e2329aca12e21d514b25466931c7d8f6a5aac84aa051ba30b396a0aac973d58e091";
    const NIST_TAG: &str = "5bc94fbc3221a5db94fae95ae7121a47";

    fn h(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_nist_vector() {
        let sealed = seal(&h(NIST_KEY), &h(NIST_IV), &h(NIST_AAD), &h(NIST_PT)).unwrap();
        let (ct, tag) = sealed.split_at(sealed.len() - 16);
        assert_eq!(hex::encode(ct), NIST_CT);
        assert_eq!(hex::encode(tag), NIST_TAG);

        let opened = open(&h(NIST_KEY), &h(NIST_IV), &h(NIST_AAD), &sealed).unwrap();
        assert_eq!(opened, h(NIST_PT));
    }

    #[test]
    fn test_matches_aes_gcm_crate() {
        let key = [7u8; 32];
        let nonce = [9u8; 12];
        let aad = b"x-amz-matdesc";
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let ours = seal(&key, &nonce, aad, &plaintext).unwrap();
            let theirs = Aes256Gcm::new_from_slice(&key)
                .unwrap()
                .encrypt(
                    aes_gcm::Nonce::from_slice(&nonce),
                    Payload { msg: &plaintext, aad },
                )
                .unwrap();
            assert_eq!(ours, theirs, "mismatch for length {len}");
        }
    }

    #[test]
    fn test_aes128_matches_aes_gcm_crate() {
        let key = [3u8; 16];
        let nonce = [4u8; 12];
        let plaintext = b"sixteen byte blk and then some".to_vec();
        let ours = seal(&key, &nonce, b"", &plaintext).unwrap();
        let theirs = Aes128Gcm::new_from_slice(&key)
            .unwrap()
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext.as_slice())
            .unwrap();
        assert_eq!(ours, theirs);
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = [1u8; 24];
        let nonce = [2u8; 12];
        let mut sealed = seal(&key, &nonce, b"aad", b"attack at dawn").unwrap();
        sealed[3] ^= 0x01;
        assert!(matches!(
            open(&key, &nonce, b"aad", &sealed),
            Err(CryptoError::AuthenticationFailure { .. })
        ));
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let key = [1u8; 16];
        let nonce = [2u8; 12];
        let sealed = seal(&key, &nonce, b"AES/GCM/NoPadding", b"dek bytes").unwrap();
        assert!(open(&key, &nonce, b"AES/CBC/PKCS5Padding", &sealed).is_err());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            GcmKeys::new(&[0u8; 20], &[0u8; 12], 128),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            GcmKeys::new(&[0u8; 16], &[0u8; 16], 128),
            Err(CryptoError::InvalidNonce(_))
        ));
        assert!(matches!(
            GcmKeys::new(&[0u8; 16], &[0u8; 12], 64),
            Err(CryptoError::InvalidTagLength(64))
        ));
    }

    #[test]
    fn test_keystream_seek_matches_sequential() {
        let keys = GcmKeys::new(&[5u8; 32], &[6u8; 12], 128).unwrap();
        let mut full = vec![0u8; 256];
        keys.keystream_at(0).unwrap().apply(&mut full).unwrap();

        let mut tail = vec![0u8; 96];
        keys.keystream_at(160).unwrap().apply(&mut tail).unwrap();
        assert_eq!(&full[160..], tail.as_slice());
    }

    #[test]
    fn test_chained_segments_equal_single_pass() {
        let keys = GcmKeys::new(&[8u8; 32], &[9u8; 12], 128).unwrap();
        let ciphertext: Vec<u8> = (0..100u32).map(|i| (i * 7) as u8).collect();

        let mut whole = keys.accumulator(b"");
        whole.absorb(&ciphertext);
        let whole = whole.digest();

        let mut chained = [0u8; BLOCK_SIZE];
        for segment in [&ciphertext[..32], &ciphertext[32..80], &ciphertext[80..]] {
            let mut acc = keys.accumulator(b"");
            acc.absorb(segment);
            chained = keys.chain(chained, &acc.digest());
        }

        assert_eq!(chained, whole.y);
        assert_eq!(keys.tag(chained, 0, 100), keys.tag(whole.y, 0, 100));
    }

    #[test]
    fn test_chaining_long_segments() {
        let keys = GcmKeys::new(&[1u8; 16], &[2u8; 12], 128).unwrap();
        let ciphertext: Vec<u8> = (0..(512 + 4096 + 333u32)).map(|i| (i % 251) as u8).collect();

        let mut whole = keys.accumulator(b"aad");
        whole.absorb(&ciphertext);
        let whole = whole.digest();

        let mut first = keys.accumulator(b"aad");
        first.absorb(&ciphertext[..512]);
        let mut chained = keys.chain([0u8; BLOCK_SIZE], &first.digest());
        for segment in [&ciphertext[512..4608], &ciphertext[4608..]] {
            let mut acc = keys.accumulator(b"");
            acc.absorb(segment);
            chained = keys.chain(chained, &acc.digest());
        }
        assert_eq!(chained, whole.y);
    }

    #[test]
    fn test_truncated_tag_is_prefix() {
        let full = GcmKeys::new(&[1u8; 16], &[1u8; 12], 128).unwrap();
        let short = GcmKeys::new(&[1u8; 16], &[1u8; 12], 96).unwrap();
        let y = [0x42u8; BLOCK_SIZE];
        assert_eq!(short.tag(y, 0, 10), full.tag(y, 0, 10)[..12].to_vec());
    }
}
