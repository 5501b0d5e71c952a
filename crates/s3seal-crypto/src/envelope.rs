//! Envelope codec
//!
//! The envelope is everything needed to decrypt an object besides the KEK:
//! the wrapped DEK, the IV, the algorithm ids, the tag length, the material
//! description and the plaintext length. It travels as a flat string map,
//! either as object metadata or as the JSON body of an instruction object.
//!
//! New envelopes are always written in the current layout. Decoding also
//! understands the prior generation (`x-amz-key` plus AES/CBC content, `kms`
//! and `AESWrap` key wrapping) when the [`SecurityProfile`] allows it.

use crate::{
    gcm,
    keys::{DataKey, CBC_IV_SIZE, NONCE_SIZE},
    CryptoError, Result,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Wrapped key, current layout
pub const KEY_V2_HEADER: &str = "x-amz-key-v2";
/// Wrapped key, prior layout
pub const KEY_V1_HEADER: &str = "x-amz-key";
/// Content IV or nonce
pub const IV_HEADER: &str = "x-amz-iv";
/// Content cipher id
pub const CEK_ALG_HEADER: &str = "x-amz-cek-alg";
/// Tag length in bits
pub const TAG_LEN_HEADER: &str = "x-amz-tag-len";
/// Key wrap algorithm id
pub const WRAP_ALG_HEADER: &str = "x-amz-wrap-alg";
/// Material description, a JSON object
pub const MATDESC_HEADER: &str = "x-amz-matdesc";
/// Plaintext length in bytes
pub const CONTENT_LENGTH_HEADER: &str = "x-amz-unencrypted-content-length";
/// Marks an object whose envelope lives in an instruction object
pub const INSTRUCTION_FILE_HEADER: &str = "x-amz-crypto-instr-file";

/// Encryption-context key holding the content cipher id for KMS wrapping
pub const RESERVED_CONTEXT_KEY: &str = "aws:x-amz-cek-alg";

/// Flat string map used for object metadata and instruction bodies
pub type MetadataMap = BTreeMap<String, String>;

/// Content encryption algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentCipher {
    /// AES-GCM, current
    AesGcm,
    /// AES-CBC with PKCS#5 padding, read-only legacy
    AesCbc,
}

impl ContentCipher {
    /// Wire identifier
    pub fn id(&self) -> &'static str {
        match self {
            Self::AesGcm => "AES/GCM/NoPadding",
            Self::AesCbc => "AES/CBC/PKCS5Padding",
        }
    }

    /// Parse a wire identifier
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "AES/GCM/NoPadding" => Ok(Self::AesGcm),
            "AES/CBC/PKCS5Padding" => Ok(Self::AesCbc),
            other => Err(CryptoError::format(
                CEK_ALG_HEADER,
                format!("unknown content cipher '{}'", other),
            )),
        }
    }

    /// Whether this belongs to the prior wire format
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::AesCbc)
    }
}

/// Key wrap algorithm
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WrapAlgorithm {
    /// KMS with the content cipher bound into the encryption context
    KmsContext,
    /// RSA-OAEP with SHA-256
    RsaOaepSha256,
    /// AES-GCM under a caller-held key
    AesGcm,
    /// KMS without the reserved context key, read-only legacy
    LegacyKms,
    /// RFC 3394 AES key wrap, read-only legacy
    AesWrap,
}

impl WrapAlgorithm {
    /// Wire identifier
    pub fn id(&self) -> &'static str {
        match self {
            Self::KmsContext => "kms+context",
            Self::RsaOaepSha256 => "RSA-OAEP-SHA256",
            Self::AesGcm => "AES/GCM",
            Self::LegacyKms => "kms",
            Self::AesWrap => "AESWrap",
        }
    }

    /// Parse a wire identifier
    pub fn from_id(id: &str) -> Result<Self> {
        match id {
            "kms+context" => Ok(Self::KmsContext),
            "RSA-OAEP-SHA256" => Ok(Self::RsaOaepSha256),
            "AES/GCM" => Ok(Self::AesGcm),
            "kms" => Ok(Self::LegacyKms),
            "AESWrap" => Ok(Self::AesWrap),
            other => Err(CryptoError::format(
                WRAP_ALG_HEADER,
                format!("unknown wrap algorithm '{}'", other),
            )),
        }
    }

    /// Whether this belongs to the prior wire format
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::LegacyKms | Self::AesWrap)
    }
}

/// Which wire-format generations the decrypt path accepts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProfile {
    /// Only the current format
    #[default]
    Current,
    /// The current format, plus reading the prior one
    CurrentAndLegacyRead,
}

impl SecurityProfile {
    /// Whether legacy envelopes may be decoded
    pub fn allows_legacy(&self) -> bool {
        matches!(self, Self::CurrentAndLegacyRead)
    }
}

/// Envelope layout found while decoding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeFormat {
    /// `x-amz-key-v2`
    V2,
    /// `x-amz-key`
    V1,
}

/// What the decoder learned beyond the envelope itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeHints {
    /// Layout the fields were read from
    pub format: EnvelopeFormat,
    /// Whether any legacy identifier was involved
    pub legacy: bool,
}

/// Output of a key wrap strategy
#[derive(Clone, Debug)]
pub struct WrappedKey {
    /// Wrapped DEK bytes
    pub ciphertext: Vec<u8>,
    /// Algorithm that produced them
    pub algorithm: WrapAlgorithm,
    /// Material description (for KMS, the full encryption context)
    pub material_description: BTreeMap<String, String>,
}

/// Decoded envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub wrapped_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub cek_algorithm: ContentCipher,
    /// Zero for CBC content, which carries no tag
    pub tag_length_bits: u32,
    pub material_description: BTreeMap<String, String>,
    pub wrap_algorithm: WrapAlgorithm,
    pub unencrypted_content_length: u64,
}

impl EnvelopeMetadata {
    /// Build the envelope for freshly encrypted content
    pub fn encode(
        dek: &DataKey,
        wrapped: WrappedKey,
        cek_algorithm: ContentCipher,
        tag_length_bits: u32,
        unencrypted_content_length: u64,
    ) -> Result<Self> {
        if cek_algorithm.is_legacy() || wrapped.algorithm.is_legacy() {
            return Err(CryptoError::format(
                WRAP_ALG_HEADER,
                "legacy algorithms are read-only",
            ));
        }
        gcm::tag_len_bytes(tag_length_bits)?;
        Ok(Self {
            wrapped_key: wrapped.ciphertext,
            iv: dek.iv().to_vec(),
            cek_algorithm,
            tag_length_bits,
            material_description: wrapped.material_description,
            wrap_algorithm: wrapped.algorithm,
            unencrypted_content_length,
        })
    }

    /// Flatten into the current wire layout
    pub fn to_map(&self) -> MetadataMap {
        let mut map = MetadataMap::new();
        map.insert(KEY_V2_HEADER.to_string(), BASE64.encode(&self.wrapped_key));
        map.insert(IV_HEADER.to_string(), BASE64.encode(&self.iv));
        map.insert(CEK_ALG_HEADER.to_string(), self.cek_algorithm.id().to_string());
        map.insert(TAG_LEN_HEADER.to_string(), self.tag_length_bits.to_string());
        map.insert(WRAP_ALG_HEADER.to_string(), self.wrap_algorithm.id().to_string());
        // A BTreeMap serializes with sorted keys, so the JSON is stable
        map.insert(
            MATDESC_HEADER.to_string(),
            serde_json::to_string(&self.material_description).unwrap_or_else(|_| "{}".to_string()),
        );
        map.insert(
            CONTENT_LENGTH_HEADER.to_string(),
            self.unencrypted_content_length.to_string(),
        );
        map
    }

    /// Decode an envelope from object metadata or an instruction body
    ///
    /// Unrelated keys in `map` are ignored.
    pub fn decode(map: &MetadataMap, profile: SecurityProfile) -> Result<(Self, DecodeHints)> {
        let (format, wrapped_key) = match (map.get(KEY_V2_HEADER), map.get(KEY_V1_HEADER)) {
            (Some(v2), _) => (EnvelopeFormat::V2, decode_base64(KEY_V2_HEADER, v2)?),
            (None, Some(v1)) => (EnvelopeFormat::V1, decode_base64(KEY_V1_HEADER, v1)?),
            (None, None) => return Err(CryptoError::missing(KEY_V2_HEADER)),
        };

        let cek_algorithm = match (format, map.get(CEK_ALG_HEADER)) {
            (_, Some(id)) => ContentCipher::from_id(id)?,
            (EnvelopeFormat::V1, None) => ContentCipher::AesCbc,
            (EnvelopeFormat::V2, None) => return Err(CryptoError::missing(CEK_ALG_HEADER)),
        };

        let wrap_algorithm = match (format, map.get(WRAP_ALG_HEADER)) {
            (_, Some(id)) => WrapAlgorithm::from_id(id)?,
            (EnvelopeFormat::V1, None) => WrapAlgorithm::AesWrap,
            (EnvelopeFormat::V2, None) => return Err(CryptoError::missing(WRAP_ALG_HEADER)),
        };

        let legacy_identifier = if format == EnvelopeFormat::V1 {
            Some(KEY_V1_HEADER)
        } else if cek_algorithm.is_legacy() {
            Some(cek_algorithm.id())
        } else if wrap_algorithm.is_legacy() {
            Some(wrap_algorithm.id())
        } else {
            None
        };
        if let Some(identifier) = legacy_identifier {
            if !profile.allows_legacy() {
                return Err(CryptoError::UnsupportedLegacyFormat {
                    identifier: identifier.to_string(),
                });
            }
        }

        let iv = decode_base64(IV_HEADER, required(map, IV_HEADER)?)?;
        let expected_iv = match cek_algorithm {
            ContentCipher::AesGcm => NONCE_SIZE,
            ContentCipher::AesCbc => CBC_IV_SIZE,
        };
        if iv.len() != expected_iv {
            return Err(CryptoError::format(
                IV_HEADER,
                format!(
                    "{} needs a {}-byte IV, got {}",
                    cek_algorithm.id(),
                    expected_iv,
                    iv.len()
                ),
            ));
        }

        let tag_length_bits = match cek_algorithm {
            ContentCipher::AesGcm => {
                let raw = required(map, TAG_LEN_HEADER)?;
                let bits = raw.parse::<u32>().map_err(|e| {
                    CryptoError::format(TAG_LEN_HEADER, format!("'{}' is not a number: {}", raw, e))
                })?;
                gcm::tag_len_bytes(bits)?;
                bits
            }
            ContentCipher::AesCbc => 0,
        };

        let material_description = match (format, map.get(MATDESC_HEADER)) {
            (_, Some(json)) => serde_json::from_str(json).map_err(|e| {
                CryptoError::format(MATDESC_HEADER, format!("not a JSON string map: {}", e))
            })?,
            (EnvelopeFormat::V1, None) => BTreeMap::new(),
            (EnvelopeFormat::V2, None) => return Err(CryptoError::missing(MATDESC_HEADER)),
        };

        let raw_length = required(map, CONTENT_LENGTH_HEADER)?;
        let unencrypted_content_length = raw_length.parse::<u64>().map_err(|e| {
            CryptoError::format(
                CONTENT_LENGTH_HEADER,
                format!("'{}' is not a u64: {}", raw_length, e),
            )
        })?;

        let hints = DecodeHints {
            format,
            legacy: legacy_identifier.is_some(),
        };
        Ok((
            Self {
                wrapped_key,
                iv,
                cek_algorithm,
                tag_length_bits,
                material_description,
                wrap_algorithm,
                unencrypted_content_length,
            },
            hints,
        ))
    }

    /// Serialize as an instruction object body
    pub fn to_instruction_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_map())?)
    }

    /// Parse an instruction object body back into a field map
    pub fn from_instruction_json(body: &[u8]) -> Result<MetadataMap> {
        serde_json::from_slice(body)
            .map_err(|e| CryptoError::format("instruction object", e.to_string()))
    }

    /// Length of the stored ciphertext, tag included
    pub fn ciphertext_length(&self) -> u64 {
        match self.cek_algorithm {
            ContentCipher::AesGcm => {
                self.unencrypted_content_length + u64::from(self.tag_length_bits / 8)
            }
            ContentCipher::AesCbc => {
                let block = CBC_IV_SIZE as u64;
                (self.unencrypted_content_length / block + 1) * block
            }
        }
    }
}

/// Whether a metadata map carries an envelope
pub fn has_envelope(map: &MetadataMap) -> bool {
    map.contains_key(KEY_V2_HEADER) || map.contains_key(KEY_V1_HEADER)
}

fn required<'a>(map: &'a MetadataMap, field: &str) -> Result<&'a String> {
    map.get(field).ok_or_else(|| CryptoError::missing(field))
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| CryptoError::format(field, format!("invalid base64: {}", e)))
}
