//! Key wrapping strategies
//!
//! A DEK is wrapped under a KEK before it is written into the envelope. The
//! caller picks the KEK once, as [`EncryptionMaterials`], and
//! [`KeyWrapStrategy`] turns that into the three supported schemes:
//!
//! | materials | wrap id | KEK |
//! |---|---|---|
//! | `KmsContext` | `kms+context` | remote, via [`KeyWrapService`] |
//! | `AsymmetricKek` | `RSA-OAEP-SHA256` | RSA key pair |
//! | `SymmetricKek` | `AES/GCM` | 128/192/256-bit AES key |
//!
//! Unwrapping also accepts the legacy `kms` and `AESWrap` ids; the envelope
//! decoder has already checked that the security profile allows them.

use crate::{
    envelope::{ContentCipher, EnvelopeMetadata, WrapAlgorithm, WrappedKey, RESERVED_CONTEXT_KEY},
    gcm,
    keys::{DataKey, KeyLength, NONCE_SIZE},
    kms::{EncryptionContext, KeyWrapService},
    CryptoError, Result,
};
use rand::{rngs::OsRng, RngCore};
use rsa::{traits::PublicKeyParts, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// RSA key-encryption key
///
/// The private half is only needed for decryption.
#[derive(Clone)]
pub struct RsaKek {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
}

impl RsaKek {
    /// Encrypt-only KEK
    pub fn from_public(public: RsaPublicKey) -> Self {
        Self {
            public,
            private: None,
        }
    }

    /// KEK able to both wrap and unwrap
    pub fn from_private(private: RsaPrivateKey) -> Self {
        Self {
            public: private.to_public_key(),
            private: Some(private),
        }
    }

    /// Modulus size in bytes, which is also the wrapped key size
    pub fn size(&self) -> usize {
        self.public.size()
    }
}

impl std::fmt::Debug for RsaKek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKek")
            .field("bits", &(self.size() * 8))
            .field("private", &self.private.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Symmetric key-encryption key
#[derive(Clone)]
pub struct AesKek {
    key: Zeroizing<Vec<u8>>,
}

impl AesKek {
    /// Wrap raw key bytes (16, 24 or 32)
    pub fn new(key: &[u8]) -> Result<Self> {
        KeyLength::from_key_bytes(key.len())?;
        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
        })
    }

    /// Generate a random KEK
    pub fn generate(length: KeyLength) -> Self {
        let mut key = Zeroizing::new(vec![0u8; length.bytes()]);
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl std::fmt::Debug for AesKek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesKek")
            .field("key", &"[REDACTED]")
            .field("bits", &(self.key.len() * 8))
            .finish()
    }
}

/// The caller's choice of KEK, fixed for the life of a client
#[derive(Clone, Debug)]
pub enum EncryptionMaterials {
    /// Wrap through a KMS key, binding an encryption context
    KmsContext {
        key_id: String,
        context: EncryptionContext,
    },
    /// Wrap locally with an RSA key pair
    AsymmetricKek {
        algorithm: WrapAlgorithm,
        key_handle: RsaKek,
        /// Stored verbatim in the envelope's material description
        description: BTreeMap<String, String>,
    },
    /// Wrap locally with an AES key
    SymmetricKek {
        algorithm: WrapAlgorithm,
        key_handle: AesKek,
        /// Stored verbatim in the envelope's material description
        description: BTreeMap<String, String>,
    },
}

impl EncryptionMaterials {
    /// KMS materials
    pub fn kms(key_id: impl Into<String>, context: EncryptionContext) -> Self {
        Self::KmsContext {
            key_id: key_id.into(),
            context,
        }
    }

    /// RSA-OAEP materials
    pub fn rsa(key_handle: RsaKek) -> Self {
        Self::AsymmetricKek {
            algorithm: WrapAlgorithm::RsaOaepSha256,
            key_handle,
            description: BTreeMap::new(),
        }
    }

    /// AES-GCM key wrap materials
    pub fn aes(key_handle: AesKek) -> Self {
        Self::SymmetricKek {
            algorithm: WrapAlgorithm::AesGcm,
            key_handle,
            description: BTreeMap::new(),
        }
    }
}

/// A configured key wrapping scheme
#[derive(Clone)]
pub enum KeyWrapStrategy {
    /// `kms+context`
    Kms {
        service: Arc<dyn KeyWrapService>,
        key_id: String,
        context: EncryptionContext,
    },
    /// `RSA-OAEP-SHA256`
    Rsa {
        kek: RsaKek,
        description: BTreeMap<String, String>,
    },
    /// `AES/GCM`
    Aes {
        kek: AesKek,
        description: BTreeMap<String, String>,
    },
}

impl std::fmt::Debug for KeyWrapStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kms { key_id, .. } => f.debug_struct("Kms").field("key_id", key_id).finish(),
            Self::Rsa { kek, .. } => f.debug_tuple("Rsa").field(kek).finish(),
            Self::Aes { kek, .. } => f.debug_tuple("Aes").field(kek).finish(),
        }
    }
}

impl KeyWrapStrategy {
    /// Select the strategy for `materials`
    ///
    /// KMS materials need a `service`. A KMS context that already uses the
    /// reserved key is rejected here rather than on first use.
    pub fn from_materials(
        materials: &EncryptionMaterials,
        service: Option<Arc<dyn KeyWrapService>>,
    ) -> Result<Self> {
        match materials {
            EncryptionMaterials::KmsContext { key_id, context } => {
                if context.contains_key(RESERVED_CONTEXT_KEY) {
                    return Err(CryptoError::ReservedContextKey(RESERVED_CONTEXT_KEY.to_string()));
                }
                let service = service.ok_or_else(|| {
                    CryptoError::KeyService(anyhow::anyhow!(
                        "KMS materials configured without a key wrap service"
                    ))
                })?;
                Ok(Self::Kms {
                    service,
                    key_id: key_id.clone(),
                    context: context.clone(),
                })
            }
            EncryptionMaterials::AsymmetricKek {
                algorithm,
                key_handle,
                description,
            } => {
                expect_algorithm(*algorithm, WrapAlgorithm::RsaOaepSha256)?;
                Ok(Self::Rsa {
                    kek: key_handle.clone(),
                    description: description.clone(),
                })
            }
            EncryptionMaterials::SymmetricKek {
                algorithm,
                key_handle,
                description,
            } => {
                expect_algorithm(*algorithm, WrapAlgorithm::AesGcm)?;
                Ok(Self::Aes {
                    kek: key_handle.clone(),
                    description: description.clone(),
                })
            }
        }
    }

    /// Algorithm new envelopes are written with
    pub fn wrap_algorithm(&self) -> WrapAlgorithm {
        match self {
            Self::Kms { .. } => WrapAlgorithm::KmsContext,
            Self::Rsa { .. } => WrapAlgorithm::RsaOaepSha256,
            Self::Aes { .. } => WrapAlgorithm::AesGcm,
        }
    }

    /// Wrap `dek` for content encrypted with `cek`
    pub fn wrap(&self, dek: &DataKey, cek: ContentCipher) -> Result<WrappedKey> {
        let (ciphertext, material_description) = match self {
            Self::Kms {
                service,
                key_id,
                context,
            } => {
                if context.contains_key(RESERVED_CONTEXT_KEY) {
                    return Err(CryptoError::ReservedContextKey(RESERVED_CONTEXT_KEY.to_string()));
                }
                let mut full = context.clone();
                full.insert(RESERVED_CONTEXT_KEY.to_string(), cek.id().to_string());
                let blob = service
                    .encrypt(key_id, dek.key(), &full)
                    .map_err(CryptoError::KeyService)?;
                (blob, full)
            }
            Self::Rsa { kek, description } => {
                let mut message = Zeroizing::new(Vec::with_capacity(1 + dek.key().len() + 32));
                message.push(dek.key().len() as u8);
                message.extend_from_slice(dek.key());
                message.extend_from_slice(cek.id().as_bytes());
                let wrapped = kek
                    .public
                    .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &message)
                    .map_err(|e| CryptoError::InvalidKey(format!("RSA-OAEP encryption failed: {}", e)))?;
                (wrapped, description.clone())
            }
            Self::Aes { kek, description } => {
                let mut nonce = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce);
                let sealed = gcm::seal(kek.as_bytes(), &nonce, cek.id().as_bytes(), dek.key())?;
                let mut wrapped = nonce.to_vec();
                wrapped.extend_from_slice(&sealed);
                (wrapped, description.clone())
            }
        };

        debug!(
            algorithm = self.wrap_algorithm().id(),
            wrapped_len = ciphertext.len(),
            "data key wrapped"
        );
        Ok(WrappedKey {
            ciphertext,
            algorithm: self.wrap_algorithm(),
            material_description,
        })
    }

    /// Recover the DEK described by `envelope`
    pub fn unwrap(&self, envelope: &EnvelopeMetadata) -> Result<DataKey> {
        let algorithm = envelope.wrap_algorithm;
        let key = match (self, algorithm) {
            (
                Self::Kms {
                    service, key_id, ..
                },
                WrapAlgorithm::KmsContext | WrapAlgorithm::LegacyKms,
            ) => {
                if algorithm == WrapAlgorithm::KmsContext {
                    let bound = envelope.material_description.get(RESERVED_CONTEXT_KEY);
                    if bound.map(String::as_str) != Some(envelope.cek_algorithm.id()) {
                        return Err(CryptoError::Unwrap {
                            algorithm: algorithm.id().to_string(),
                            reason: format!(
                                "encryption context does not bind content cipher {}",
                                envelope.cek_algorithm.id()
                            ),
                        });
                    }
                }
                let unwrapped = service
                    .decrypt(&envelope.wrapped_key, &envelope.material_description)
                    .map_err(CryptoError::KeyService)?;
                if &unwrapped.key_id != key_id {
                    return Err(CryptoError::KeyMismatch {
                        expected: key_id.clone(),
                        actual: unwrapped.key_id,
                    });
                }
                unwrapped.plaintext
            }
            (Self::Rsa { kek, .. }, WrapAlgorithm::RsaOaepSha256) => {
                rsa_unwrap(kek, &envelope.wrapped_key, envelope.cek_algorithm)?
            }
            (Self::Aes { kek, .. }, WrapAlgorithm::AesGcm) => {
                aes_gcm_unwrap(kek, &envelope.wrapped_key, envelope.cek_algorithm)?
            }
            (Self::Aes { kek, .. }, WrapAlgorithm::AesWrap) => {
                aes_kw_unwrap(kek, &envelope.wrapped_key)?
            }
            (strategy, other) => {
                return Err(CryptoError::Unwrap {
                    algorithm: other.id().to_string(),
                    reason: format!(
                        "object was wrapped with {} but the client is configured for {}",
                        other.id(),
                        strategy.wrap_algorithm().id()
                    ),
                })
            }
        };

        debug!(algorithm = algorithm.id(), "data key unwrapped");
        DataKey::from_parts(&key, &envelope.iv).map_err(|e| CryptoError::Unwrap {
            algorithm: algorithm.id().to_string(),
            reason: e.to_string(),
        })
    }
}

fn expect_algorithm(actual: WrapAlgorithm, expected: WrapAlgorithm) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(CryptoError::Unwrap {
            algorithm: actual.id().to_string(),
            reason: format!("materials of this kind only support {}", expected.id()),
        })
    }
}

fn rsa_unwrap(kek: &RsaKek, wrapped: &[u8], cek: ContentCipher) -> Result<Zeroizing<Vec<u8>>> {
    let failure = |reason: String| CryptoError::Unwrap {
        algorithm: WrapAlgorithm::RsaOaepSha256.id().to_string(),
        reason,
    };
    let private = kek
        .private
        .as_ref()
        .ok_or_else(|| failure("no RSA private key configured".to_string()))?;
    if wrapped.len() != kek.size() {
        return Err(failure(format!(
            "ciphertext is {} bytes, modulus is {}",
            wrapped.len(),
            kek.size()
        )));
    }
    let message = Zeroizing::new(
        private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| failure(format!("OAEP decryption failed: {}", e)))?,
    );

    let (&key_len, rest) = message
        .split_first()
        .ok_or_else(|| failure("empty key message".to_string()))?;
    let key_len = usize::from(key_len);
    if rest.len() < key_len {
        return Err(failure("key message truncated".to_string()));
    }
    let (key, bound_cek) = rest.split_at(key_len);
    if bound_cek != cek.id().as_bytes() {
        return Err(failure(format!(
            "wrapped key is bound to a different content cipher than {}",
            cek.id()
        )));
    }
    Ok(Zeroizing::new(key.to_vec()))
}

fn aes_gcm_unwrap(kek: &AesKek, wrapped: &[u8], cek: ContentCipher) -> Result<Zeroizing<Vec<u8>>> {
    if wrapped.len() < NONCE_SIZE {
        return Err(CryptoError::Unwrap {
            algorithm: WrapAlgorithm::AesGcm.id().to_string(),
            reason: "wrapped key shorter than its nonce".to_string(),
        });
    }
    let (nonce, sealed) = wrapped.split_at(NONCE_SIZE);
    gcm::open(kek.as_bytes(), nonce, cek.id().as_bytes(), sealed)
        .map(Zeroizing::new)
        .map_err(|e| CryptoError::Unwrap {
            algorithm: WrapAlgorithm::AesGcm.id().to_string(),
            reason: e.to_string(),
        })
}

fn aes_kw_unwrap(kek: &AesKek, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let failure = |reason: String| CryptoError::Unwrap {
        algorithm: WrapAlgorithm::AesWrap.id().to_string(),
        reason,
    };
    if wrapped.len() < 24 || wrapped.len() % 8 != 0 {
        return Err(failure(format!(
            "wrapped key of {} bytes is not a valid RFC 3394 output",
            wrapped.len()
        )));
    }
    let mut key = Zeroizing::new(vec![0u8; wrapped.len() - 8]);
    let bytes = kek.as_bytes();
    let result = match bytes.len() {
        16 => aes_kw::KekAes128::from(to_array::<16>(bytes)?).unwrap(wrapped, &mut key),
        24 => aes_kw::KekAes192::from(to_array::<24>(bytes)?).unwrap(wrapped, &mut key),
        _ => aes_kw::KekAes256::from(to_array::<32>(bytes)?).unwrap(wrapped, &mut key),
    };
    result.map_err(|e| failure(format!("{:?}", e)))?;
    Ok(key)
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected {} key bytes, got {}", N, bytes.len())))
}
