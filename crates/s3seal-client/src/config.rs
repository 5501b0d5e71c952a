//! Client configuration

use crate::{ClientError, Result};
use s3seal_crypto::{gcm, KeyLength, SecurityProfile, BLOCK_SIZE};
use serde::Deserialize;
use std::path::Path;

/// Where the envelope is stored
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// As user metadata on the object itself
    #[default]
    ObjectMetadata,
    /// As the JSON body of a sidecar `<key><suffix>` object
    InstructionFile,
}

/// Client configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where envelopes are written
    pub storage_mode: StorageMode,
    /// Which envelope generations may be read
    pub security_profile: SecurityProfile,
    /// Suffix appended to the object key to name its instruction object
    pub instruction_suffix: String,
    /// Size of generated data keys
    pub key_length: KeyLength,
    /// GCM tag length for new objects
    pub tag_length_bits: u32,
    /// Plaintext bytes per multipart part (all but the last)
    pub part_size: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::ObjectMetadata,
            security_profile: SecurityProfile::Current,
            instruction_suffix: ".instruction".to_string(),
            key_length: KeyLength::Aes256,
            tag_length_bits: 128,
            part_size: 8 * 1024 * 1024, // 8 MB
        }
    }
}

impl ClientConfig {
    /// Load from an optional config file, then `S3SEAL_*` environment
    /// variables (e.g. `S3SEAL_STORAGE_MODE=instruction_file`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("S3SEAL"))
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build configuration: {}", e)))?;

        let config: ClientConfig = settings
            .try_deserialize()
            .map_err(|e| ClientError::Config(format!("failed to deserialize configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the storage mode
    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    /// Set the security profile
    pub fn with_security_profile(mut self, profile: SecurityProfile) -> Self {
        self.security_profile = profile;
        self
    }

    /// Set the instruction object suffix
    pub fn with_instruction_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.instruction_suffix = suffix.into();
        self
    }

    /// Set the data key length
    pub fn with_key_length(mut self, length: KeyLength) -> Self {
        self.key_length = length;
        self
    }

    /// Set the tag length
    pub fn with_tag_length_bits(mut self, bits: u32) -> Self {
        self.tag_length_bits = bits;
        self
    }

    /// Set the multipart part size
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    /// Key of the instruction object for `key`
    pub fn instruction_key(&self, key: &str) -> String {
        format!("{}{}", key, self.instruction_suffix)
    }

    /// Reject settings the cipher cannot honor
    pub fn validate(&self) -> Result<()> {
        gcm::tag_len_bytes(self.tag_length_bits)
            .map_err(|e| ClientError::Config(e.to_string()))?;
        if self.part_size == 0 || self.part_size % BLOCK_SIZE as u64 != 0 {
            return Err(ClientError::Config(format!(
                "part_size must be a positive multiple of {} bytes, got {}",
                BLOCK_SIZE, self.part_size
            )));
        }
        if self.instruction_suffix.is_empty() {
            return Err(ClientError::Config(
                "instruction_suffix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
