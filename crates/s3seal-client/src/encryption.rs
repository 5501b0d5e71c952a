//! Client-side encryption orchestrators
//!
//! Upload: generate a DEK, wrap it, stream the body through the GCM encryptor
//! into the store, and write the envelope (as object metadata or as an
//! instruction object). Download: read the envelope, unwrap the DEK, and hand
//! back a reader that decrypts as the caller reads.

use crate::{
    config::{ClientConfig, StorageMode},
    multipart::MultipartRegistry,
    operation::{FailureKind, OperationState, OperationTracker},
    store::{GetObjectOutput, ObjectStore, RequestRange},
    ClientError, Result,
};
use s3seal_crypto::{
    aligned_request,
    envelope::{has_envelope, CEK_ALG_HEADER, INSTRUCTION_FILE_HEADER},
    ByteRange, CbcDecryptingReader, ContentCipher, CryptoError, DataKey, DecodeHints,
    DecryptingReader, EncryptingReader, EncryptionMaterials, EnvelopeMetadata, KeyWrapService,
    KeyWrapStrategy, MetadataMap, RangedDecryptingReader, BLOCK_SIZE,
};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of an encrypted put
#[derive(Clone, Debug)]
pub struct PutObjectOutput {
    /// ETag of the stored ciphertext
    pub etag: String,
    /// Envelope written alongside it
    pub envelope: EnvelopeMetadata,
}

/// Client with client-side encryption enabled
pub struct EncryptedClient<S> {
    pub(crate) store: S,
    pub(crate) config: ClientConfig,
    pub(crate) strategy: KeyWrapStrategy,
    pub(crate) uploads: MultipartRegistry,
}

impl<S: ObjectStore> EncryptedClient<S> {
    /// Create a new encrypted client
    ///
    /// `kms` is required when `materials` is [`EncryptionMaterials::KmsContext`].
    pub fn new(
        store: S,
        config: ClientConfig,
        materials: &EncryptionMaterials,
        kms: Option<Arc<dyn KeyWrapService>>,
    ) -> Result<Self> {
        config.validate()?;
        let strategy = KeyWrapStrategy::from_materials(materials, kms)?;
        debug!(
            wrap_algorithm = strategy.wrap_algorithm().id(),
            storage_mode = ?config.storage_mode,
            profile = ?config.security_profile,
            "encrypted client ready"
        );
        Ok(Self {
            store,
            config,
            strategy,
            uploads: MultipartRegistry::new(),
        })
    }

    /// Get the underlying store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Encrypt `body` and store it under `key`
    ///
    /// `content_length` is the plaintext length; a body of any other length
    /// fails with a length mismatch and nothing usable is left behind.
    #[instrument(skip(self, body))]
    pub fn put_object<R: Read>(&self, key: &str, body: R, content_length: u64) -> Result<PutObjectOutput> {
        let mut op = OperationTracker::start("put", key);
        let result = self.put_object_inner(key, body, content_length, &mut op);
        let output = op.observe(result)?;
        op.advance(OperationState::Complete);
        info!(key, etag = %output.etag, content_length, "encrypted object stored");
        Ok(output)
    }

    fn put_object_inner<R: Read>(
        &self,
        key: &str,
        body: R,
        content_length: u64,
        op: &mut OperationTracker,
    ) -> Result<PutObjectOutput> {
        let (dek, envelope) = self.new_envelope(content_length)?;
        op.advance(OperationState::MaterialsResolved);

        let mut reader = EncryptingReader::new(body, &dek, b"", self.config.tag_length_bits)?
            .with_expected_len(content_length);
        op.advance(OperationState::BodyTransformInProgress);

        let etag = self
            .store
            .put_object(key, &mut reader, self.object_metadata(&envelope))
            .map_err(ClientError::from_store)?;
        self.write_instruction(key, &envelope)?;

        Ok(PutObjectOutput { etag, envelope })
    }

    /// Fetch and decrypt a whole object
    ///
    /// Decryption happens as the returned reader is read. The tag is checked
    /// when the body is exhausted, so bytes read before an authentication
    /// failure must be discarded.
    #[instrument(skip(self))]
    pub fn get_object(&self, key: &str) -> Result<DecryptedObject> {
        let mut op = OperationTracker::start("get", key);
        let result = self.get_object_inner(key, &mut op);
        let (reader, envelope, hints) = op.observe(result)?;
        Ok(DecryptedObject::new(reader, envelope, hints, op))
    }

    fn get_object_inner(
        &self,
        key: &str,
        op: &mut OperationTracker,
    ) -> Result<(Box<dyn Read + Send>, EnvelopeMetadata, DecodeHints)> {
        let output = self
            .store
            .get_object(key, None)
            .map_err(ClientError::from_store)?;
        let (envelope, hints) = self.load_envelope(key, &output.metadata)?;
        let dek = self.strategy.unwrap(&envelope)?;
        op.advance(OperationState::MaterialsResolved);

        let reader: Box<dyn Read + Send> = match envelope.cek_algorithm {
            ContentCipher::AesGcm => Box::new(
                DecryptingReader::new(output.body, &dek, b"", envelope.tag_length_bits)?
                    .with_expected_len(envelope.unencrypted_content_length),
            ),
            ContentCipher::AesCbc => Box::new(
                CbcDecryptingReader::new(output.body, &dek)?
                    .with_expected_len(envelope.unencrypted_content_length),
            ),
        };
        op.advance(OperationState::BodyTransformInProgress);
        Ok((reader, envelope, hints))
    }

    /// Decrypt a raw ranged GET of the stored ciphertext
    ///
    /// `start` must be a multiple of the 16-byte block size. The range is
    /// not authenticated; tag bytes that fall inside it are dropped.
    #[instrument(skip(self))]
    pub fn get_object_ranged(&self, key: &str, start: u64, end: u64) -> Result<DecryptedObject> {
        let mut op = OperationTracker::start("get_ranged", key);
        let result = self.get_object_ranged_inner(key, start, end, &mut op);
        let (reader, envelope, hints) = op.observe(result)?;
        Ok(DecryptedObject::new(reader, envelope, hints, op))
    }

    fn get_object_ranged_inner(
        &self,
        key: &str,
        start: u64,
        end: u64,
        op: &mut OperationTracker,
    ) -> Result<(Box<dyn Read + Send>, EnvelopeMetadata, DecodeHints)> {
        let block = BLOCK_SIZE as u64;
        if start % block != 0 {
            return Err(CryptoError::InvalidRangeAlignment {
                block_boundary: start - start % block,
                block_size: block,
                offset: start,
            }
            .into());
        }

        let output = self
            .store
            .get_object(key, Some(RequestRange::new(start, end)))
            .map_err(ClientError::from_store)?;
        let (envelope, hints) = self.load_envelope(key, &output.metadata)?;
        require_gcm(&envelope)?;
        let dek = self.strategy.unwrap(&envelope)?;
        op.advance(OperationState::MaterialsResolved);

        let reader = ranged_reader(output, &dek, &envelope)?;
        op.advance(OperationState::BodyTransformInProgress);
        Ok((Box::new(reader), envelope, hints))
    }

    /// Fetch plaintext bytes `start..=end`, at any offset
    ///
    /// The request is widened to the enclosing block boundary and the extra
    /// leading bytes are discarded. `end` past the last byte is clamped, and
    /// a range that starts past it yields an empty body.
    #[instrument(skip(self))]
    pub fn get_object_range(&self, key: &str, start: u64, end: u64) -> Result<DecryptedObject> {
        let mut op = OperationTracker::start("get_range", key);
        let result = self.get_object_range_inner(key, start, end, &mut op);
        let (reader, envelope, hints) = op.observe(result)?;
        Ok(DecryptedObject::new(reader, envelope, hints, op))
    }

    fn get_object_range_inner(
        &self,
        key: &str,
        start: u64,
        end: u64,
        op: &mut OperationTracker,
    ) -> Result<(Box<dyn Read + Send>, EnvelopeMetadata, DecodeHints)> {
        let metadata = self.store.head_object(key).map_err(ClientError::from_store)?;
        let (envelope, hints) = self.load_envelope(key, &metadata)?;
        require_gcm(&envelope)?;

        let Some(request) = aligned_request(start, end, envelope.unencrypted_content_length)? else {
            op.advance(OperationState::MaterialsResolved);
            op.advance(OperationState::BodyTransformInProgress);
            return Ok((Box::new(io::empty()), envelope, hints));
        };
        let dek = self.strategy.unwrap(&envelope)?;
        op.advance(OperationState::MaterialsResolved);

        let output = self
            .store
            .get_object(key, Some(RequestRange::new(request.start, request.end)))
            .map_err(ClientError::from_store)?;
        let mut reader = ranged_reader(output, &dek, &envelope)?;
        io::copy(&mut (&mut reader).take(request.skip), &mut io::sink())?;
        op.advance(OperationState::BodyTransformInProgress);
        Ok((Box::new(reader.take(request.len)), envelope, hints))
    }

    /// Generate a DEK and the envelope that carries it
    pub(crate) fn new_envelope(&self, content_length: u64) -> Result<(DataKey, EnvelopeMetadata)> {
        let dek = DataKey::generate(self.config.key_length);
        let wrapped = self.strategy.wrap(&dek, ContentCipher::AesGcm)?;
        let envelope = EnvelopeMetadata::encode(
            &dek,
            wrapped,
            ContentCipher::AesGcm,
            self.config.tag_length_bits,
            content_length,
        )?;
        Ok((dek, envelope))
    }

    /// Metadata to store on the object itself
    pub(crate) fn object_metadata(&self, envelope: &EnvelopeMetadata) -> MetadataMap {
        match self.config.storage_mode {
            StorageMode::ObjectMetadata => envelope.to_map(),
            StorageMode::InstructionFile => {
                let mut map = MetadataMap::new();
                map.insert(INSTRUCTION_FILE_HEADER.to_string(), String::new());
                map
            }
        }
    }

    /// Write the instruction object, if that is where envelopes live
    pub(crate) fn write_instruction(&self, key: &str, envelope: &EnvelopeMetadata) -> Result<()> {
        if self.config.storage_mode != StorageMode::InstructionFile {
            return Ok(());
        }
        let body = envelope.to_instruction_json()?;
        let instruction_key = self.config.instruction_key(key);
        self.store
            .put_object(&instruction_key, &mut body.as_slice(), MetadataMap::new())
            .map_err(ClientError::from_store)?;
        debug!(key, instruction_key = %instruction_key, "instruction object written");
        Ok(())
    }

    /// Find and decode the envelope for `key`
    ///
    /// An envelope in the object's own metadata wins; otherwise the
    /// instruction object is read, whichever mode new objects are written in.
    fn load_envelope(&self, key: &str, metadata: &MetadataMap) -> Result<(EnvelopeMetadata, DecodeHints)> {
        let profile = self.config.security_profile;
        if has_envelope(metadata) {
            return Ok(EnvelopeMetadata::decode(metadata, profile)?);
        }

        let instruction_key = self.config.instruction_key(key);
        let mut output = self
            .store
            .get_object(&instruction_key, None)
            .map_err(ClientError::from_store)?;
        let mut body = Vec::new();
        output.body.read_to_end(&mut body)?;
        let map = EnvelopeMetadata::from_instruction_json(&body)?;
        let (envelope, hints) = EnvelopeMetadata::decode(&map, profile)?;
        debug!(key, instruction_key = %instruction_key, legacy = hints.legacy, "envelope read from instruction object");
        Ok((envelope, hints))
    }
}

fn require_gcm(envelope: &EnvelopeMetadata) -> Result<()> {
    if envelope.cek_algorithm != ContentCipher::AesGcm {
        return Err(CryptoError::format(
            CEK_ALG_HEADER,
            format!(
                "ranged decryption needs AES/GCM content, object uses {}",
                envelope.cek_algorithm.id()
            ),
        )
        .into());
    }
    Ok(())
}

fn ranged_reader(
    output: GetObjectOutput,
    dek: &DataKey,
    envelope: &EnvelopeMetadata,
) -> Result<RangedDecryptingReader<Box<dyn Read + Send>>> {
    let descriptor = output
        .content_range
        .ok_or_else(|| CryptoError::missing("content-range"))?;
    let range = ByteRange::parse(&descriptor)?;
    Ok(RangedDecryptingReader::new(
        output.body,
        dek,
        &range,
        Some(envelope.unencrypted_content_length),
    )?)
}

/// A decrypting object body
///
/// Read it like any other `Read`. Reaching EOF means the object was fully
/// decrypted (and, for whole-object reads, authenticated).
pub struct DecryptedObject {
    reader: Box<dyn Read + Send>,
    envelope: EnvelopeMetadata,
    hints: DecodeHints,
    op: OperationTracker,
}

impl DecryptedObject {
    fn new(
        reader: Box<dyn Read + Send>,
        envelope: EnvelopeMetadata,
        hints: DecodeHints,
        op: OperationTracker,
    ) -> Self {
        Self {
            reader,
            envelope,
            hints,
            op,
        }
    }

    /// Where the operation is in its lifecycle
    pub fn state(&self) -> OperationState {
        self.op.state()
    }

    /// The decoded envelope
    pub fn envelope(&self) -> &EnvelopeMetadata {
        &self.envelope
    }

    /// Whether the object was written by the prior client generation
    pub fn is_legacy(&self) -> bool {
        self.hints.legacy
    }

    /// Plaintext length of the whole object
    pub fn content_length(&self) -> u64 {
        self.envelope.unencrypted_content_length
    }

    /// Read everything that is left
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for DecryptedObject {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.op.advance(OperationState::Complete);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.op.fail(FailureKind::from_io(&e), &e);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for DecryptedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedObject")
            .field("state", &self.state())
            .field("content_length", &self.content_length())
            .field("legacy", &self.hints.legacy)
            .finish()
    }
}
