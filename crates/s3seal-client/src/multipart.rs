//! Encrypted multipart uploads
//!
//! One DEK and one GCM keystream span the whole object. Part `n` is encrypted
//! from plaintext offset `(n - 1) * part_size`, so non-final parts can be
//! encrypted and uploaded from any thread in any order. Each part yields a
//! GHASH digest; the final part chains the digests of all earlier parts and
//! appends the tag, which is why it has to wait for them.

use crate::{
    encryption::{EncryptedClient, PutObjectOutput},
    operation::{OperationState, OperationTracker},
    store::{CompletedPart, ObjectStore},
    ClientError, Result,
};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use s3seal_crypto::{
    EncryptingReader, EnvelopeMetadata, GcmKeys, SegmentDigest, SegmentFinish, BLOCK_SIZE,
};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Most parts one multipart upload may have
pub const MAX_PARTS: u32 = 10_000;

/// Handle returned by [`EncryptedClient::initiate_multipart_upload`]
#[derive(Clone, Debug)]
pub struct MultipartUpload {
    /// Upload id assigned by the store
    pub upload_id: String,
    /// Destination key
    pub key: String,
    /// Plaintext bytes in every part but the last
    pub part_size: u64,
    /// Number of parts the object splits into
    pub part_count: u32,
}

impl MultipartUpload {
    /// Plaintext byte range `(offset, len)` that part `part_number` must carry
    pub fn part_range(&self, part_number: u32, content_length: u64) -> Option<(u64, u64)> {
        part_range(self.part_size, self.part_count, content_length, part_number)
    }
}

/// Parts needed for `content_length` bytes; an empty object is one empty part
fn part_count(content_length: u64, part_size: u64) -> Result<u32> {
    let count = content_length.div_ceil(part_size).max(1);
    match u32::try_from(count) {
        Ok(count) if count <= MAX_PARTS => Ok(count),
        _ => Err(ClientError::Config(format!(
            "{} bytes in parts of {} bytes needs {} parts, the limit is {}",
            content_length, part_size, count, MAX_PARTS
        ))),
    }
}

fn part_range(part_size: u64, part_count: u32, content_length: u64, part_number: u32) -> Option<(u64, u64)> {
    if part_number == 0 || part_number > part_count {
        return None;
    }
    let offset = u64::from(part_number - 1) * part_size;
    Some((offset, part_size.min(content_length - offset)))
}

struct CommittedPart {
    etag: String,
    digest: SegmentDigest,
}

#[derive(Default)]
struct ChainState {
    /// Parts currently being encrypted and uploaded
    claimed: BTreeSet<u32>,
    /// Parts the store has accepted, with their digests
    committed: BTreeMap<u32, CommittedPart>,
}

impl ChainState {
    fn missing_before(&self, part_number: u32) -> Vec<u32> {
        (1..part_number)
            .filter(|n| !self.committed.contains_key(n))
            .collect()
    }
}

/// Encryption state shared by every part of one upload
pub(crate) struct MultipartEncryptionContext {
    key: String,
    upload_id: String,
    keys: GcmKeys,
    envelope: EnvelopeMetadata,
    part_size: u64,
    part_count: u32,
    chain: Mutex<ChainState>,
}

impl MultipartEncryptionContext {
    pub(crate) fn new(
        key: &str,
        upload_id: &str,
        keys: GcmKeys,
        envelope: EnvelopeMetadata,
        part_size: u64,
        part_count: u32,
    ) -> Self {
        Self {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            keys,
            envelope,
            part_size,
            part_count,
            chain: Mutex::new(ChainState::default()),
        }
    }

    fn content_length(&self) -> u64 {
        self.envelope.unencrypted_content_length
    }

    fn handle(&self) -> MultipartUpload {
        MultipartUpload {
            upload_id: self.upload_id.clone(),
            key: self.key.clone(),
            part_size: self.part_size,
            part_count: self.part_count,
        }
    }

    /// Reserve `part_number` for encryption
    ///
    /// For the final part this also checks that every earlier part has been
    /// committed and returns their chained digest.
    fn claim(&self, part_number: u32) -> Result<Option<[u8; BLOCK_SIZE]>> {
        let mut chain = self.chain.lock();
        if chain.committed.contains_key(&part_number) || chain.claimed.contains(&part_number) {
            return Err(ClientError::InvalidPart {
                part_number,
                reason: "part was already uploaded".to_string(),
            });
        }

        let prefix = if part_number == self.part_count {
            let missing = chain.missing_before(part_number);
            if !missing.is_empty() {
                return Err(ClientError::PartsOutstanding {
                    upload_id: self.upload_id.clone(),
                    part_number,
                    missing,
                });
            }
            Some(
                chain
                    .committed
                    .values()
                    .fold([0u8; BLOCK_SIZE], |acc, part| self.keys.chain(acc, &part.digest)),
            )
        } else {
            None
        };

        chain.claimed.insert(part_number);
        Ok(prefix)
    }

    fn commit(&self, part_number: u32, etag: String, digest: SegmentDigest) {
        let mut chain = self.chain.lock();
        chain.claimed.remove(&part_number);
        chain.committed.insert(part_number, CommittedPart { etag, digest });
    }

    fn release(&self, part_number: u32) {
        self.chain.lock().claimed.remove(&part_number);
    }

    fn completed_parts(&self) -> std::result::Result<Vec<CompletedPart>, Vec<u32>> {
        let chain = self.chain.lock();
        let missing: Vec<u32> = (1..=self.part_count)
            .filter(|n| !chain.committed.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }
        Ok(chain
            .committed
            .iter()
            .map(|(&part_number, part)| CompletedPart {
                part_number,
                etag: part.etag.clone(),
            })
            .collect())
    }
}

/// Upload id to encryption context
///
/// Creation is insert-if-absent, so an id is never bound to two contexts.
#[derive(Default)]
pub(crate) struct MultipartRegistry {
    contexts: DashMap<String, Arc<MultipartEncryptionContext>>,
}

impl MultipartRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `context` under its upload id, failing if one already exists
    pub(crate) fn try_create(&self, context: MultipartEncryptionContext) -> Result<Arc<MultipartEncryptionContext>> {
        match self.contexts.entry(context.upload_id.clone()) {
            Entry::Occupied(entry) => Err(ClientError::DuplicateUpload(entry.key().clone())),
            Entry::Vacant(entry) => Ok(entry.insert(Arc::new(context)).value().clone()),
        }
    }

    pub(crate) fn get(&self, upload_id: &str) -> Result<Arc<MultipartEncryptionContext>> {
        self.contexts
            .get(upload_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClientError::UnknownUpload(upload_id.to_string()))
    }

    pub(crate) fn remove(&self, upload_id: &str) -> Option<Arc<MultipartEncryptionContext>> {
        self.contexts.remove(upload_id).map(|(_, context)| context)
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.len()
    }
}

impl<S: ObjectStore> EncryptedClient<S> {
    /// Start an encrypted multipart upload of `content_length` plaintext bytes
    #[instrument(skip(self))]
    pub fn initiate_multipart_upload(&self, key: &str, content_length: u64) -> Result<MultipartUpload> {
        let mut op = OperationTracker::start("initiate_multipart", key);
        let result = self.initiate_inner(key, content_length, &mut op);
        let upload = op.observe(result)?;
        op.advance(OperationState::Complete);
        info!(
            key,
            upload_id = %upload.upload_id,
            part_count = upload.part_count,
            "encrypted multipart upload started"
        );
        Ok(upload)
    }

    fn initiate_inner(&self, key: &str, content_length: u64, op: &mut OperationTracker) -> Result<MultipartUpload> {
        let parts = part_count(content_length, self.config.part_size)?;
        let (dek, envelope) = self.new_envelope(content_length)?;
        let keys = GcmKeys::new(dek.key(), dek.iv(), envelope.tag_length_bits)?;
        op.advance(OperationState::MaterialsResolved);

        let upload_id = self
            .store
            .initiate_upload(key, self.object_metadata(&envelope))
            .map_err(ClientError::from_store)?;
        let context = self.uploads.try_create(MultipartEncryptionContext::new(
            key,
            &upload_id,
            keys,
            envelope,
            self.config.part_size,
            parts,
        ))?;
        Ok(context.handle())
    }

    /// Encrypt and upload one part
    ///
    /// `body` must carry exactly the plaintext of
    /// [`MultipartUpload::part_range`]. Parts other than the last may be sent
    /// concurrently; the last fails with [`ClientError::PartsOutstanding`]
    /// until every earlier part has been accepted by the store.
    #[instrument(skip(self, body))]
    pub fn upload_part<R: Read>(&self, upload_id: &str, part_number: u32, body: R) -> Result<String> {
        let context = self.uploads.get(upload_id)?;
        let mut op = OperationTracker::start("upload_part", &context.key);
        let result = self.upload_part_inner(&context, part_number, body, &mut op);
        let etag = op.observe(result)?;
        op.advance(OperationState::Complete);
        debug!(upload_id, part_number, etag = %etag, "part uploaded");
        Ok(etag)
    }

    fn upload_part_inner<R: Read>(
        &self,
        context: &Arc<MultipartEncryptionContext>,
        part_number: u32,
        body: R,
        op: &mut OperationTracker,
    ) -> Result<String> {
        let (offset, len) = part_range(
            context.part_size,
            context.part_count,
            context.content_length(),
            part_number,
        )
        .ok_or_else(|| ClientError::InvalidPart {
            part_number,
            reason: format!("upload has parts 1..={}", context.part_count),
        })?;

        let prefix = context.claim(part_number)?;
        op.advance(OperationState::MaterialsResolved);

        let slot: Arc<Mutex<Option<SegmentDigest>>> = Arc::new(Mutex::new(None));
        let finish: SegmentFinish = {
            let slot = slot.clone();
            match prefix {
                None => Box::new(move |digest| {
                    *slot.lock() = Some(digest);
                    Ok(Vec::new())
                }),
                Some(acc) => {
                    let keys = context.keys.clone();
                    let content_length = context.content_length();
                    Box::new(move |digest| {
                        *slot.lock() = Some(digest);
                        let y = keys.chain(acc, &digest);
                        Ok(keys.tag(y, 0, content_length))
                    })
                }
            }
        };

        let uploaded = EncryptingReader::segment(body, &context.keys, offset, finish)
            .map(|reader| reader.with_expected_len(len))
            .map_err(ClientError::from)
            .and_then(|mut reader| {
                op.advance(OperationState::BodyTransformInProgress);
                self.store
                    .upload_part(&context.key, &context.upload_id, part_number, &mut reader)
                    .map_err(ClientError::from_store)
            });

        let etag = match uploaded {
            Ok(etag) => etag,
            Err(err) => {
                context.release(part_number);
                return Err(err);
            }
        };

        // The digest is only recorded once the encryptor reached EOF
        let Some(digest) = slot.lock().take() else {
            context.release(part_number);
            warn!(upload_id = %context.upload_id, part_number, "store accepted a partially read part");
            return Err(ClientError::InvalidPart {
                part_number,
                reason: "store did not read the part to the end".to_string(),
            });
        };
        context.commit(part_number, etag.clone(), digest);
        Ok(etag)
    }

    /// Assemble the parts and write the envelope
    #[instrument(skip(self))]
    pub fn complete_multipart_upload(&self, upload_id: &str) -> Result<PutObjectOutput> {
        let context = self.uploads.get(upload_id)?;
        let mut op = OperationTracker::start("complete_multipart", &context.key);
        let result = self.complete_inner(&context, &mut op);
        let output = op.observe(result)?;
        self.uploads.remove(upload_id);
        op.advance(OperationState::Complete);
        info!(key = %context.key, upload_id, etag = %output.etag, "encrypted multipart upload completed");
        Ok(output)
    }

    fn complete_inner(&self, context: &MultipartEncryptionContext, op: &mut OperationTracker) -> Result<PutObjectOutput> {
        let parts = context
            .completed_parts()
            .map_err(|missing| ClientError::Incomplete {
                upload_id: context.upload_id.clone(),
                missing,
            })?;
        op.advance(OperationState::MaterialsResolved);

        let etag = self
            .store
            .complete_upload(&context.key, &context.upload_id, &parts)
            .map_err(ClientError::from_store)?;
        self.write_instruction(&context.key, &context.envelope)?;
        Ok(PutObjectOutput {
            etag,
            envelope: context.envelope.clone(),
        })
    }

    /// Abandon an upload and drop its encryption context
    #[instrument(skip(self))]
    pub fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        let context = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| ClientError::UnknownUpload(upload_id.to_string()))?;
        self.store
            .abort_upload(&context.key, upload_id)
            .map_err(ClientError::from_store)?;
        info!(key = %context.key, upload_id, "multipart upload aborted");
        Ok(())
    }

    /// Number of multipart uploads with a live encryption context
    pub fn active_uploads(&self) -> usize {
        self.uploads.len()
    }
}
