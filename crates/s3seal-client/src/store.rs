//! Object store capability
//!
//! The transfer protocol (HTTP, retries, connection pooling) is not part of
//! this crate. Anything that can put, get and multipart-upload objects can sit
//! behind [`ObjectStore`]; [`MemoryObjectStore`] is an in-process store for
//! tests and demos.

use anyhow::{anyhow, bail, Context};
use dashmap::DashMap;
use s3seal_crypto::MetadataMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use uuid::Uuid;

/// Body stream handed back by a GET
pub type Body = Box<dyn Read + Send>;

/// Inclusive byte range for a ranged GET
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestRange {
    pub start: u64,
    pub end: u64,
}

impl RequestRange {
    /// Range covering `start..=end`
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

/// Result of a GET
pub struct GetObjectOutput {
    /// Object (or range) bytes, read lazily
    pub body: Body,
    /// `Content-Range` of a ranged response, `bytes <start>-<end>/<total>`
    pub content_range: Option<String>,
    /// User metadata stored with the object
    pub metadata: MetadataMap,
}

/// A part to stitch together on completion
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Storage operations the orchestrators need
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` and return its ETag
    fn put_object(&self, key: &str, body: &mut dyn Read, metadata: MetadataMap) -> anyhow::Result<String>;

    /// Fetch an object, or an inclusive byte range of it
    fn get_object(&self, key: &str, range: Option<RequestRange>) -> anyhow::Result<GetObjectOutput>;

    /// Fetch only an object's metadata
    fn head_object(&self, key: &str) -> anyhow::Result<MetadataMap>;

    /// Start a multipart upload and return its upload id
    fn initiate_upload(&self, key: &str, metadata: MetadataMap) -> anyhow::Result<String>;

    /// Store one part and return its ETag
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn Read,
    ) -> anyhow::Result<String>;

    /// Assemble the listed parts into the final object
    fn complete_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> anyhow::Result<String>;

    /// Discard a multipart upload and its parts
    fn abort_upload(&self, key: &str, upload_id: &str) -> anyhow::Result<()>;
}

impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    fn put_object(&self, key: &str, body: &mut dyn Read, metadata: MetadataMap) -> anyhow::Result<String> {
        (**self).put_object(key, body, metadata)
    }

    fn get_object(&self, key: &str, range: Option<RequestRange>) -> anyhow::Result<GetObjectOutput> {
        (**self).get_object(key, range)
    }

    fn head_object(&self, key: &str) -> anyhow::Result<MetadataMap> {
        (**self).head_object(key)
    }

    fn initiate_upload(&self, key: &str, metadata: MetadataMap) -> anyhow::Result<String> {
        (**self).initiate_upload(key, metadata)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn Read,
    ) -> anyhow::Result<String> {
        (**self).upload_part(key, upload_id, part_number, body)
    }

    fn complete_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> anyhow::Result<String> {
        (**self).complete_upload(key, upload_id, parts)
    }

    fn abort_upload(&self, key: &str, upload_id: &str) -> anyhow::Result<()> {
        (**self).abort_upload(key, upload_id)
    }
}

#[derive(Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    metadata: MetadataMap,
}

struct PendingUpload {
    key: String,
    metadata: MetadataMap,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

/// An in-memory object store
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, StoredObject>>,
    uploads: Arc<DashMap<String, PendingUpload>>,
}

fn etag(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..16])
}

impl MemoryObjectStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of multipart uploads in progress
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Raw stored bytes and metadata, as the service would hold them
    pub fn raw_object(&self, key: &str) -> Option<(Vec<u8>, MetadataMap)> {
        self.objects
            .get(key)
            .map(|entry| (entry.data.as_ref().clone(), entry.metadata.clone()))
    }

    /// Overwrite an object's bytes and metadata directly
    pub fn insert_raw(&self, key: &str, data: Vec<u8>, metadata: MetadataMap) {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                data: Arc::new(data),
                metadata,
            },
        );
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_object(&self, key: &str, body: &mut dyn Read, metadata: MetadataMap) -> anyhow::Result<String> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)?;
        let tag = etag(&data);
        self.insert_raw(key, data, metadata);
        Ok(tag)
    }

    fn get_object(&self, key: &str, range: Option<RequestRange>) -> anyhow::Result<GetObjectOutput> {
        let object = self
            .objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("NoSuchKey: {}", key))?;

        let Some(range) = range else {
            return Ok(GetObjectOutput {
                body: Box::new(Cursor::new(object.data.as_ref().clone())),
                content_range: None,
                metadata: object.metadata,
            });
        };

        let total = object.data.len() as u64;
        if range.start > range.end || range.start >= total {
            bail!("InvalidRange: bytes {}-{} of {}", range.start, range.end, total);
        }
        let end = range.end.min(total - 1);
        let slice = object.data[range.start as usize..=end as usize].to_vec();
        Ok(GetObjectOutput {
            body: Box::new(Cursor::new(slice)),
            content_range: Some(format!("bytes {}-{}/{}", range.start, end, total)),
            metadata: object.metadata,
        })
    }

    fn head_object(&self, key: &str) -> anyhow::Result<MetadataMap> {
        self.objects
            .get(key)
            .map(|entry| entry.metadata.clone())
            .ok_or_else(|| anyhow!("NoSuchKey: {}", key))
    }

    fn initiate_upload(&self, key: &str, metadata: MetadataMap) -> anyhow::Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &mut dyn Read,
    ) -> anyhow::Result<String> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)?;
        let tag = etag(&data);

        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow!("NoSuchUpload: {}", upload_id))?;
        if upload.key != key {
            bail!("upload {} belongs to key {}", upload_id, upload.key);
        }
        upload.parts.insert(part_number, (tag.clone(), data));
        Ok(tag)
    }

    fn complete_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> anyhow::Result<String> {
        let (_, upload) = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| anyhow!("NoSuchUpload: {}", upload_id))?;
        if upload.key != key {
            bail!("upload {} belongs to key {}", upload_id, upload.key);
        }

        let mut data = Vec::new();
        for part in parts {
            let (stored_tag, bytes) = upload
                .parts
                .get(&part.part_number)
                .with_context(|| format!("InvalidPart: {} was never uploaded", part.part_number))?;
            if stored_tag != &part.etag {
                bail!("InvalidPart: ETag mismatch for part {}", part.part_number);
            }
            data.extend_from_slice(bytes);
        }
        let tag = format!("{}-{}", etag(&data), parts.len());
        self.insert_raw(key, data, upload.metadata);
        Ok(tag)
    }

    fn abort_upload(&self, _key: &str, upload_id: &str) -> anyhow::Result<()> {
        self.uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("NoSuchUpload: {}", upload_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(mut out: GetObjectOutput) -> Vec<u8> {
        let mut data = Vec::new();
        out.body.read_to_end(&mut data).unwrap();
        data
    }

    #[test]
    fn test_put_get() {
        let store = MemoryObjectStore::new();
        let mut meta = MetadataMap::new();
        meta.insert("a".to_string(), "b".to_string());
        store.put_object("k", &mut &b"hello world"[..], meta).unwrap();

        let out = store.get_object("k", None).unwrap();
        assert_eq!(out.metadata["a"], "b");
        assert_eq!(store.head_object("k").unwrap()["a"], "b");
        assert!(out.content_range.is_none());
        assert_eq!(read_all(out), b"hello world");
        assert!(store.get_object("missing", None).is_err());
    }

    #[test]
    fn test_ranged_get_clamps_end() {
        let store = MemoryObjectStore::new();
        store.put_object("k", &mut &b"0123456789"[..], MetadataMap::new()).unwrap();

        let out = store.get_object("k", Some(RequestRange::new(4, 100))).unwrap();
        assert_eq!(out.content_range.as_deref(), Some("bytes 4-9/10"));
        assert_eq!(read_all(out), b"456789");
        assert!(store.get_object("k", Some(RequestRange::new(10, 12))).is_err());
    }

    #[test]
    fn test_multipart_assembly() {
        let store = MemoryObjectStore::new();
        let id = store.initiate_upload("k", MetadataMap::new()).unwrap();
        let e2 = store.upload_part("k", &id, 2, &mut &b"world"[..]).unwrap();
        let e1 = store.upload_part("k", &id, 1, &mut &b"hello "[..]).unwrap();
        assert_eq!(store.pending_uploads(), 1);

        let parts = [
            CompletedPart { part_number: 1, etag: e1 },
            CompletedPart { part_number: 2, etag: e2 },
        ];
        store.complete_upload("k", &id, &parts).unwrap();
        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(read_all(store.get_object("k", None).unwrap()), b"hello world");
    }

    #[test]
    fn test_abort() {
        let store = MemoryObjectStore::new();
        let id = store.initiate_upload("k", MetadataMap::new()).unwrap();
        store.abort_upload("k", &id).unwrap();
        assert!(store.abort_upload("k", &id).is_err());
        assert!(store.upload_part("k", &id, 1, &mut &b"x"[..]).is_err());
    }
}
