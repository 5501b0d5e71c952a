//! End-to-end tests for the encrypted client
//!
//! Every test runs against the in-memory store, so what ends up "on the wire"
//! can be inspected and tampered with directly.

use proptest::prelude::*;
use rstest::rstest;
use s3seal_client::{
    AesKek, ClientConfig, ClientError, EncryptedClient, EncryptionContext, EncryptionMaterials,
    FailureKind, GetObjectOutput, KeyLength, KeyWrapService, MemoryKeyWrapService, MemoryObjectStore,
    ObjectStore, OperationState, RequestRange, RsaKek, SecurityProfile, StorageMode,
};
use s3seal_crypto::{rsa::RsaPrivateKey, CryptoError, MetadataMap};
use std::io::Read;
use std::sync::{Arc, OnceLock};

const KEK: [u8; 32] = [0x42; 32];

fn plaintext(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

fn aes_materials() -> EncryptionMaterials {
    EncryptionMaterials::aes(AesKek::new(&KEK).unwrap())
}

fn rsa_materials() -> EncryptionMaterials {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    let private = KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).unwrap());
    EncryptionMaterials::rsa(RsaKek::from_private(private.clone()))
}

fn kms_service() -> Arc<dyn KeyWrapService> {
    Arc::new(
        MemoryKeyWrapService::new()
            .with_key("alias/primary")
            .with_key("alias/secondary"),
    )
}

fn kms_materials(key_id: &str) -> EncryptionMaterials {
    let mut context = EncryptionContext::new();
    context.insert("tenant".to_string(), "acme".to_string());
    EncryptionMaterials::kms(key_id, context)
}

fn client_with(
    store: &MemoryObjectStore,
    config: ClientConfig,
    materials: &EncryptionMaterials,
    kms: Option<Arc<dyn KeyWrapService>>,
) -> EncryptedClient<MemoryObjectStore> {
    EncryptedClient::new(store.clone(), config, materials, kms).unwrap()
}

fn aes_client(store: &MemoryObjectStore) -> EncryptedClient<MemoryObjectStore> {
    client_with(store, ClientConfig::default(), &aes_materials(), None)
}

fn read_object(client: &EncryptedClient<MemoryObjectStore>, key: &str) -> Vec<u8> {
    client.get_object(key).unwrap().into_bytes().unwrap()
}

#[rstest]
#[case::metadata(StorageMode::ObjectMetadata)]
#[case::instruction(StorageMode::InstructionFile)]
fn test_round_trip_per_storage_mode(#[case] mode: StorageMode) {
    let store = MemoryObjectStore::new();
    let config = ClientConfig::default().with_storage_mode(mode);
    let client = client_with(&store, config, &aes_materials(), None);
    let data = plaintext(5000);

    let output = client.put_object("docs/report.pdf", &data[..], data.len() as u64).unwrap();
    assert_eq!(output.envelope.unencrypted_content_length, 5000);

    let (stored, metadata) = store.raw_object("docs/report.pdf").unwrap();
    assert_eq!(stored.len(), 5016);
    assert_ne!(&stored[..5000], &data[..]);
    match mode {
        StorageMode::ObjectMetadata => {
            assert!(metadata.contains_key("x-amz-key-v2"));
            assert!(store.raw_object("docs/report.pdf.instruction").is_none());
        }
        StorageMode::InstructionFile => {
            assert!(metadata.contains_key("x-amz-crypto-instr-file"));
            assert!(!metadata.contains_key("x-amz-key-v2"));
            let (body, _) = store.raw_object("docs/report.pdf.instruction").unwrap();
            let json: MetadataMap = serde_json_map(&body);
            assert_eq!(json["x-amz-cek-alg"], "AES/GCM/NoPadding");
            assert_eq!(json["x-amz-wrap-alg"], "AES/GCM");
        }
    }

    let mut object = client.get_object("docs/report.pdf").unwrap();
    assert_eq!(object.state(), OperationState::BodyTransformInProgress);
    let mut out = Vec::new();
    object.read_to_end(&mut out).unwrap();
    assert_eq!(out, data);
    assert_eq!(object.state(), OperationState::Complete);
    assert!(!object.is_legacy());
}

fn serde_json_map(body: &[u8]) -> MetadataMap {
    s3seal_crypto::EnvelopeMetadata::from_instruction_json(body).unwrap()
}

#[rstest]
#[case::aes(aes_materials(), None)]
#[case::rsa(rsa_materials(), None)]
#[case::kms(kms_materials("alias/primary"), Some(kms_service()))]
fn test_round_trip_per_wrap_strategy(
    #[case] materials: EncryptionMaterials,
    #[case] kms: Option<Arc<dyn KeyWrapService>>,
) {
    let store = MemoryObjectStore::new();
    let client = client_with(&store, ClientConfig::default(), &materials, kms);
    let data = plaintext(777);

    client.put_object("k", &data[..], 777).unwrap();
    assert_eq!(read_object(&client, "k"), data);
}

#[test]
fn test_empty_object() {
    let store = MemoryObjectStore::new();
    let client = aes_client(&store);
    client.put_object("empty", &b""[..], 0).unwrap();
    assert_eq!(store.raw_object("empty").unwrap().0.len(), 16);
    assert!(read_object(&client, "empty").is_empty());
}

#[test]
fn test_metadata_client_reads_instruction_objects() {
    let store = MemoryObjectStore::new();
    let writer = client_with(
        &store,
        ClientConfig::default().with_storage_mode(StorageMode::InstructionFile),
        &aes_materials(),
        None,
    );
    writer.put_object("k", &b"sidecar"[..], 7).unwrap();

    let reader = aes_client(&store);
    assert_eq!(read_object(&reader, "k"), b"sidecar");
}

#[test_log::test]
fn test_tampered_ciphertext_fails_authentication() {
    let store = MemoryObjectStore::new();
    let client = aes_client(&store);
    let data = plaintext(300);
    client.put_object("k", &data[..], 300).unwrap();

    for position in [0usize, 150, 299, 300, 315] {
        let (mut stored, metadata) = store.raw_object("k").unwrap();
        stored[position] ^= 0x01;
        store.insert_raw("tampered", stored, metadata);

        let mut object = client.get_object("tampered").unwrap();
        let err = object.read_to_end(&mut Vec::new()).unwrap_err();
        let err = ClientError::from(err);
        assert!(err.is_integrity_failure(), "byte {}: {:?}", position, err);
        assert_eq!(
            object.state(),
            OperationState::Failed(FailureKind::Authentication)
        );
    }
}

#[test]
fn test_truncated_object_fails() {
    let store = MemoryObjectStore::new();
    let client = aes_client(&store);
    client.put_object("k", &plaintext(64)[..], 64).unwrap();

    let (mut stored, metadata) = store.raw_object("k").unwrap();
    stored.truncate(70);
    store.insert_raw("k", stored, metadata);
    assert!(client.get_object("k").unwrap().into_bytes().is_err());
}

#[test]
fn test_body_length_must_match_declared_length() {
    let store = MemoryObjectStore::new();
    let client = aes_client(&store);

    let err = client.put_object("short", &b"0123456789"[..], 11).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Crypto(CryptoError::LengthMismatch { expected: 11, actual: 10 })
    ));
    let err = client.put_object("long", &b"0123456789"[..], 9).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Crypto(CryptoError::LengthMismatch { expected: 9, actual: 10 })
    ));
    assert!(store.is_empty());
}

#[test_log::test]
fn test_ranged_get_of_ciphertext() {
    let store = MemoryObjectStore::new();
    let client = aes_client(&store);
    let data = plaintext(1000);
    client.put_object("k", &data[..], 1000).unwrap();

    let out = client.get_object_ranged("k", 32, 95).unwrap().into_bytes().unwrap();
    assert_eq!(out, &data[32..96]);

    // The range runs into the tag; tag bytes are dropped
    let out = client.get_object_ranged("k", 992, 1015).unwrap().into_bytes().unwrap();
    assert_eq!(out, &data[992..]);

    let out = client.get_object_ranged("k", 0, 15).unwrap().into_bytes().unwrap();
    assert_eq!(out, &data[..16]);
}

#[test]
fn test_ranged_get_rejects_misaligned_start() {
    let store = MemoryObjectStore::new();
    let client = aes_client(&store);
    client.put_object("k", &plaintext(100)[..], 100).unwrap();

    match client.get_object_ranged("k", 17, 40) {
        Err(ClientError::Crypto(CryptoError::InvalidRangeAlignment {
            block_boundary,
            block_size,
            offset,
        })) => {
            assert_eq!(block_boundary, 16);
            assert_eq!(block_size, 16);
            assert_eq!(offset, 17);
        }
        other => panic!("expected InvalidRangeAlignment, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_plaintext_range_trims_to_request() {
    let store = MemoryObjectStore::new();
    let client = aes_client(&store);
    let data = plaintext(1000);
    client.put_object("k", &data[..], 1000).unwrap();

    let read = |start, end| client.get_object_range("k", start, end).unwrap().into_bytes().unwrap();
    assert_eq!(read(5, 20), &data[5..=20]);
    assert_eq!(read(17, 17), &data[17..=17]);
    assert_eq!(read(990, 5000), &data[990..]);
    assert!(read(1000, 1200).is_empty());
    assert!(client.get_object_range("k", 20, 5).is_err());
}

#[test]
fn test_ranged_reads_from_instruction_mode() {
    let store = MemoryObjectStore::new();
    let config = ClientConfig::default().with_storage_mode(StorageMode::InstructionFile);
    let client = client_with(&store, config, &aes_materials(), None);
    let data = plaintext(200);
    client.put_object("k", &data[..], 200).unwrap();

    assert_eq!(client.get_object_range("k", 3, 150).unwrap().into_bytes().unwrap(), &data[3..=150]);
    assert_eq!(client.get_object_ranged("k", 48, 63).unwrap().into_bytes().unwrap(), &data[48..64]);
}

#[test]
fn test_wrong_kek_fails_unwrap() {
    let store = MemoryObjectStore::new();
    aes_client(&store).put_object("k", &b"secret"[..], 6).unwrap();

    let other = client_with(
        &store,
        ClientConfig::default(),
        &EncryptionMaterials::aes(AesKek::generate(KeyLength::Aes256)),
        None,
    );
    let err = other.get_object("k").unwrap_err();
    assert!(matches!(err, ClientError::Crypto(CryptoError::Unwrap { .. })));
    assert_eq!(err.failure_kind(), FailureKind::Unwrap);
}

#[test]
fn test_kms_key_mismatch() {
    let store = MemoryObjectStore::new();
    let kms = kms_service();
    client_with(&store, ClientConfig::default(), &kms_materials("alias/primary"), Some(kms.clone()))
        .put_object("k", &b"secret"[..], 6)
        .unwrap();

    let (_, metadata) = store.raw_object("k").unwrap();
    assert!(metadata["x-amz-matdesc"].contains("aws:x-amz-cek-alg"));
    assert!(metadata["x-amz-matdesc"].contains("acme"));

    let reader = client_with(&store, ClientConfig::default(), &kms_materials("alias/secondary"), Some(kms));
    match reader.get_object("k") {
        Err(ClientError::Crypto(CryptoError::KeyMismatch { expected, actual })) => {
            assert_eq!(expected, "alias/secondary");
            assert_eq!(actual, "alias/primary");
        }
        other => panic!("expected KeyMismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_kms_context_with_reserved_key_is_rejected() {
    let mut context = EncryptionContext::new();
    context.insert("aws:x-amz-cek-alg".to_string(), "AES/GCM/NoPadding".to_string());
    let result = EncryptedClient::new(
        MemoryObjectStore::new(),
        ClientConfig::default(),
        &EncryptionMaterials::kms("alias/primary", context),
        Some(kms_service()),
    );
    assert!(matches!(
        result,
        Err(ClientError::Crypto(CryptoError::ReservedContextKey(_)))
    ));
}

/// Write an object the way the prior client generation did: v1 key header,
/// AES/CBC/PKCS5Padding content, RFC 3394 key wrap
fn put_legacy_object(store: &MemoryObjectStore, key: &str, data: &[u8]) {
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    use base64::Engine;

    let dek = [0x24u8; 32];
    let iv = [0x07u8; 16];
    let mut wrapped = [0u8; 40];
    aes_kw::KekAes256::from(KEK).wrap(&dek, &mut wrapped).unwrap();
    let body = cbc::Encryptor::<aes::Aes256>::new(&dek.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(data);

    let b64 = base64::engine::general_purpose::STANDARD;
    let mut metadata = MetadataMap::new();
    metadata.insert("x-amz-key".to_string(), b64.encode(wrapped));
    metadata.insert("x-amz-iv".to_string(), b64.encode(iv));
    metadata.insert("x-amz-matdesc".to_string(), "{}".to_string());
    metadata.insert("x-amz-unencrypted-content-length".to_string(), data.len().to_string());
    store.insert_raw(key, body, metadata);
}

#[test_log::test]
fn test_legacy_object_needs_legacy_profile() {
    let store = MemoryObjectStore::new();
    let data = plaintext(100);
    put_legacy_object(&store, "old", &data);

    let strict = aes_client(&store);
    let err = strict.get_object("old").unwrap_err();
    assert!(matches!(
        err,
        ClientError::Crypto(CryptoError::UnsupportedLegacyFormat { .. })
    ));
    assert_eq!(err.failure_kind(), FailureKind::UnsupportedLegacyFormat);

    let lenient = client_with(
        &store,
        ClientConfig::default().with_security_profile(SecurityProfile::CurrentAndLegacyRead),
        &aes_materials(),
        None,
    );
    let object = lenient.get_object("old").unwrap();
    assert!(object.is_legacy());
    assert_eq!(object.into_bytes().unwrap(), data);

    // CBC content cannot be decrypted from the middle
    assert!(matches!(
        lenient.get_object_ranged("old", 16, 31),
        Err(ClientError::Crypto(CryptoError::Format { .. }))
    ));

    // New objects from the lenient client are still current
    lenient.put_object("new", &data[..], 100).unwrap();
    assert_eq!(read_object(&strict, "new"), data);
}

/// Write a GCM object whose data key was wrapped by the key service without
/// the content cipher bound into the context (`x-amz-wrap-alg: kms`)
fn put_legacy_kms_object(store: &MemoryObjectStore, service: &dyn KeyWrapService, key: &str, data: &[u8]) {
    use base64::Engine;

    let dek = [0x33u8; 32];
    let iv = [0x09u8; 12];
    let mut context = EncryptionContext::new();
    context.insert("tenant".to_string(), "acme".to_string());
    let blob = service.encrypt("alias/primary", &dek, &context).unwrap();
    let body = s3seal_crypto::gcm::seal(&dek, &iv, b"", data).unwrap();

    let b64 = base64::engine::general_purpose::STANDARD;
    let mut metadata = MetadataMap::new();
    metadata.insert("x-amz-key-v2".to_string(), b64.encode(blob));
    metadata.insert("x-amz-iv".to_string(), b64.encode(iv));
    metadata.insert("x-amz-cek-alg".to_string(), "AES/GCM/NoPadding".to_string());
    metadata.insert("x-amz-tag-len".to_string(), "128".to_string());
    metadata.insert("x-amz-wrap-alg".to_string(), "kms".to_string());
    metadata.insert("x-amz-matdesc".to_string(), r#"{"tenant":"acme"}"#.to_string());
    metadata.insert("x-amz-unencrypted-content-length".to_string(), data.len().to_string());
    store.insert_raw(key, body, metadata);
}

#[test_log::test]
fn test_legacy_kms_object_needs_legacy_profile() {
    let store = MemoryObjectStore::new();
    let service = kms_service();
    let data = plaintext(300);
    put_legacy_kms_object(&store, service.as_ref(), "old-kms", &data);

    let strict = client_with(
        &store,
        ClientConfig::default(),
        &kms_materials("alias/primary"),
        Some(service.clone()),
    );
    let err = strict.get_object("old-kms").unwrap_err();
    match &err {
        ClientError::Crypto(CryptoError::UnsupportedLegacyFormat { identifier }) => {
            assert_eq!(identifier, "kms");
        }
        other => panic!("expected UnsupportedLegacyFormat, got {other:?}"),
    }
    assert_eq!(err.failure_kind(), FailureKind::UnsupportedLegacyFormat);

    let lenient = client_with(
        &store,
        ClientConfig::default().with_security_profile(SecurityProfile::CurrentAndLegacyRead),
        &kms_materials("alias/primary"),
        Some(service.clone()),
    );
    let object = lenient.get_object("old-kms").unwrap();
    assert!(object.is_legacy());
    assert_eq!(object.into_bytes().unwrap(), data);

    // GCM content written under a legacy wrap still supports ranged reads
    let slice = lenient.get_object_range("old-kms", 40, 79).unwrap().into_bytes().unwrap();
    assert_eq!(slice, &data[40..80]);

    let wrong_key = client_with(
        &store,
        ClientConfig::default().with_security_profile(SecurityProfile::CurrentAndLegacyRead),
        &kms_materials("alias/secondary"),
        Some(service),
    );
    assert_eq!(
        wrong_key.get_object("old-kms").unwrap_err().failure_kind(),
        FailureKind::KeyMismatch
    );
}

#[test_log::test]
fn test_multipart_round_trip_across_threads() {
    let store = MemoryObjectStore::new();
    let config = ClientConfig::default().with_part_size(4096);
    let client = client_with(&store, config, &aes_materials(), None);
    let data = plaintext(4096 * 7 + 123);

    let upload = client.initiate_multipart_upload("big.bin", data.len() as u64).unwrap();
    assert_eq!(upload.part_count, 8);
    assert_eq!(client.active_uploads(), 1);

    std::thread::scope(|s| {
        for n in 1..upload.part_count {
            let (client, upload, data) = (&client, &upload, &data);
            s.spawn(move || {
                let (offset, len) = upload.part_range(n, data.len() as u64).unwrap();
                let part = &data[offset as usize..(offset + len) as usize];
                client.upload_part(&upload.upload_id, n, part).unwrap();
            });
        }
    });

    let (offset, _) = upload.part_range(8, data.len() as u64).unwrap();
    client
        .upload_part(&upload.upload_id, 8, &data[offset as usize..])
        .unwrap();
    client.complete_multipart_upload(&upload.upload_id).unwrap();

    assert_eq!(client.active_uploads(), 0);
    assert_eq!(store.pending_uploads(), 0);
    assert_eq!(read_object(&client, "big.bin"), data);
    assert_eq!(
        client.get_object_range("big.bin", 4090, 4200).unwrap().into_bytes().unwrap(),
        &data[4090..=4200]
    );
}

#[test]
fn test_multipart_instruction_written_on_complete() {
    let store = MemoryObjectStore::new();
    let config = ClientConfig::default()
        .with_part_size(32)
        .with_storage_mode(StorageMode::InstructionFile);
    let client = client_with(&store, config, &aes_materials(), None);
    let data = plaintext(40);

    let upload = client.initiate_multipart_upload("k", 40).unwrap();
    client.upload_part(&upload.upload_id, 1, &data[..32]).unwrap();
    client.upload_part(&upload.upload_id, 2, &data[32..]).unwrap();
    assert!(store.raw_object("k.instruction").is_none());

    client.complete_multipart_upload(&upload.upload_id).unwrap();
    assert!(store.raw_object("k.instruction").is_some());
    assert_eq!(read_object(&client, "k"), data);
}

#[test]
fn test_multipart_completion_needs_every_part() {
    let store = MemoryObjectStore::new();
    let client = client_with(&store, ClientConfig::default().with_part_size(16), &aes_materials(), None);
    let upload = client.initiate_multipart_upload("k", 48).unwrap();
    client.upload_part(&upload.upload_id, 2, &[0u8; 16][..]).unwrap();

    match client.complete_multipart_upload(&upload.upload_id) {
        Err(ClientError::Incomplete { missing, .. }) => assert_eq!(missing, vec![1, 3]),
        other => panic!("expected Incomplete, got {:?}", other.map(|_| ())),
    }
    assert!(matches!(
        client.upload_part(&upload.upload_id, 4, &[0u8; 16][..]),
        Err(ClientError::InvalidPart { part_number: 4, .. })
    ));
    assert!(matches!(
        client.upload_part(&upload.upload_id, 3, &[0u8; 16][..]),
        Err(ClientError::PartsOutstanding { .. })
    ));
}

#[test]
fn test_multipart_abort_drops_context() {
    let store = MemoryObjectStore::new();
    let client = client_with(&store, ClientConfig::default().with_part_size(16), &aes_materials(), None);
    let upload = client.initiate_multipart_upload("k", 32).unwrap();
    client.upload_part(&upload.upload_id, 1, &[1u8; 16][..]).unwrap();

    client.abort_multipart_upload(&upload.upload_id).unwrap();
    assert_eq!(client.active_uploads(), 0);
    assert_eq!(store.pending_uploads(), 0);
    assert!(matches!(
        client.upload_part(&upload.upload_id, 2, &[1u8; 16][..]),
        Err(ClientError::UnknownUpload(_))
    ));
    assert!(matches!(
        client.abort_multipart_upload(&upload.upload_id),
        Err(ClientError::UnknownUpload(_))
    ));
}

/// Store that hands out the same upload id every time
struct FixedUploadIdStore(MemoryObjectStore);

impl ObjectStore for FixedUploadIdStore {
    fn put_object(&self, key: &str, body: &mut dyn Read, metadata: MetadataMap) -> anyhow::Result<String> {
        self.0.put_object(key, body, metadata)
    }

    fn get_object(&self, key: &str, range: Option<RequestRange>) -> anyhow::Result<GetObjectOutput> {
        self.0.get_object(key, range)
    }

    fn head_object(&self, key: &str) -> anyhow::Result<MetadataMap> {
        self.0.head_object(key)
    }

    fn initiate_upload(&self, _key: &str, _metadata: MetadataMap) -> anyhow::Result<String> {
        Ok("fixed".to_string())
    }

    fn upload_part(&self, _: &str, _: &str, _: u32, _: &mut dyn Read) -> anyhow::Result<String> {
        anyhow::bail!("not supported")
    }

    fn complete_upload(&self, _: &str, _: &str, _: &[s3seal_client::CompletedPart]) -> anyhow::Result<String> {
        anyhow::bail!("not supported")
    }

    fn abort_upload(&self, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_repeated_upload_id_is_rejected() {
    let client = EncryptedClient::new(
        FixedUploadIdStore(MemoryObjectStore::new()),
        ClientConfig::default(),
        &aes_materials(),
        None,
    )
    .unwrap();

    client.initiate_multipart_upload("a", 10).unwrap();
    assert!(matches!(
        client.initiate_multipart_upload("b", 10),
        Err(ClientError::DuplicateUpload(id)) if id == "fixed"
    ));
    assert_eq!(client.active_uploads(), 1);
}

#[test]
fn test_store_failure_propagates() {
    let client = EncryptedClient::new(
        FixedUploadIdStore(MemoryObjectStore::new()),
        ClientConfig::default(),
        &aes_materials(),
        None,
    )
    .unwrap();
    let upload = client.initiate_multipart_upload("a", 10).unwrap();

    let err = client.upload_part(&upload.upload_id, 1, &[0u8; 10][..]).unwrap_err();
    assert!(matches!(err, ClientError::Store(_)));
    assert_eq!(err.failure_kind(), FailureKind::Transport);

    let err = client.get_object("missing").unwrap_err();
    assert!(err.to_string().contains("NoSuchKey"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_plaintext_range_matches_slice(
        len in 1usize..600,
        a in 0usize..700,
        b in 0usize..700,
    ) {
        let store = MemoryObjectStore::new();
        let client = aes_client(&store);
        let data = plaintext(len);
        client.put_object("k", &data[..], len as u64).unwrap();

        let (start, end) = (a.min(b), a.max(b));
        let out = client
            .get_object_range("k", start as u64, end as u64)
            .unwrap()
            .into_bytes()
            .unwrap();
        let expected: &[u8] = if start >= len { &[] } else { &data[start..=end.min(len - 1)] };
        prop_assert_eq!(out, expected.to_vec());
    }
}
