//! Client-side envelope encryption example
//!
//! This example demonstrates:
//! - Uploading an object encrypted under a KMS-wrapped data key
//! - Inspecting what the storage service actually holds
//! - Whole-object and ranged downloads
//! - A multipart upload with parts encrypted on several threads
//!
//! Run with: RUST_LOG=s3seal_client=debug cargo run -p s3seal-client --example envelope_demo

use s3seal_client::{
    ClientConfig, EncryptedClient, EncryptionContext, EncryptionMaterials, KeyWrapService,
    MemoryKeyWrapService, MemoryObjectStore, StorageMode,
};
use std::io::Read;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "s3seal_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("s3seal - client-side envelope encryption\n");

    // ==================== Key Management ====================

    let kms: Arc<dyn KeyWrapService> = Arc::new(MemoryKeyWrapService::new().with_key("alias/demo"));
    let mut context = EncryptionContext::new();
    context.insert("department".to_string(), "finance".to_string());
    let materials = EncryptionMaterials::kms("alias/demo", context);

    let store = MemoryObjectStore::new();
    let config = ClientConfig::load(None)?.with_part_size(64 * 1024);
    let client = EncryptedClient::new(store.clone(), config, &materials, Some(kms))?;

    // ==================== Upload ====================

    let report = b"Q3 revenue: 4.2M\nQ3 costs: 3.9M\nQ3 margin: 0.3M\n".repeat(20);
    let output = client.put_object("reports/q3.txt", &report[..], report.len() as u64)?;
    println!("Uploaded reports/q3.txt (etag {})", output.etag);

    let (stored, metadata) = store
        .raw_object("reports/q3.txt")
        .ok_or_else(|| anyhow::anyhow!("object missing from store"))?;
    println!("   Stored bytes: {} ({} plaintext + tag)", stored.len(), report.len());
    for (name, value) in &metadata {
        println!("   {}: {}", name, value);
    }

    // ==================== Download ====================

    let mut text = String::new();
    client.get_object("reports/q3.txt")?.read_to_string(&mut text)?;
    println!("\nDecrypted {} bytes, first line: {:?}", text.len(), text.lines().next());

    let slice = client.get_object_range("reports/q3.txt", 17, 31)?.into_bytes()?;
    println!("Plaintext bytes 17..=31: {:?}", String::from_utf8_lossy(&slice));

    // ==================== Multipart ====================

    let sidecar = EncryptedClient::new(
        store.clone(),
        client.config().clone().with_storage_mode(StorageMode::InstructionFile),
        &EncryptionMaterials::aes(s3seal_client::AesKek::generate(s3seal_client::KeyLength::Aes256)),
        None,
    )?;
    let archive: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let upload = sidecar.initiate_multipart_upload("archive.bin", archive.len() as u64)?;
    println!("\nMultipart upload {} in {} parts", upload.upload_id, upload.part_count);

    std::thread::scope(|s| -> anyhow::Result<()> {
        let handles: Vec<_> = (1..upload.part_count)
            .map(|n| {
                let (sidecar, upload, archive) = (&sidecar, &upload, &archive);
                s.spawn(move || -> anyhow::Result<()> {
                    if let Some((offset, len)) = upload.part_range(n, archive.len() as u64) {
                        let part = &archive[offset as usize..(offset + len) as usize];
                        sidecar.upload_part(&upload.upload_id, n, part)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("part upload thread panicked"))??;
        }
        Ok(())
    })?;

    if let Some((offset, _)) = upload.part_range(upload.part_count, archive.len() as u64) {
        sidecar.upload_part(&upload.upload_id, upload.part_count, &archive[offset as usize..])?;
    }
    sidecar.complete_multipart_upload(&upload.upload_id)?;

    let restored = sidecar.get_object("archive.bin")?.into_bytes()?;
    println!(
        "Restored archive.bin: {} bytes, matches original: {}",
        restored.len(),
        restored == archive
    );
    println!(
        "Envelope stored in sidecar: {}",
        store.raw_object("archive.bin.instruction").is_some()
    );

    Ok(())
}
