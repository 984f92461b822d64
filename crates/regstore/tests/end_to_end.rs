//! End-to-end scenarios through the public [`Registry`] facade.
//!
//! Each test opens a registry on a fresh temporary root and drives it the way
//! a distribution endpoint would: uploads, manifest pushes, deletes and
//! garbage collection.

use std::{
    io::{Error, ErrorKind},
    time::Duration,
};

use proptest::prelude::*;
use similar_asserts::assert_eq;
use tokio::io::AsyncReadExt;

use regstore::{
    test::{image_manifest, TestRegistry},
    Digest, GcOptions, GcTarget, Reclaimed, Registry, RepositoryName, StoreError,
};

const HELLO_WORLD: &str = "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

async fn push(registry: &Registry, name: &str, content: &[u8]) -> Digest {
    let digest = Digest::sha256(content);
    registry
        .monolithic_upload(name, &digest.to_string(), &mut &content[..])
        .await
        .unwrap()
}

#[tokio::test]
async fn test_chunked_hello_world() {
    let test = TestRegistry::new();
    let registry = test.open();

    let upload = registry.start_upload("library/hello").await.unwrap();
    assert_eq!(upload.offset, 0);
    let offset = registry
        .append_chunk("library/hello", &upload.id, &mut &b"hello "[..])
        .await
        .unwrap();
    assert_eq!(offset, 6);
    let offset = registry
        .append_chunk("library/hello", &upload.id, &mut &b"world"[..])
        .await
        .unwrap();
    assert_eq!(offset, 11);
    assert_eq!(
        registry
            .upload_status("library/hello", &upload.id)
            .await
            .unwrap(),
        11
    );

    let digest = registry
        .finalize_upload("library/hello", &upload.id, HELLO_WORLD)
        .await
        .unwrap();
    assert_eq!(digest.to_string(), HELLO_WORLD);

    let info = registry.check_blob("library/hello", HELLO_WORLD).await.unwrap();
    assert_eq!(info.size, 11);
    let mut reader = registry.fetch_blob("library/hello", HELLO_WORLD).await.unwrap();
    let mut content = String::new();
    reader.read_to_string(&mut content).await.unwrap();
    assert_eq!(content, "hello world");

    // the session is spent
    assert!(matches!(
        registry
            .append_chunk("library/hello", &upload.id, &mut &b"!"[..])
            .await,
        Err(StoreError::UploadUnknown { .. })
    ));
    // and the blob is not visible anywhere else
    assert!(matches!(
        registry.check_blob("library/other", HELLO_WORLD).await,
        Err(StoreError::BlobUnknown { .. })
    ));
}

#[tokio::test]
async fn test_monolithic_mismatch() {
    let test = TestRegistry::new();
    let registry = test.open();
    let claimed = Digest::sha256(b"expected");

    let err = registry
        .monolithic_upload("app", &claimed.to_string(), &mut &b"actual"[..])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DIGEST_INVALID");
    assert!(matches!(
        registry.check_blob("app", &claimed.to_string()).await,
        Err(StoreError::BlobUnknown { .. })
    ));
}

#[tokio::test]
async fn test_manifest_with_absent_blob_is_rejected() {
    let test = TestRegistry::new();
    let registry = test.open();
    let config = push(&registry, "app", b"{}").await;
    let absent = Digest::sha256(b"never pushed");

    let err = registry
        .put_manifest("app", "v1", &image_manifest(&config, &[&absent]), None)
        .await
        .unwrap_err();
    assert!(matches!(&err, StoreError::ManifestBlobUnknown { digest, .. } if *digest == absent));
    assert_eq!(err.code(), "MANIFEST_BLOB_UNKNOWN");
    assert!(matches!(
        registry.fetch_manifest("app", "v1").await,
        Err(StoreError::ManifestUnknown { .. })
    ));
}

#[tokio::test]
async fn test_manifest_dual_addressing_and_retag() {
    let test = TestRegistry::new();
    let registry = test.open();
    let config = push(&registry, "app", b"{}").await;
    let layer1 = push(&registry, "app", b"layer one").await;
    let layer2 = push(&registry, "app", b"layer two").await;

    let first = registry
        .put_manifest("app", "latest", &image_manifest(&config, &[&layer1]), None)
        .await
        .unwrap();
    let by_digest = registry
        .fetch_manifest("app", &first.to_string())
        .await
        .unwrap();
    let by_tag = registry.fetch_manifest("app", "latest").await.unwrap();
    assert_eq!(by_digest, by_tag);

    let second = registry
        .put_manifest("app", "latest", &image_manifest(&config, &[&layer2]), None)
        .await
        .unwrap();
    assert_eq!(
        registry.fetch_manifest("app", "latest").await.unwrap().digest,
        second
    );
    // the old revision stays addressable by digest
    registry
        .fetch_manifest("app", &first.to_string())
        .await
        .unwrap();
    assert_eq!(registry.list_tags("app").await.unwrap().tags, vec!["latest".to_string()]);
}

#[tokio::test]
async fn test_gc_reclaims_exactly_unreferenced() {
    let test = TestRegistry::new();
    let registry = test.open();
    let config = push(&registry, "app", b"{}").await;
    let kept = push(&registry, "app", b"kept layer").await;
    let dropped = push(&registry, "app", b"dropped layer").await;
    let manifest_digest = registry
        .put_manifest("app", "v1", &image_manifest(&config, &[&kept, &dropped]), None)
        .await
        .unwrap();
    registry
        .put_manifest("app", "v2", &image_manifest(&config, &[&kept]), None)
        .await
        .unwrap();
    // an unrelated repository holding the same content is untouched
    let elsewhere = push(&registry, "other", b"dropped layer").await;
    registry
        .put_manifest("other", "v1", &image_manifest(&elsewhere, &[]), None)
        .await
        .unwrap();

    let report = registry.run_gc(GcTarget::All, GcOptions::default()).await;
    assert!(report.reclaimed.is_empty(), "{:?}", report.reclaimed);

    registry
        .delete_manifest("app", &manifest_digest.to_string())
        .await
        .unwrap();
    assert!(matches!(
        registry.fetch_manifest("app", "v1").await,
        Err(StoreError::ManifestUnknown { .. })
    ));

    let preview = registry
        .run_gc(GcTarget::All, GcOptions { dry_run: true })
        .await;
    assert!(preview.dry_run);
    assert_eq!(preview.blobs_removed(), 1);
    registry
        .check_blob("app", &dropped.to_string())
        .await
        .unwrap();

    let report = registry.run_gc(GcTarget::All, GcOptions::default()).await;
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(
        report.reclaimed,
        vec![Reclaimed::Blob {
            repository: RepositoryName::parse("app").unwrap(),
            digest: dropped.clone(),
            size: 13,
        }]
    );
    assert!(matches!(
        registry.check_blob("app", &dropped.to_string()).await,
        Err(StoreError::BlobUnknown { .. })
    ));
    registry.check_blob("app", &kept.to_string()).await.unwrap();
    registry
        .check_blob("other", &elsewhere.to_string())
        .await
        .unwrap();

    // collecting again is a no-op
    let again = registry.run_gc(GcTarget::All, GcOptions::default()).await;
    assert!(again.reclaimed.is_empty());
}

#[tokio::test]
async fn test_gc_sweeps_only_stale_sessions() {
    let test = TestRegistry::new();
    let registry = test.open();
    let old = registry.start_upload("app").await.unwrap();
    registry
        .append_chunk("app", &old.id, &mut &b"abandoned"[..])
        .await
        .unwrap();
    let young = registry.start_upload("app").await.unwrap();

    let name = RepositoryName::parse("app").unwrap();
    let ns = registry.layout().namespace(&name);
    test.backdate(
        &ns.upload_dir(&old.id).join("data"),
        Duration::from_secs(2 * 3600),
    );

    let report = registry
        .run_gc(GcTarget::Repository(name), GcOptions::default())
        .await;
    assert_eq!(report.uploads_removed(), 1);
    assert_eq!(report.bytes_reclaimed, 9);
    assert!(matches!(
        registry.upload_status("app", &old.id).await,
        Err(StoreError::UploadUnknown { .. })
    ));
    assert_eq!(registry.upload_status("app", &young.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_append_leaves_offset() {
    let test = TestRegistry::new();
    let registry = test.open();
    let upload = registry.start_upload("app").await.unwrap();
    registry
        .append_chunk("app", &upload.id, &mut &b"hello "[..])
        .await
        .unwrap();

    let mut broken = tokio_test::io::Builder::new()
        .read(b"wor")
        .read_error(Error::new(ErrorKind::ConnectionReset, "client went away"))
        .build();
    let err = registry
        .append_chunk("app", &upload.id, &mut broken)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Stream(_)));
    assert_eq!(registry.upload_status("app", &upload.id).await.unwrap(), 6);

    registry
        .append_chunk("app", &upload.id, &mut &b"world"[..])
        .await
        .unwrap();
    registry
        .finalize_upload("app", &upload.id, HELLO_WORLD)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let test = TestRegistry::new();
    let (upload, manifest_digest) = {
        let registry = test.open();
        let config = push(&registry, "app", b"{}").await;
        let digest = registry
            .put_manifest("app", "v1", &image_manifest(&config, &[]), None)
            .await
            .unwrap();
        let upload = registry.start_upload("app").await.unwrap();
        registry
            .append_chunk("app", &upload.id, &mut &b"hello "[..])
            .await
            .unwrap();
        (upload, digest)
    };

    let registry = test.open();
    assert_eq!(registry.upload_status("app", &upload.id).await.unwrap(), 6);
    registry
        .append_chunk("app", &upload.id, &mut &b"world"[..])
        .await
        .unwrap();
    registry
        .finalize_upload("app", &upload.id, HELLO_WORLD)
        .await
        .unwrap();
    assert_eq!(
        registry.fetch_manifest("app", "v1").await.unwrap().digest,
        manifest_digest
    );
    assert_eq!(
        registry.list_repositories(None, None).await.unwrap(),
        vec!["app".to_string()]
    );
}

#[tokio::test]
async fn test_locked_root() {
    let test = TestRegistry::new();
    let _registry = test.open();
    let err = Registry::open(test.config()).unwrap_err();
    assert!(matches!(err, StoreError::StorageLocked(_)));
}

#[tokio::test]
async fn test_catalog_pagination() {
    let test = TestRegistry::new();
    let registry = test.open();
    for name in ["charlie", "alpha", "bravo/x", "bravo"] {
        registry.start_upload(name).await.unwrap();
    }
    assert_eq!(
        registry.list_repositories(Some(2), None).await.unwrap(),
        vec!["alpha".to_string(), "bravo".to_string()]
    );
    assert_eq!(
        registry
            .list_repositories(Some(2), Some("bravo"))
            .await
            .unwrap(),
        vec!["bravo/x".to_string(), "charlie".to_string()]
    );
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let test = TestRegistry::new();
    let registry = test.open();
    let first = registry.start_upload("app").await.unwrap();
    let second = registry.start_upload("app").await.unwrap();
    assert_ne!(first.id, second.id);

    for (id, chunk) in [
        (&first.id, &b"hello "[..]),
        (&second.id, &b"goodbye "[..]),
        (&first.id, &b"world"[..]),
        (&second.id, &b"moon"[..]),
    ] {
        registry.append_chunk("app", id, &mut &*chunk).await.unwrap();
    }
    assert_eq!(registry.upload_status("app", &first.id).await.unwrap(), 11);
    assert_eq!(registry.upload_status("app", &second.id).await.unwrap(), 12);

    let goodbye = Digest::sha256(b"goodbye moon");
    registry
        .finalize_upload("app", &second.id, &goodbye.to_string())
        .await
        .unwrap();
    registry
        .finalize_upload("app", &first.id, HELLO_WORLD)
        .await
        .unwrap();

    for (digest, expected) in [
        (HELLO_WORLD.to_string(), "hello world"),
        (goodbye.to_string(), "goodbye moon"),
    ] {
        let mut reader = registry.fetch_blob("app", &digest).await.unwrap();
        let mut content = String::new();
        reader.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, expected);
    }
}

#[tokio::test]
async fn test_gc_keeps_foreign_layers() {
    let test = TestRegistry::new();
    let registry = test.open();
    let config = push(&registry, "app", b"{}").await;
    let layer = push(&registry, "app", b"nondistributable layer").await;
    let doc = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config.to_string(),
            "size": 2,
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip",
            "digest": layer.to_string(),
            "size": 22,
            "urls": ["https://example.com/layer.tar.gz"],
        }],
    }))
    .unwrap();
    registry.put_manifest("app", "v1", &doc, None).await.unwrap();

    let report = registry.run_gc(GcTarget::All, GcOptions::default()).await;
    assert!(report.reclaimed.is_empty(), "{:?}", report.reclaimed);
    registry.check_blob("app", &layer.to_string()).await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_any_chunking_yields_same_blob(
        content in proptest::collection::vec(any::<u8>(), 0..4096),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let mut cuts: Vec<usize> = cuts.iter().map(|i| i.index(content.len() + 1)).collect();
        cuts.sort_unstable();
        let digest = Digest::sha256(&content);

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let stored = rt.block_on(async {
            let test = TestRegistry::new();
            let registry = test.open();
            let upload = registry.start_upload("prop").await.unwrap();
            let mut start = 0;
            for end in cuts.into_iter().chain([content.len()]) {
                let offset = registry
                    .append_chunk("prop", &upload.id, &mut &content[start..end])
                    .await
                    .unwrap();
                prop_assert_eq!(offset, end as u64);
                start = end;
            }
            let stored = registry
                .finalize_upload("prop", &upload.id, &digest.to_string())
                .await
                .unwrap();
            let mut reader = registry.fetch_blob("prop", &stored.to_string()).await.unwrap();
            let mut read_back = Vec::new();
            reader.read_to_end(&mut read_back).await.unwrap();
            prop_assert_eq!(&read_back, &content);
            Ok(stored)
        })?;
        prop_assert_eq!(stored, digest);
    }
}
