use std::path::Path;
use std::sync::Arc;

use regatta::{
    BlobSource, Client, Context, Descriptor, Digest, ErrorKind, ImageIndex, ImageManifest,
    Manifest, MemFs, OciDirScheme, OsFs, Reference, ANNOTATION_REF_NAME, DOCKER2_MANIFEST,
    OCI1_MANIFEST,
};

const MANIFEST_BODY: &str = r#"{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7",
    "size": 7023
  },
  "layers": [
    {
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
      "size": 32654
    }
  ]
}"#;

fn mem_client() -> (Client, Arc<MemFs>) {
    let fs = Arc::new(MemFs::new());
    let client = Client::builder().with_fs(fs.clone()).build();
    (client, fs)
}

fn layout_ref(tag: &str) -> Reference {
    Reference::parse(format!("ocidir://images/layout:{tag}")).expect("should parse")
}

fn sample_manifest() -> Manifest {
    Manifest::from_bytes(DOCKER2_MANIFEST, MANIFEST_BODY.as_bytes().to_vec())
        .expect("should parse")
}

#[tokio::test]
async fn test_manifest_write_read_roundtrip() {
    let (client, fs) = mem_client();
    let ctx = Context::background();
    let manifest = sample_manifest();

    client
        .manifest_put(&ctx, &layout_ref("v1"), &manifest)
        .await
        .expect("should store");

    let loaded = client
        .manifest_get(&ctx, &layout_ref("v1"))
        .await
        .expect("should load");
    assert_eq!(
        loaded.to_bytes().expect("should marshal"),
        MANIFEST_BODY.as_bytes(),
        "raw bytes come back unchanged"
    );
    assert_eq!(loaded.digest(), manifest.digest());

    // the blob is on disk under its digest
    let blob_path = format!(
        "images/layout/blobs/sha256/{}",
        manifest.digest().hex()
    );
    assert!(
        fs.paths().iter().any(|p| p == Path::new(&blob_path)),
        "missing {blob_path} in {:?}",
        fs.paths()
    );

    // index.json holds exactly one row annotated with the tag
    let index = read_index(&fs).await;
    assert_eq!(index.manifests.len(), 1);
    assert_eq!(
        index.manifests[0]
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str),
        Some("v1")
    );
}

async fn read_index(fs: &MemFs) -> ImageIndex {
    use regatta::RwFs;
    let (mut reader, _) = fs
        .open(Path::new("images/layout/index.json"))
        .await
        .expect("index should exist");
    let mut buf = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
        .await
        .expect("should read");
    serde_json::from_slice(&buf).expect("index should parse")
}

#[tokio::test]
async fn test_manifest_put_is_idempotent() {
    let (client, fs) = mem_client();
    let ctx = Context::background();
    let manifest = sample_manifest();

    for _ in 0..3 {
        client
            .manifest_put(&ctx, &layout_ref("v1"), &manifest)
            .await
            .expect("should store");
    }

    let index = read_index(&fs).await;
    assert_eq!(index.manifests.len(), 1, "re-pushing never duplicates rows");
}

#[tokio::test]
async fn test_retag_replaces_and_both_tags_resolve() {
    let (client, fs) = mem_client();
    let ctx = Context::background();
    let manifest = sample_manifest();

    client
        .manifest_put(&ctx, &layout_ref("v1"), &manifest)
        .await
        .expect("should store");
    client
        .manifest_put(&ctx, &layout_ref("v2"), &manifest)
        .await
        .expect("should store");

    let tags = client
        .tag_list(&ctx, &layout_ref("v1"))
        .await
        .expect("should list");
    assert_eq!(tags, vec!["v1", "v2"]);

    let index = read_index(&fs).await;
    assert_eq!(index.manifests.len(), 2, "same digest, two tag rows");
}

#[tokio::test]
async fn test_blob_roundtrip_and_mismatch() {
    let (client, fs) = mem_client();
    let ctx = Context::background();
    let r = layout_ref("v1");
    let data = b"layer bytes".to_vec();

    let (digest, length) = client
        .blob_put(&ctx, &r, None, BlobSource::from_bytes(data.clone()))
        .await
        .expect("should store");
    assert_eq!(length, data.len() as u64);
    assert_eq!(digest, Digest::canonical(&data));

    assert_eq!(
        client.blob_head(&ctx, &r, &digest).await.expect("should exist"),
        data.len() as u64
    );
    let body = client
        .blob_get(&ctx, &r, &digest)
        .await
        .expect("should open")
        .read_to_end()
        .await
        .expect("should verify");
    assert_eq!(body, data);

    // a caller-supplied digest that disagrees leaves nothing behind
    let wrong = Digest::canonical(b"other");
    let err = client
        .blob_put(&ctx, &r, Some(wrong), BlobSource::from_bytes(data))
        .await
        .expect_err("should reject");
    assert!(err.is(ErrorKind::DigestMismatch));
    assert!(
        !fs.paths().iter().any(|p| p.to_string_lossy().contains(".tmp-")),
        "no temp files survive a failed put, {:?}",
        fs.paths()
    );
}

#[tokio::test]
async fn test_reads_require_a_valid_layout() {
    let (client, fs) = mem_client();
    let ctx = Context::background();
    let digest = Digest::canonical(b"data");

    let err = client
        .blob_get(&ctx, &layout_ref("v1"), &digest)
        .await
        .expect_err("no layout yet");
    assert!(err.is(ErrorKind::InvalidLayout), "{err}");

    // a wrong version string is rejected too
    {
        use regatta::RwFs;
        use tokio::io::AsyncWriteExt;
        let mut writer = fs
            .create(Path::new("images/layout/oci-layout"))
            .await
            .expect("should create");
        writer
            .write_all(br#"{"imageLayoutVersion":"2.0.0"}"#)
            .await
            .expect("should write");
        writer.shutdown().await.expect("should commit");
    }
    let err = client
        .blob_get(&ctx, &layout_ref("v1"), &digest)
        .await
        .expect_err("unsupported version");
    assert!(err.is(ErrorKind::InvalidLayout), "{err}");
}

#[tokio::test]
async fn test_manifest_delete_keeps_blob_until_gc() {
    let fs = Arc::new(MemFs::new());
    let scheme = OciDirScheme::new(fs.clone());
    let ctx = Context::background();
    let manifest = sample_manifest();
    let r = layout_ref("v1");

    use regatta::Scheme;
    scheme
        .manifest_put(&ctx, &r, &manifest)
        .await
        .expect("should store");
    scheme
        .manifest_delete(&ctx, &r)
        .await
        .expect("should delete");

    let err = scheme
        .manifest_get(&ctx, &r)
        .await
        .expect_err("tag is gone");
    assert!(err.is(ErrorKind::NotFound));

    let blob_path = format!("images/layout/blobs/sha256/{}", manifest.digest().hex());
    assert!(
        fs.paths().iter().any(|p| p == Path::new(&blob_path)),
        "delete leaves the blob for the sweep"
    );

    let removed = scheme.gc(&ctx, &r).await.expect("should sweep");
    assert_eq!(removed, 1);
    assert!(
        !fs.paths().iter().any(|p| p == Path::new(&blob_path)),
        "the sweep removed the unreferenced manifest blob"
    );

    assert!(
        !scheme.modified_refs().is_empty(),
        "mutations are recorded for the collector"
    );
}

#[tokio::test]
async fn test_gc_descends_into_referenced_manifests() {
    let fs = Arc::new(MemFs::new());
    let scheme = OciDirScheme::new(fs.clone());
    let ctx = Context::background();
    let r = layout_ref("v1");

    use regatta::Scheme;
    // store the config and layer blobs the manifest references
    let config = b"{\"architecture\":\"amd64\",\"os\":\"linux\"}".to_vec();
    let (config_digest, config_len) = scheme
        .blob_put(&ctx, &r, None, BlobSource::from_bytes(config))
        .await
        .expect("should store");
    let (layer_digest, layer_len) = scheme
        .blob_put(&ctx, &r, None, BlobSource::from_bytes(b"layer".to_vec()))
        .await
        .expect("should store");
    // and one orphan nothing references
    let (orphan_digest, _) = scheme
        .blob_put(&ctx, &r, None, BlobSource::from_bytes(b"orphan".to_vec()))
        .await
        .expect("should store");

    let manifest = Manifest::from_image(ImageManifest {
        schema_version: 2,
        media_type: OCI1_MANIFEST.to_string(),
        config: Descriptor::new(
            "application/vnd.oci.image.config.v1+json",
            config_digest.to_string(),
            config_len,
        ),
        layers: vec![Descriptor::new(
            "application/vnd.oci.image.layer.v1.tar+gzip",
            layer_digest.to_string(),
            layer_len,
        )],
        annotations: None,
    })
    .expect("should build");
    scheme
        .manifest_put(&ctx, &r, &manifest)
        .await
        .expect("should store");

    let removed = scheme.gc(&ctx, &r).await.expect("should sweep");
    assert_eq!(removed, 1, "only the orphan goes");

    let orphan_path = format!("images/layout/blobs/sha256/{}", orphan_digest.hex());
    assert!(!fs.paths().iter().any(|p| p == Path::new(&orphan_path)));
    let layer_path = format!("images/layout/blobs/sha256/{}", layer_digest.hex());
    assert!(fs.paths().iter().any(|p| p == Path::new(&layer_path)));
}

#[tokio::test]
async fn test_concurrent_tag_writes_serialize() {
    let fs = Arc::new(MemFs::new());
    let scheme = Arc::new(OciDirScheme::new(fs.clone()));
    let ctx = Context::background();
    let manifest = sample_manifest();

    // seed the layout so the racers only contend on index.json
    use regatta::Scheme;
    scheme
        .manifest_put(&ctx, &layout_ref("seed"), &manifest)
        .await
        .expect("should store");

    let mut tasks = vec![];
    for i in 0..8 {
        let scheme = scheme.clone();
        let manifest = manifest.clone();
        tasks.push(tokio::spawn(async move {
            let r = layout_ref(&format!("tag-{i}"));
            scheme
                .manifest_put(&Context::background(), &r, &manifest)
                .await
        }));
    }
    for task in tasks {
        task.await.expect("should join").expect("should store");
    }

    let tags = scheme
        .tag_list(&ctx, &layout_ref("seed"))
        .await
        .expect("should list");
    assert_eq!(tags.len(), 9, "every racer's tag landed, {tags:?}");
}

#[tokio::test]
async fn test_canceled_put_removes_temp_files() {
    let fs = Arc::new(MemFs::new());
    let scheme = OciDirScheme::new(fs.clone());
    let (ctx, cancel) = Context::background().with_cancel();
    cancel.cancel();

    use regatta::Scheme;
    let err = scheme
        .blob_put(
            &ctx,
            &layout_ref("v1"),
            None,
            BlobSource::from_bytes(b"data".to_vec()),
        )
        .await
        .expect_err("canceled before write");
    assert!(err.is(ErrorKind::Canceled));
    assert!(
        !fs.paths().iter().any(|p| p.to_string_lossy().contains(".tmp-")),
        "{:?}",
        fs.paths()
    );
}

#[tokio::test]
async fn test_layout_on_real_filesystem() {
    let dir = tempfile::tempdir().expect("should create");
    let root = dir.path().join("layout");
    let client = Client::builder().with_fs(Arc::new(OsFs)).build();
    let ctx = Context::background();
    let r = Reference::parse(format!("ocidir://{}:v1", root.display())).expect("should parse");

    let manifest = sample_manifest();
    client
        .manifest_put(&ctx, &r, &manifest)
        .await
        .expect("should store");

    assert!(root.join("oci-layout").is_file());
    assert!(root.join("index.json").is_file());
    assert!(root
        .join("blobs/sha256")
        .join(manifest.digest().hex())
        .is_file());

    let loaded = client.manifest_get(&ctx, &r).await.expect("should load");
    assert_eq!(
        loaded.to_bytes().expect("should marshal"),
        MANIFEST_BODY.as_bytes()
    );
}
