use futures_util::TryStreamExt;
use serde_json::json;
use strata_core::{
    ConnectionInfo, Credentials, ErrorClass, InjectedFailure, MemoryObjectStore, ObjectBody,
    ObjectStore, S3Client, StorageError,
};

async fn collect(body: ObjectBody) -> Vec<u8> {
    body.try_fold(Vec::new(), |mut data, chunk| async move {
        data.extend_from_slice(&chunk);
        Ok(data)
    })
    .await
    .unwrap()
}

fn connection(endpoint: &str, use_ssl: bool) -> ConnectionInfo {
    ConnectionInfo {
        endpoint: endpoint.to_string(),
        region: None,
        bucket: "photos".to_string(),
        use_ssl,
    }
}

#[test]
fn endpoint_url_follows_tls_flag() {
    let secure = connection("s3.example.com", true).endpoint_url().unwrap();
    assert_eq!(secure.as_str(), "https://s3.example.com/");

    let plain = connection("127.0.0.1:9000", false).endpoint_url().unwrap();
    assert_eq!(plain.as_str(), "http://127.0.0.1:9000/");

    let forced = connection("https://minio.local", false).endpoint_url().unwrap();
    assert_eq!(forced.scheme(), "http");
}

#[test]
fn endpoint_url_rejects_empty_fields() {
    let err = connection("  ", true).endpoint_url().unwrap_err();
    assert!(matches!(err, StorageError::InvalidConnection(_)));

    let mut no_bucket = connection("s3.example.com", true);
    no_bucket.bucket.clear();
    assert!(no_bucket.endpoint_url().is_err());
}

#[test]
fn memory_endpoints_skip_url_validation() {
    let memory = connection("memory://local", true);
    assert!(memory.is_memory());
    memory.validate().unwrap();

    let mut no_bucket = memory.clone();
    no_bucket.bucket = " ".into();
    assert!(no_bucket.validate().is_err());

    assert!(connection("", true).validate().is_err());
}

#[test]
fn connection_defaults_region_and_ssl() {
    let info: ConnectionInfo =
        serde_json::from_value(json!({"endpoint": "s3.example.com", "bucket": "b"})).unwrap();
    assert!(info.use_ssl);
    assert_eq!(info.region_or_default(), "us-east-1");
}

#[test]
fn s3_client_builds_without_network() {
    let creds = Credentials {
        access_key: "AK".into(),
        secret_key: "SK".into(),
    };
    let client = S3Client::new(&connection("127.0.0.1:9000", false), &creds).unwrap();
    assert_eq!(client.bucket(), "photos");
}

#[test]
fn credentials_debug_redacts_secret() {
    let creds = Credentials {
        access_key: "AK".into(),
        secret_key: "super-secret".into(),
    };
    let printed = format!("{creds:?}");
    assert!(printed.contains("AK"));
    assert!(!printed.contains("super-secret"));
}

#[test]
fn error_classification_matches_codes() {
    let slow = StorageError::Rejected {
        code: "SlowDown".into(),
        message: String::new(),
    };
    assert!(slow.is_retryable());

    let denied = StorageError::Rejected {
        code: "AccessDenied".into(),
        message: String::new(),
    };
    assert_eq!(denied.classification(), ErrorClass::Auth);
    assert!(!denied.is_retryable());

    assert!(StorageError::Unreachable("down".into()).is_retryable());
    assert!(!StorageError::NotFound("k".into()).is_retryable());
}

#[tokio::test]
async fn memory_store_lists_by_prefix() {
    let store = MemoryObjectStore::new();
    store.insert_object("docs/a.txt", b"a", 10).await;
    store.insert_object("docs/sub/", b"", 10).await;
    store.insert_object("music/b.mp3", b"bb", 11).await;

    let docs = store.list("docs/").await.unwrap();
    let keys: Vec<_> = docs.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(keys, vec!["docs/a.txt", "docs/sub/"]);
    assert!(docs[1].is_dir);
    assert_eq!(store.list("").await.unwrap().len(), 3);
}

#[tokio::test]
async fn memory_store_round_trips_and_counts_puts() {
    let store = MemoryObjectStore::new();
    let info = store.put("a.txt", b"hello".to_vec()).await.unwrap();
    assert_eq!(info.size, 5);
    assert_eq!(
        info.etag.as_deref(),
        Some("5d41402abc4b2a76b9719d911017c592")
    );
    assert_eq!(collect(store.get("a.txt").await.unwrap()).await, b"hello");
    assert_eq!(store.put_count("a.txt").await, 1);

    store.delete("a.txt").await.unwrap();
    assert!(store.head("a.txt").await.unwrap().is_none());
    assert!(matches!(
        store.get("a.txt").await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn large_objects_stream_in_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.bin");
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &payload).unwrap();

    let store = MemoryObjectStore::new();
    let info = store.put_file("big.bin", &path, 4096).await.unwrap();
    assert_eq!(info.size, 300_000);
    assert_eq!(store.put_count("big.bin").await, 1);

    let chunks: Vec<_> = store
        .get("big.bin")
        .await
        .unwrap()
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|chunk| chunk.len() <= 64 * 1024));
    let joined: Vec<u8> = chunks.concat();
    assert_eq!(joined, payload);

    let missing = store
        .put_file("gone.bin", &dir.path().join("gone.bin"), 4096)
        .await
        .unwrap_err();
    assert!(matches!(missing, StorageError::Local(_)));
    assert!(!missing.is_retryable());
}

#[tokio::test]
async fn memory_store_injects_failures() {
    let store = MemoryObjectStore::new();
    store.fail_next(1, InjectedFailure::Transient).await;
    let err = store.put("a", vec![1]).await.unwrap_err();
    assert!(err.is_retryable());
    store.put("a", vec![1]).await.unwrap();

    store.set_unreachable(true).await;
    assert!(matches!(
        store.list("").await,
        Err(StorageError::Unreachable(_))
    ));
}
