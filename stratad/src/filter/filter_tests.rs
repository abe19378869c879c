use std::sync::Arc;

use strata_core::ConnectionInfo;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::store::{FileInput, FileRecord, MetadataStore, NewBackend};

async fn store_with_backends(ids: &[&str]) -> Arc<MetadataStore> {
    let store = Arc::new(MetadataStore::in_memory().await.unwrap());
    for id in ids {
        store
            .create_backend(&NewBackend {
                id: id.to_string(),
                name: id.to_string(),
                connection: ConnectionInfo {
                    endpoint: "memory://test".into(),
                    region: None,
                    bucket: "b".into(),
                    use_ssl: false,
                },
                access_key_enc: "v1:a".into(),
                secret_key_enc: "v1:s".into(),
            })
            .await
            .unwrap();
    }
    store
}

async fn put_file(store: &MetadataStore, backend: &str, path: &str, size: i64, modified: i64) -> i64 {
    store
        .upsert_file(&FileInput {
            backend_id: backend.into(),
            path: path.into(),
            size,
            md5: None,
            sha256: None,
            etag: None,
            modified_at: modified,
            is_dir: false,
        })
        .await
        .unwrap()
        .id
}

fn paths(files: &[FileRecord]) -> Vec<String> {
    files
        .iter()
        .map(|file| format!("{}/{}", file.backend_id, file.path))
        .collect()
}

async fn run(engine: &FilterEngine, query: &str) -> Vec<String> {
    paths(
        &engine
            .evaluate_query(query, &CancellationToken::new())
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn tagged_file_appears_and_disappears_from_its_filter() {
    let store = store_with_backends(&["selfhosted"]).await;
    let engine = FilterEngine::new(store.clone());
    let pic = put_file(&store, "selfhosted", "pic.jpg", 10, 0).await;
    let filter = engine
        .create_filter(FilterSpec {
            virtual_path: "filters/pictures/red".into(),
            name: None,
            query: "tag:colour=red".into(),
            description: None,
        })
        .await
        .unwrap();
    assert_eq!(filter.virtual_path, "pictures/red");
    let cancel = CancellationToken::new();
    assert!(engine.evaluate_filter(&filter, &cancel).await.unwrap().is_empty());

    store.add_tag(pic, "colour", "red").await.unwrap();
    assert_eq!(
        paths(&engine.evaluate_filter(&filter, &cancel).await.unwrap()),
        vec!["selfhosted/pic.jpg"]
    );

    store.remove_tag(pic, "colour", None).await.unwrap();
    assert!(engine.evaluate_filter(&filter, &cancel).await.unwrap().is_empty());
}

#[tokio::test]
async fn conjunction_requires_every_tag() {
    let store = store_with_backends(&["b"]).await;
    let engine = FilterEngine::new(store.clone());
    let only_red = put_file(&store, "b", "only-red.jpg", 1, 0).await;
    let both = put_file(&store, "b", "both.jpg", 1, 0).await;
    store.add_tag(only_red, "colour", "red").await.unwrap();
    store.add_tag(both, "colour", "red").await.unwrap();
    store.add_tag(both, "event", "vacation").await.unwrap();

    assert_eq!(
        run(&engine, "tag:colour=red AND tag:event=vacation").await,
        vec!["b/both.jpg"]
    );
    assert_eq!(
        run(&engine, "tag:colour=red AND NOT tag:event=vacation").await,
        vec!["b/only-red.jpg"]
    );
    assert_eq!(
        run(&engine, "tag:event=vacation OR tag:colour=red").await,
        vec!["b/both.jpg", "b/only-red.jpg"]
    );
}

#[tokio::test]
async fn multi_valued_tags_and_numeric_comparison() {
    let store = store_with_backends(&["b"]).await;
    let engine = FilterEngine::new(store.clone());
    let a = put_file(&store, "b", "a", 1, 0).await;
    let c = put_file(&store, "b", "c", 1, 0).await;
    let d = put_file(&store, "b", "d", 1, 0).await;
    store.add_tag(a, "rating", "10").await.unwrap();
    store.add_tag(c, "rating", "9").await.unwrap();
    store.add_tag(d, "rating", "high").await.unwrap();
    store.add_tag(a, "person", "ana").await.unwrap();
    store.add_tag(a, "person", "bo").await.unwrap();

    // 10 > 9 numerically; "high" > "9" as text
    assert_eq!(run(&engine, "tag:rating>9").await, vec!["b/a", "b/d"]);
    assert_eq!(run(&engine, "tag:rating<=9").await, vec!["b/c"]);
    assert_eq!(run(&engine, "tag:person=bo").await, vec!["b/a"]);
}

#[tokio::test]
async fn attribute_predicates_match_file_fields() {
    let store = store_with_backends(&["b1", "b2"]).await;
    let engine = FilterEngine::new(store.clone());
    put_file(&store, "b1", "photos/a.jpg", 20_000_000, 1_704_067_200).await;
    put_file(&store, "b1", "docs/readme.txt", 100, 1_600_000_000).await;
    put_file(&store, "b2", "photos/b.png", 5_000, 1_710_000_000).await;

    assert_eq!(
        run(&engine, "mime_type:image/*").await,
        vec!["b1/photos/a.jpg", "b2/photos/b.png"]
    );
    assert_eq!(run(&engine, "size>10MB").await, vec!["b1/photos/a.jpg"]);
    assert_eq!(
        run(&engine, "modified_time<2024-01-01").await,
        vec!["b1/docs/readme.txt"]
    );
    assert_eq!(
        run(&engine, "path:photos/*").await,
        vec!["b1/photos/a.jpg", "b2/photos/b.png"]
    );
    assert_eq!(
        run(&engine, "backend:b2").await,
        vec!["b2/photos/b.png"]
    );
    assert_eq!(
        run(&engine, "NOT backend:b1").await,
        vec!["b2/photos/b.png"]
    );
    assert_eq!(
        run(&engine, "modified_time>now-1d").await,
        Vec::<String>::new()
    );
}

#[tokio::test]
async fn unknown_backend_matches_nothing() {
    let store = store_with_backends(&["b"]).await;
    let engine = FilterEngine::new(store.clone());
    put_file(&store, "b", "a", 1, 0).await;
    assert!(run(&engine, "backend:ghost").await.is_empty());
    assert_eq!(run(&engine, "backend:ghost OR path:a").await, vec!["b/a"]);
}

#[tokio::test]
async fn deleted_files_and_directories_are_outside_the_universe() {
    let store = store_with_backends(&["b"]).await;
    let engine = FilterEngine::new(store.clone());
    let gone = put_file(&store, "b", "gone", 1, 0).await;
    put_file(&store, "b", "kept", 1, 0).await;
    store
        .upsert_file(&FileInput {
            backend_id: "b".into(),
            path: "dir".into(),
            size: 0,
            md5: None,
            sha256: None,
            etag: None,
            modified_at: 0,
            is_dir: true,
        })
        .await
        .unwrap();
    store.add_tag(gone, "x", "1").await.unwrap();
    store.delete_file_logged(gone, "test").await.unwrap();

    assert!(run(&engine, "tag:x=1").await.is_empty());
    assert_eq!(run(&engine, "NOT tag:x=1").await, vec!["b/kept"]);
}

#[tokio::test]
async fn results_are_ordered_by_backend_then_path() {
    let store = store_with_backends(&["zeta", "alpha"]).await;
    let engine = FilterEngine::new(store.clone());
    for (backend, path) in [("zeta", "a"), ("alpha", "b"), ("alpha", "B"), ("alpha", "a")] {
        put_file(&store, backend, path, 1, 0).await;
    }
    let first = run(&engine, "size>=0").await;
    assert_eq!(first, vec!["alpha/B", "alpha/a", "alpha/b", "zeta/a"]);
    assert_eq!(run(&engine, "size>=0").await, first);
}

#[tokio::test]
async fn cancelled_evaluation_reports_cancellation() {
    let store = store_with_backends(&["b"]).await;
    let engine = FilterEngine::new(store);
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        engine.evaluate_query("tag:a=1", &cancel).await,
        Err(FilterError::Cancelled)
    ));
}

#[tokio::test]
async fn cache_is_invalidated_by_tag_writes() {
    let store = store_with_backends(&["b", "other"]).await;
    let engine = FilterEngine::with_cache(store.clone());
    let cache = engine.cache().unwrap().clone();
    let file = put_file(&store, "b", "a", 1, 0).await;
    let unrelated = put_file(&store, "other", "z", 1, 0).await;
    let scoped = engine
        .create_filter(FilterSpec {
            virtual_path: "scoped".into(),
            name: Some("Scoped".into()),
            query: "backend:b AND tag:k=v".into(),
            description: None,
        })
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(engine.evaluate_filter(&scoped, &cancel).await.unwrap().is_empty());
    assert_eq!(cache.len(), 1);

    // a write on a backend outside the candidate set keeps the entry
    store.add_tag(unrelated, "k", "v").await.unwrap();
    assert_eq!(cache.len(), 1);

    store.add_tag(file, "k", "v").await.unwrap();
    assert!(cache.is_empty());
    assert_eq!(
        paths(&engine.evaluate_filter(&scoped, &cancel).await.unwrap()),
        vec!["b/a"]
    );
}

#[tokio::test]
async fn clock_relative_filters_bypass_the_cache() {
    let store = store_with_backends(&["b"]).await;
    let engine = FilterEngine::with_cache(store.clone());
    let recent = engine
        .create_filter(FilterSpec {
            virtual_path: "recent".into(),
            name: None,
            query: "modified_time>now-7d".into(),
            description: None,
        })
        .await
        .unwrap();
    engine
        .evaluate_filter(&recent, &CancellationToken::new())
        .await
        .unwrap();
    assert!(engine.cache().unwrap().is_empty());
}

#[tokio::test]
async fn filter_management_validates_input() {
    let store = store_with_backends(&[]).await;
    let engine = FilterEngine::new(store);
    let spec = |path: &str, query: &str| FilterSpec {
        virtual_path: path.into(),
        name: None,
        query: query.into(),
        description: None,
    };

    assert!(matches!(
        engine.create_filter(spec("red", "tag:colour=")).await,
        Err(FilterError::Validation { .. })
    ));
    assert!(matches!(
        engine.create_filter(spec("filters", "tag:a=1")).await,
        Err(FilterError::Path(_))
    ));
    engine.create_filter(spec("red", "tag:colour=red")).await.unwrap();
    assert!(matches!(
        engine.create_filter(spec("filters/red", "tag:a=1")).await,
        Err(FilterError::Store(StoreError::Duplicate(_)))
    ));

    let updated = engine
        .update_filter(
            "filters/red",
            FilterSpec {
                virtual_path: "colours/red".into(),
                name: Some("Red".into()),
                query: "tag:colour=red OR tag:color=red".into(),
                description: Some("both spellings".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.virtual_path, "colours/red");
    assert_eq!(engine.list_filters().await.unwrap().len(), 1);
    assert!(matches!(
        engine.get_filter("red").await,
        Err(FilterError::NotFound(_))
    ));

    engine.delete_filter("colours/red").await.unwrap();
    assert!(engine.list_filters().await.unwrap().is_empty());
}

#[tokio::test]
async fn timeout_wraps_filter_evaluation() {
    let store = store_with_backends(&["b"]).await;
    let engine = FilterEngine::new(store.clone());
    put_file(&store, "b", "a.jpg", 1, 0).await;
    let filter = engine
        .create_filter(FilterSpec {
            virtual_path: "all".into(),
            name: None,
            query: "path:*".into(),
            description: None,
        })
        .await
        .unwrap();
    let files = engine
        .evaluate_filter_with_timeout(&filter, std::time::Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
}
