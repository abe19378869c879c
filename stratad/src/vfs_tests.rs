use std::sync::Arc;

use strata_core::{ConnectionInfo, Credentials, MemoryObjectStore, ObjectStore};
use strata_integrations::EntryKind;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::filter::{FilterEngine, FilterSpec};
use crate::registry::{BackendRegistry, BackendSpec, DefaultClientFactory};
use crate::storage::ChaChaCipher;
use crate::store::{ChangeKind, FileInput, MetadataStore};

const CLIENT: &str = "test-client";
// 2021-06-01T00:00:00Z
const JUNE_2021: i64 = 1_622_505_600;

struct Harness {
    store: Arc<MetadataStore>,
    factory: Arc<DefaultClientFactory>,
    registry: Arc<BackendRegistry>,
    filters: Arc<FilterEngine>,
    vfs: VfsService,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(MetadataStore::in_memory().await.unwrap());
        let factory = Arc::new(DefaultClientFactory::new());
        let registry = Arc::new(BackendRegistry::new(
            store.clone(),
            Arc::new(ChaChaCipher::from_secret(b"vfs-tests")),
            factory.clone(),
        ));
        registry
            .register(BackendSpec {
                id: "selfhosted".into(),
                name: "Self hosted".into(),
                connection: ConnectionInfo {
                    endpoint: "memory://selfhosted".into(),
                    region: None,
                    bucket: "files".into(),
                    use_ssl: false,
                },
                credentials: Credentials {
                    access_key: "ak".into(),
                    secret_key: "sk".into(),
                },
            })
            .await
            .unwrap();
        let filters = Arc::new(FilterEngine::with_cache(store.clone()));
        let vfs = VfsService::new(store.clone(), registry.clone(), filters.clone(), CLIENT);
        Self {
            store,
            factory,
            registry,
            filters,
            vfs,
        }
    }

    fn remote(&self) -> MemoryObjectStore {
        self.factory.memory_store("selfhosted")
    }

    async fn file(&self, path: &str, size: i64) -> FileRecord {
        self.store
            .upsert_file(&FileInput {
                backend_id: "selfhosted".into(),
                path: path.into(),
                size,
                md5: None,
                sha256: None,
                etag: None,
                modified_at: JUNE_2021,
                is_dir: false,
            })
            .await
            .unwrap()
    }

    async fn list(&self, path: &str) -> Result<Vec<VfsEntry>, VfsError> {
        self.vfs.list(path, &CancellationToken::new()).await
    }
}

fn names(entries: &[VfsEntry]) -> Vec<&str> {
    entries.iter().map(|entry| entry.name.as_str()).collect()
}

#[tokio::test]
async fn root_lists_backends_and_the_filter_namespace() {
    let h = Harness::new().await;
    let entries = h.list("").await.unwrap();
    assert_eq!(names(&entries), vec!["selfhosted", "filters"]);
    assert_eq!(entries[0].kind, EntryKind::Backend);
    assert_eq!(entries[1].kind, EntryKind::Directory);
}

#[tokio::test]
async fn backend_listing_groups_descendants_into_directories() {
    let h = Harness::new().await;
    h.file("a.txt", 1).await;
    h.file("docs/b.txt", 2).await;
    h.file("docs/sub/c.txt", 3).await;

    let top = h.list("selfhosted").await.unwrap();
    assert_eq!(names(&top), vec!["a.txt", "docs"]);
    assert_eq!(top[0].kind, EntryKind::File);
    assert_eq!(top[0].size, Some(1));
    assert_eq!(top[1].kind, EntryKind::Directory);
    assert_eq!(top[1].path, "selfhosted/docs");

    let docs = h.list("/selfhosted/docs/").await.unwrap();
    assert_eq!(names(&docs), vec!["b.txt", "sub"]);
    assert_eq!(docs[1].path, "selfhosted/docs/sub");

    let single = h.list("selfhosted/docs/b.txt").await.unwrap();
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].path, "selfhosted/docs/b.txt");

    assert!(matches!(
        h.list("selfhosted/missing").await,
        Err(VfsError::NotFound(_))
    ));
    assert!(matches!(
        h.list("nowhere").await,
        Err(VfsError::Resolve(ResolveError::BackendNotFound(_)))
    ));
}

#[tokio::test]
async fn existence_tests_cover_files_directories_and_unknown_roots() {
    let h = Harness::new().await;
    h.file("docs/b.txt", 2).await;

    assert!(h.vfs.exists("").await.unwrap());
    assert!(h.vfs.exists("selfhosted").await.unwrap());
    assert!(h.vfs.exists("selfhosted/docs").await.unwrap());
    assert!(h.vfs.exists("selfhosted/docs/b.txt").await.unwrap());
    assert!(h.vfs.exists("filters").await.unwrap());
    assert!(!h.vfs.exists("selfhosted/doc").await.unwrap());
    assert!(!h.vfs.exists("other/x").await.unwrap());
    assert!(!h.vfs.exists("filters/none").await.unwrap());
    assert!(matches!(
        h.vfs.exists(".hidden/x").await,
        Err(VfsError::Resolve(ResolveError::InvalidPath { .. }))
    ));
}

#[tokio::test]
async fn touch_creates_missing_objects_and_refreshes_existing_ones() {
    let h = Harness::new().await;
    let created = h.vfs.touch("selfhosted/notes/new.txt").await.unwrap();
    assert_eq!(created.size, 0);
    assert_eq!(h.remote().object("notes/new.txt").await, Some(Vec::new()));

    h.remote().insert_object("old.txt", b"hello", JUNE_2021).await;
    let touched = h.vfs.touch("selfhosted/old.txt").await.unwrap();
    assert_eq!(touched.size, 5);
    assert!(touched.modified_at > JUNE_2021);
    assert_eq!(h.remote().put_count("old.txt").await, 0);
    assert_eq!(touched.md5.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));

    assert!(matches!(
        h.vfs.touch("selfhosted").await,
        Err(VfsError::InvalidPath { .. })
    ));
    assert!(matches!(
        h.vfs.touch("filters/x").await,
        Err(VfsError::Resolve(ResolveError::FilterNotFound(_)))
    ));
}

#[tokio::test]
async fn mkdir_creates_markers_for_every_missing_level() {
    let h = Harness::new().await;
    let dir = h.vfs.mkdir("selfhosted/a/b").await.unwrap();
    assert!(dir.is_dir);
    assert_eq!(dir.path, "a/b");

    let keys = h.remote().keys().await;
    assert!(keys.contains(&"a/".to_string()));
    assert!(keys.contains(&"a/b/".to_string()));
    let parent = h.store.get_file("selfhosted", "a").await.unwrap().unwrap();
    assert!(parent.is_dir);
    assert_eq!(dir.parent_id, Some(parent.id));

    // existing levels are reused
    h.vfs.mkdir("selfhosted/a/c").await.unwrap();
    assert_eq!(h.remote().put_count("a/").await, 1);

    h.file("plain", 1).await;
    assert!(matches!(
        h.vfs.mkdir("selfhosted/plain/sub").await,
        Err(VfsError::Validation(_))
    ));
    assert!(matches!(
        h.vfs.mkdir("selfhosted/a/../b").await,
        Err(VfsError::InvalidPath { .. })
    ));
}

#[tokio::test]
async fn remove_handles_files_directories_and_confirmed_wipes() {
    let h = Harness::new().await;
    for key in ["a.txt", "docs/b.txt", "docs/c.txt", "keep/d.txt"] {
        h.remote().insert_object(key, b"data", JUNE_2021).await;
    }
    h.vfs.scan_backend("selfhosted").await.unwrap();

    assert_eq!(
        h.vfs
            .remove("selfhosted/a.txt", RemoveOptions::default())
            .await
            .unwrap(),
        1
    );
    assert_eq!(h.remote().object("a.txt").await, None);
    assert!(h.store.get_file("selfhosted", "a.txt").await.unwrap().is_none());

    assert!(matches!(
        h.vfs
            .remove("selfhosted/docs", RemoveOptions::default())
            .await,
        Err(VfsError::NotEmpty(_))
    ));
    let removed = h
        .vfs
        .remove(
            "selfhosted/docs",
            RemoveOptions {
                recursive: true,
                confirm: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(h.remote().keys().await, vec!["keep/d.txt".to_string()]);

    assert!(matches!(
        h.vfs.remove("selfhosted/nothing", RemoveOptions::default()).await,
        Err(VfsError::NotFound(_))
    ));

    h.remote().insert_object("stray.bin", b"??", JUNE_2021).await;
    assert_eq!(
        h.vfs
            .remove("selfhosted/stray.bin", RemoveOptions::default())
            .await
            .unwrap(),
        0
    );
    assert_eq!(h.remote().delete_count("stray.bin").await, 1);
    let changes = h
        .store
        .list_changes_since(Some("selfhosted"), 0, 100)
        .await
        .unwrap();
    let last = changes.last().unwrap();
    assert_eq!((last.path.as_str(), last.kind), ("stray.bin", ChangeKind::Delete));
    assert_eq!(last.file_id, None);
    assert_eq!(last.client_id, CLIENT);
    assert!(matches!(
        h.vfs.remove("selfhosted", RemoveOptions::default()).await,
        Err(VfsError::ConfirmationRequired(_))
    ));
    assert!(h.store.get_file("selfhosted", "keep/d.txt").await.unwrap().is_some());

    let wiped = h
        .vfs
        .remove(
            "selfhosted",
            RemoveOptions {
                recursive: false,
                confirm: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(wiped, 1);
    assert!(h.remote().keys().await.is_empty());
    assert_eq!(h.store.count_files("selfhosted", "").await.unwrap(), 0);
    let backend = h.registry.get("selfhosted").await.unwrap();
    assert_eq!((backend.file_count, backend.total_bytes), (0, 0));
}

#[tokio::test]
async fn scan_reconciles_the_catalog_with_physical_objects() {
    let h = Harness::new().await;
    h.remote().insert_object("pic.jpg", b"jpeg", JUNE_2021).await;
    h.remote().insert_object("docs/", b"", JUNE_2021).await;
    h.remote().insert_object("docs/a.txt", b"text", JUNE_2021).await;

    let first = h.vfs.scan_backend("selfhosted").await.unwrap();
    assert_eq!((first.scanned, first.created, first.updated, first.removed), (3, 3, 0, 0));
    let docs = h.store.get_file("selfhosted", "docs").await.unwrap().unwrap();
    assert!(docs.is_dir);
    let text = h.store.get_file("selfhosted", "docs/a.txt").await.unwrap().unwrap();
    assert_eq!(text.parent_id, Some(docs.id));
    assert_eq!(text.modified_at, JUNE_2021);

    let unchanged = h.vfs.scan_backend("selfhosted").await.unwrap();
    assert_eq!((unchanged.created, unchanged.updated, unchanged.removed), (0, 0, 0));

    h.remote().insert_object("pic.jpg", b"bigger jpeg", JUNE_2021 + 60).await;
    h.remote().delete("docs/a.txt").await.unwrap();
    let second = h.vfs.scan_backend("selfhosted").await.unwrap();
    assert_eq!((second.scanned, second.created, second.updated, second.removed), (2, 0, 1, 1));

    let backend = h.registry.get("selfhosted").await.unwrap();
    assert_eq!((backend.file_count, backend.total_bytes), (1, 11));

    let changes = h
        .store
        .list_changes_since(Some("selfhosted"), 0, 100)
        .await
        .unwrap();
    assert_eq!(changes.len(), 5);
    assert!(changes.iter().all(|change| change.client_id == "scan:test-client"));
    assert_eq!(changes[4].kind, ChangeKind::Delete);
    assert_eq!(changes[4].path, "docs/a.txt");
}

#[tokio::test]
async fn scanning_an_unknown_backend_is_not_found() {
    let h = Harness::new().await;
    assert!(matches!(
        h.vfs.scan_backend("ghost").await,
        Err(VfsError::Registry(RegistryError::NotFound(_)))
    ));
}

#[tokio::test]
async fn tags_are_idempotent_and_removal_of_absent_tags_is_a_no_op() {
    let h = Harness::new().await;
    h.file("pic.jpg", 4).await;

    assert!(h.vfs.tag_add("selfhosted/pic.jpg", "colour", "red").await.unwrap());
    assert!(!h.vfs.tag_add("selfhosted/pic.jpg", "colour", "red").await.unwrap());
    h.vfs.tag_add("selfhosted/pic.jpg", "colour", "blue").await.unwrap();
    let tags = h.vfs.tag_list("selfhosted/pic.jpg").await.unwrap();
    assert_eq!(tags.len(), 2);

    assert_eq!(
        h.vfs
            .tag_remove("selfhosted/pic.jpg", "event", Some("vacation"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        h.vfs
            .tag_remove("selfhosted/pic.jpg", "colour", Some("blue"))
            .await
            .unwrap(),
        1
    );

    let red = h.vfs.tag_search("colour", Some("red")).await.unwrap();
    assert_eq!(red.len(), 1);
    assert_eq!(red[0].path, "pic.jpg");
    assert_eq!(h.vfs.tag_search("colour", None).await.unwrap().len(), 1);
    assert!(h.vfs.tag_search("missing", None).await.unwrap().is_empty());

    assert!(matches!(
        h.vfs.tag_add("selfhosted/pic.jpg", "bad key", "x").await,
        Err(VfsError::Validation(_))
    ));
    assert!(matches!(
        h.vfs.tag_add("selfhosted/pic.jpg", "k", "").await,
        Err(VfsError::Validation(_))
    ));
    assert!(matches!(
        h.vfs.tag_add("selfhosted/none.jpg", "colour", "red").await,
        Err(VfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn tagged_files_appear_in_and_leave_filter_listings() {
    let h = Harness::new().await;
    h.remote().insert_object("pic.jpg", b"jpeg", JUNE_2021).await;
    h.vfs.scan_backend("selfhosted").await.unwrap();
    h.vfs.tag_add("selfhosted/pic.jpg", "colour", "red").await.unwrap();
    h.filters
        .create_filter(FilterSpec {
            virtual_path: "filters/pictures/red".into(),
            name: None,
            query: "tag:colour=red".into(),
            description: None,
        })
        .await
        .unwrap();

    let listed = h.list("filters/pictures/red").await.unwrap();
    assert_eq!(names(&listed), vec!["selfhosted/pic.jpg"]);
    let filters = h.list("filters").await.unwrap();
    assert_eq!(filters[0].path, "filters/pictures/red");
    assert_eq!(filters[0].kind, EntryKind::Filter);

    h.vfs
        .tag_remove("selfhosted/pic.jpg", "colour", None)
        .await
        .unwrap();
    assert!(h.list("filters/pictures/red").await.unwrap().is_empty());
}

#[tokio::test]
async fn auto_tag_derives_mime_extension_and_year() {
    let h = Harness::new().await;
    h.file("photos/beach.JPG", 10).await;
    h.file("photos/README", 1).await;

    let report = h.vfs.auto_tag("selfhosted/photos").await.unwrap();
    assert_eq!(report.files, 2);
    // beach: mime, ext, year; README: mime, year
    assert_eq!(report.added, 5);

    let tags: Vec<(String, String)> = h
        .vfs
        .tag_list("selfhosted/photos/beach.JPG")
        .await
        .unwrap()
        .into_iter()
        .map(|tag| (tag.key, tag.value))
        .collect();
    assert_eq!(
        tags,
        vec![
            ("ext".to_string(), "jpg".to_string()),
            ("mime".to_string(), "image/jpeg".to_string()),
            ("year".to_string(), "2021".to_string()),
        ]
    );

    let again = h.vfs.auto_tag("selfhosted/photos/beach.JPG").await.unwrap();
    assert_eq!((again.files, again.added), (1, 0));
    assert!(matches!(
        h.vfs.auto_tag("selfhosted/elsewhere").await,
        Err(VfsError::NotFound(_))
    ));
}

#[test]
fn tag_keys_reject_query_operators() {
    assert!(validate_tag("colour", "red").is_ok());
    assert!(validate_tag("a=b", "x").is_err());
    assert!(validate_tag("", "x").is_err());
    assert!(validate_tag("k", "has spaces is fine").is_ok());
}
