use std::sync::Arc;
use std::time::Duration;

use strata_core::{ConnectionInfo, Credentials};
use stratad::daemon::{AgentServices, DaemonConfig};
use stratad::filter::FilterSpec;
use stratad::registry::{BackendSpec, DefaultClientFactory};
use stratad::storage::ChaChaCipher;
use stratad::store::{MetadataStore, SyncDirection};
use stratad::sync::SyncSpec;
use tokio_util::sync::CancellationToken;

async fn agent() -> (Arc<AgentServices>, Arc<DefaultClientFactory>) {
    let store = Arc::new(MetadataStore::in_memory().await.unwrap());
    let factory = Arc::new(DefaultClientFactory::new());
    let config = DaemonConfig::from_lookup(|name| {
        (name == "STRATA_CLIENT_ID").then(|| "e2e".to_string())
    })
    .unwrap();
    let services = AgentServices::assemble(
        store,
        Arc::new(ChaChaCipher::from_secret(b"end-to-end")),
        factory.clone(),
        &config,
    );
    services
        .registry
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
    (Arc::new(services), factory)
}

#[tokio::test]
async fn tagged_file_appears_in_filter_until_untagged() {
    let (agent, _) = agent().await;
    agent.vfs.touch("selfhosted/pic.jpg").await.unwrap();
    agent
        .vfs
        .tag_add("selfhosted/pic.jpg", "colour", "red")
        .await
        .unwrap();
    let filter = agent
        .filters
        .create_filter(FilterSpec {
            virtual_path: "filters/pictures/red".into(),
            name: None,
            query: "tag:colour=red".into(),
            description: None,
        })
        .await
        .unwrap();
    assert_eq!(filter.virtual_path, "pictures/red");

    let matched = agent
        .filters
        .evaluate_filter_with_timeout(&filter, Duration::from_secs(5))
        .await
        .unwrap();
    let paths: Vec<String> = matched
        .iter()
        .map(|file| format!("{}/{}", file.backend_id, file.path))
        .collect();
    assert_eq!(paths, vec!["selfhosted/pic.jpg".to_string()]);

    agent
        .vfs
        .tag_remove("selfhosted/pic.jpg", "colour", None)
        .await
        .unwrap();
    let matched = agent
        .filters
        .evaluate_filter_with_timeout(&filter, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(matched.is_empty());
}

#[tokio::test]
async fn filter_sourced_sync_mirrors_the_matching_objects() {
    let (agent, factory) = agent().await;
    let memory = factory.memory_store("selfhosted");
    memory.insert_object("pics/a.jpg", b"aaaa", 1_700_000_000).await;
    memory.insert_object("pics/b.jpg", b"bb", 1_700_000_000).await;
    let report = agent.vfs.scan_backend("selfhosted").await.unwrap();
    assert_eq!(report.created, 2);
    agent
        .vfs
        .tag_add("selfhosted/pics/a.jpg", "colour", "red")
        .await
        .unwrap();
    agent
        .filters
        .create_filter(FilterSpec {
            virtual_path: "red".into(),
            name: None,
            query: "tag:colour=red".into(),
            description: None,
        })
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = agent.supervisor.engine();
    let config = agent
        .supervisor
        .create(SyncSpec {
            name: "red-pictures".into(),
            source: "filters/red".into(),
            destination: dir.path().to_string_lossy().into_owned(),
            direction: SyncDirection::DownloadOnly,
            workers: Some(2),
            chunk_size: None,
            interval_secs: None,
            ignore_patterns: Vec::new(),
        })
        .await
        .unwrap();
    let summary = engine
        .run_config(&config, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(
        std::fs::read(dir.path().join("selfhosted/pics/a.jpg")).unwrap(),
        b"aaaa"
    );
    assert!(!dir.path().join("selfhosted/pics/b.jpg").exists());

    let bidirectional = agent
        .supervisor
        .create(SyncSpec {
            name: "red-both-ways".into(),
            source: "filters/red".into(),
            destination: dir.path().to_string_lossy().into_owned(),
            direction: SyncDirection::Bidirectional,
            workers: None,
            chunk_size: None,
            interval_secs: None,
            ignore_patterns: Vec::new(),
        })
        .await;
    assert!(bidirectional.is_err());
}
