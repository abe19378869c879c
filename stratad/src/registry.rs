use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use strata_core::{
    ConnectionInfo, Credentials, MemoryObjectStore, ObjectStore, S3Client, StorageError,
};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::resolver::{ResolveError, validate_backend_id};
use crate::storage::{CipherError, CredentialCipher};
use crate::store::{BackendRecord, MetadataStore, NewBackend, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidId(#[from] ResolveError),
    #[error("backend '{0}' not found")]
    NotFound(String),
    #[error("invalid backend configuration: {0}")]
    Validation(String),
    #[error("credential error: {0}")]
    Cipher(#[from] CipherError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builds a storage client from decrypted credentials.
pub trait ClientFactory: Send + Sync {
    fn build(
        &self,
        backend_id: &str,
        connection: &ConnectionInfo,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ObjectStore>, StorageError>;
}

/// S3 for real endpoints, a per-backend in-process store for `memory://`.
#[derive(Default)]
pub struct DefaultClientFactory {
    memory: Mutex<HashMap<String, MemoryObjectStore>>,
}

impl DefaultClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The in-process store behind a `memory://` backend, created on demand.
    pub fn memory_store(&self, backend_id: &str) -> MemoryObjectStore {
        let mut memory = self
            .memory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        memory.entry(backend_id.to_string()).or_default().clone()
    }
}

impl ClientFactory for DefaultClientFactory {
    fn build(
        &self,
        backend_id: &str,
        connection: &ConnectionInfo,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ObjectStore>, StorageError> {
        if connection.is_memory() {
            return Ok(Arc::new(self.memory_store(backend_id)));
        }
        Ok(Arc::new(S3Client::new(connection, credentials)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub id: String,
    pub name: String,
    pub connection: ConnectionInfo,
    pub credentials: Credentials,
}

/// Partial update; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendPatch {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub use_ssl: Option<bool>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Default)]
struct ClientCache {
    clients: HashMap<String, Arc<dyn ObjectStore>>,
    /// Bumped by every eviction. A client built from a record read under an
    /// older generation is handed out but never cached.
    generations: HashMap<String, u64>,
}

impl ClientCache {
    fn generation(&self, id: &str) -> u64 {
        self.generations.get(id).copied().unwrap_or(0)
    }
}

/// Turns backend ids into live storage clients. Owned explicitly and shared by
/// reference; independent instances keep independent caches.
pub struct BackendRegistry {
    store: Arc<MetadataStore>,
    cipher: Arc<dyn CredentialCipher>,
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<ClientCache>,
}

impl BackendRegistry {
    pub fn new(
        store: Arc<MetadataStore>,
        cipher: Arc<dyn CredentialCipher>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            store,
            cipher,
            factory,
            clients: RwLock::new(ClientCache::default()),
        }
    }

    pub async fn register(&self, spec: BackendSpec) -> Result<BackendRecord, RegistryError> {
        validate_backend_id(&spec.id)?;
        if spec.name.trim().is_empty() {
            return Err(RegistryError::Validation("name is empty".into()));
        }
        validate_credentials(&spec.credentials)?;
        spec.connection
            .validate()
            .map_err(|err| RegistryError::Validation(err.to_string()))?;

        let record = self
            .store
            .create_backend(&NewBackend {
                access_key_enc: self.cipher.encrypt(&spec.credentials.access_key)?,
                secret_key_enc: self.cipher.encrypt(&spec.credentials.secret_key)?,
                id: spec.id,
                name: spec.name,
                connection: spec.connection,
            })
            .await?;
        // a revived id must not reuse a client built for its previous life
        self.evict(&record.id).await;
        tracing::info!(backend = %record.id, endpoint = %record.connection.endpoint, "backend registered");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<BackendRecord, RegistryError> {
        self.store
            .get_backend(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<BackendRecord>, RegistryError> {
        Ok(self.store.list_backends().await?)
    }

    pub async fn update(
        &self,
        id: &str,
        patch: BackendPatch,
    ) -> Result<BackendRecord, RegistryError> {
        let mut record = self.get(id).await?;
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(RegistryError::Validation("name is empty".into()));
            }
            record.name = name;
        }
        if let Some(endpoint) = patch.endpoint {
            record.connection.endpoint = endpoint;
        }
        if let Some(region) = patch.region {
            record.connection.region = Some(region).filter(|region| !region.trim().is_empty());
        }
        if let Some(bucket) = patch.bucket {
            record.connection.bucket = bucket;
        }
        if let Some(use_ssl) = patch.use_ssl {
            record.connection.use_ssl = use_ssl;
        }
        record
            .connection
            .validate()
            .map_err(|err| RegistryError::Validation(err.to_string()))?;
        if patch.access_key.is_some() || patch.secret_key.is_some() {
            let current = self.decrypt(&record)?;
            let rotated = Credentials {
                access_key: patch.access_key.unwrap_or(current.access_key),
                secret_key: patch.secret_key.unwrap_or(current.secret_key),
            };
            validate_credentials(&rotated)?;
            record.access_key_enc = self.cipher.encrypt(&rotated.access_key)?;
            record.secret_key_enc = self.cipher.encrypt(&rotated.secret_key)?;
        }

        let updated = self
            .store
            .update_backend(&record)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.evict(id).await;
        tracing::info!(backend = %id, "backend updated");
        Ok(updated)
    }

    /// Soft-deletes the backend and its files and drops the cached client.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        if !self.store.delete_backend(id).await? {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.evict(id).await;
        tracing::info!(backend = %id, "backend removed");
        Ok(())
    }

    /// Returns the cached client or builds one. Plaintext credentials live only
    /// for the duration of the build.
    pub async fn resolve_client(&self, id: &str) -> Result<Arc<dyn ObjectStore>, RegistryError> {
        let generation = {
            let cache = self.clients.read().await;
            if let Some(client) = cache.clients.get(id) {
                return Ok(client.clone());
            }
            cache.generation(id)
        };

        let record = self.get(id).await?;
        let client = {
            let credentials = self.decrypt(&record)?;
            self.factory.build(&record.id, &record.connection, &credentials)?
        };

        let mut cache = self.clients.write().await;
        if cache.generation(&record.id) != generation {
            tracing::debug!(backend = %record.id, "backend changed while building its client; not cached");
            return Ok(client);
        }
        let client = cache
            .clients
            .entry(record.id.clone())
            .or_insert(client)
            .clone();
        tracing::debug!(backend = %record.id, "storage client constructed");
        Ok(client)
    }

    pub async fn evict(&self, id: &str) {
        let mut cache = self.clients.write().await;
        cache.clients.remove(id);
        *cache.generations.entry(id.to_string()).or_insert(0) += 1;
    }

    pub async fn cached_count(&self) -> usize {
        self.clients.read().await.clients.len()
    }

    fn decrypt(&self, record: &BackendRecord) -> Result<Credentials, RegistryError> {
        Ok(Credentials {
            access_key: self.cipher.decrypt(&record.access_key_enc)?,
            secret_key: self.cipher.decrypt(&record.secret_key_enc)?,
        })
    }
}

fn validate_credentials(credentials: &Credentials) -> Result<(), RegistryError> {
    if credentials.access_key.trim().is_empty() || credentials.secret_key.trim().is_empty() {
        return Err(RegistryError::Validation(
            "access key and secret key are required".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ChaChaCipher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts builds and remembers the credentials it saw.
    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
        seen: Mutex<Vec<Credentials>>,
    }

    impl ClientFactory for CountingFactory {
        fn build(
            &self,
            _backend_id: &str,
            _connection: &ConnectionInfo,
            credentials: &Credentials,
        ) -> Result<Arc<dyn ObjectStore>, StorageError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(credentials.clone());
            Ok(Arc::new(MemoryObjectStore::new()))
        }
    }

    async fn registry() -> (BackendRegistry, Arc<CountingFactory>, Arc<MetadataStore>) {
        let store = Arc::new(MetadataStore::in_memory().await.unwrap());
        let factory = Arc::new(CountingFactory::default());
        let registry = BackendRegistry::new(
            store.clone(),
            Arc::new(ChaChaCipher::from_secret(b"test-master-key")),
            factory.clone(),
        );
        (registry, factory, store)
    }

    fn spec(id: &str) -> BackendSpec {
        BackendSpec {
            id: id.to_string(),
            name: "Self hosted".into(),
            connection: ConnectionInfo {
                endpoint: "minio.lan:9000".into(),
                region: None,
                bucket: "files".into(),
                use_ssl: false,
            },
            credentials: Credentials {
                access_key: "AKIA".into(),
                secret_key: "s3cr3t".into(),
            },
        }
    }

    #[tokio::test]
    async fn register_stores_only_encrypted_credentials() {
        let (registry, _, store) = registry().await;
        registry.register(spec("selfhosted")).await.unwrap();
        let stored = store.get_backend("selfhosted").await.unwrap().unwrap();
        assert!(stored.access_key_enc.starts_with("v1:"));
        assert!(!stored.access_key_enc.contains("AKIA"));
        assert!(!stored.secret_key_enc.contains("s3cr3t"));
    }

    #[tokio::test]
    async fn register_rejects_bad_identifiers() {
        let (registry, _, _) = registry().await;
        for bad in ["a/b", ".hidden", "sp ace", "filters"] {
            let err = registry.register(spec(bad)).await.unwrap_err();
            assert!(matches!(err, RegistryError::InvalidId(_)), "{bad}: {err}");
        }
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_bad_connections() {
        let (registry, _, _) = registry().await;
        registry.register(spec("selfhosted")).await.unwrap();
        assert!(matches!(
            registry.register(spec("selfhosted")).await,
            Err(RegistryError::Store(StoreError::Duplicate(_)))
        ));

        let mut broken = spec("other");
        broken.connection.bucket.clear();
        assert!(matches!(
            registry.register(broken).await,
            Err(RegistryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn clients_are_built_once_and_cached() {
        let (registry, factory, _) = registry().await;
        registry.register(spec("selfhosted")).await.unwrap();
        registry.resolve_client("selfhosted").await.unwrap();
        registry.resolve_client("selfhosted").await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);
        assert_eq!(registry.cached_count().await, 1);
        assert_eq!(factory.seen.lock().unwrap()[0].secret_key, "s3cr3t");
    }

    #[tokio::test]
    async fn update_evicts_and_rebuilds_with_fresh_credentials() {
        let (registry, factory, _) = registry().await;
        registry.register(spec("selfhosted")).await.unwrap();
        registry.resolve_client("selfhosted").await.unwrap();

        registry
            .update(
                "selfhosted",
                BackendPatch {
                    secret_key: Some("rotated".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(registry.cached_count().await, 0);

        registry.resolve_client("selfhosted").await.unwrap();
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        let seen = factory.seen.lock().unwrap();
        assert_eq!(seen[1].access_key, "AKIA");
        assert_eq!(seen[1].secret_key, "rotated");
    }

    #[tokio::test]
    async fn remove_evicts_and_unknown_ids_fail() {
        let (registry, _, _) = registry().await;
        registry.register(spec("selfhosted")).await.unwrap();
        registry.resolve_client("selfhosted").await.unwrap();
        registry.remove("selfhosted").await.unwrap();
        assert_eq!(registry.cached_count().await, 0);
        assert!(matches!(
            registry.resolve_client("selfhosted").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove("selfhosted").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_cached_client() {
        let (registry, _, _) = registry().await;
        registry.register(spec("selfhosted")).await.unwrap();
        let registry = Arc::new(registry);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.resolve_client("selfhosted").await.unwrap()
            }));
        }
        let mut clients = Vec::new();
        for handle in handles {
            clients.push(handle.await.unwrap());
        }
        assert!(clients.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.cached_count().await, 1);
    }

    /// Parks the first build until released, so an update can land while a
    /// client is being constructed from the old record.
    struct ParkingFactory {
        inner: CountingFactory,
        park: Mutex<Option<(std::sync::mpsc::SyncSender<()>, std::sync::mpsc::Receiver<()>)>>,
    }

    impl ClientFactory for ParkingFactory {
        fn build(
            &self,
            backend_id: &str,
            connection: &ConnectionInfo,
            credentials: &Credentials,
        ) -> Result<Arc<dyn ObjectStore>, StorageError> {
            let park = self.park.lock().unwrap().take();
            if let Some((entered, release)) = park {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
            self.inner.build(backend_id, connection, credentials)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn update_during_a_build_is_not_lost() {
        let (entered_tx, entered_rx) = std::sync::mpsc::sync_channel(1);
        let (release_tx, release_rx) = std::sync::mpsc::sync_channel(1);
        let factory = Arc::new(ParkingFactory {
            inner: CountingFactory::default(),
            park: Mutex::new(Some((entered_tx, release_rx))),
        });
        let store = Arc::new(MetadataStore::in_memory().await.unwrap());
        let registry = Arc::new(BackendRegistry::new(
            store,
            Arc::new(ChaChaCipher::from_secret(b"test-master-key")),
            factory.clone(),
        ));
        registry.register(spec("selfhosted")).await.unwrap();

        let resolving = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve_client("selfhosted").await })
        };
        tokio::task::spawn_blocking(move || entered_rx.recv().unwrap())
            .await
            .unwrap();
        registry
            .update(
                "selfhosted",
                BackendPatch {
                    secret_key: Some("rotated".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        release_tx.send(()).unwrap();
        resolving.await.unwrap().unwrap();
        assert_eq!(registry.cached_count().await, 0);

        registry.resolve_client("selfhosted").await.unwrap();
        assert_eq!(factory.inner.builds.load(Ordering::SeqCst), 2);
        let seen = factory.inner.seen.lock().unwrap();
        assert_eq!(seen[0].secret_key, "s3cr3t");
        assert_eq!(seen[1].secret_key, "rotated");
    }

    #[tokio::test]
    async fn memory_endpoints_share_one_store_per_backend() {
        let factory = DefaultClientFactory::new();
        let connection = ConnectionInfo {
            endpoint: "memory://local".into(),
            region: None,
            bucket: "b".into(),
            use_ssl: false,
        };
        let credentials = Credentials {
            access_key: "a".into(),
            secret_key: "s".into(),
        };
        let client = factory.build("mem", &connection, &credentials).unwrap();
        client.put("a.txt", b"hi".to_vec()).await.unwrap();
        assert_eq!(
            factory.memory_store("mem").object("a.txt").await,
            Some(b"hi".to_vec())
        );
    }
}
