use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::client::{ObjectBody, ObjectInfo, ObjectStore, StorageError, unix_now};

/// Chunk size of bodies served by `get`.
const BODY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Permanent,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    modified: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    puts: HashMap<String, u32>,
    deletes: HashMap<String, u32>,
    failures: VecDeque<InjectedFailure>,
    unreachable: bool,
}

/// In-process object store. Used by tests and by `memory://` backends.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_object(&self, key: &str, data: &[u8], modified: i64) {
        let mut state = self.state.lock().await;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                etag: etag_for(data),
                modified,
            },
        );
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state.objects.get(key).map(|object| object.data.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.objects.keys().cloned().collect()
    }

    pub async fn put_count(&self, key: &str) -> u32 {
        let state = self.state.lock().await;
        state.puts.get(key).copied().unwrap_or(0)
    }

    pub async fn delete_count(&self, key: &str) -> u32 {
        let state = self.state.lock().await;
        state.deletes.get(key).copied().unwrap_or(0)
    }

    /// The next `count` requests fail with the given class before touching state.
    pub async fn fail_next(&self, count: usize, failure: InjectedFailure) {
        let mut state = self.state.lock().await;
        state.failures.extend(std::iter::repeat_n(failure, count));
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }
}

fn etag_for(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn check_available(state: &mut MemoryState) -> Result<(), StorageError> {
    if state.unreachable {
        return Err(StorageError::Unreachable("memory store offline".into()));
    }
    match state.failures.pop_front() {
        Some(InjectedFailure::Transient) => Err(StorageError::Rejected {
            code: "SlowDown".into(),
            message: "injected transient failure".into(),
        }),
        Some(InjectedFailure::Permanent) => Err(StorageError::Rejected {
            code: "InvalidRequest".into(),
            message: "injected permanent failure".into(),
        }),
        None => Ok(()),
    }
}

fn info_for(key: &str, object: &StoredObject) -> ObjectInfo {
    ObjectInfo {
        key: key.to_string(),
        size: object.data.len() as i64,
        etag: Some(object.etag.clone()),
        modified: Some(object.modified),
        is_dir: key.ends_with('/'),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut state = self.state.lock().await;
        check_available(&mut state)?;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| info_for(key, object))
            .collect())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        let mut state = self.state.lock().await;
        check_available(&mut state)?;
        Ok(state.objects.get(key).map(|object| info_for(key, object)))
    }

    async fn get(&self, key: &str) -> Result<ObjectBody, StorageError> {
        let mut state = self.state.lock().await;
        check_available(&mut state)?;
        let data = state
            .objects
            .get(key)
            .map(|object| Bytes::from(object.data.clone()))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let chunks: Vec<Result<Bytes, StorageError>> = (0..data.len())
            .step_by(BODY_CHUNK)
            .map(|start| Ok(data.slice(start..data.len().min(start + BODY_CHUNK))))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        chunk_size: usize,
    ) -> Result<ObjectInfo, StorageError> {
        let local = |err: std::io::Error| StorageError::Local(format!("{}: {err}", path.display()));
        let mut file = tokio::fs::File::open(path).await.map_err(local)?;
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut data = Vec::new();
        loop {
            let read = file.read(&mut buf).await.map_err(local)?;
            if read == 0 {
                break;
            }
            data.extend_from_slice(&buf[..read]);
        }
        self.put(key, data).await
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<ObjectInfo, StorageError> {
        let mut state = self.state.lock().await;
        check_available(&mut state)?;
        let object = StoredObject {
            etag: etag_for(&data),
            data,
            modified: unix_now(),
        };
        let info = info_for(key, &object);
        state.objects.insert(key.to_string(), object);
        *state.puts.entry(key.to_string()).or_default() += 1;
        Ok(info)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        check_available(&mut state)?;
        state.objects.remove(key);
        *state.deletes.entry(key.to_string()).or_default() += 1;
        Ok(())
    }
}
