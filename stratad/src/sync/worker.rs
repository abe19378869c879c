//! Job execution: a pool of workers draining one sync state's queue, each
//! finishing its current transfer before claiming the next.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use md5::Context;
use strata_core::{ObjectBody, ObjectInfo, ObjectStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::EngineError;
use super::backoff::Backoff;
use super::local::{local_path_for, mtime_of, partial_path};
use crate::store::{
    EntryUpdate, FileInput, JobKind, MetadataStore, SyncEntryRecord, SyncJobRecord, now_unix,
};

const MIN_CHUNK: u64 = 64 * 1024;
const MAX_CHUNK: u64 = 64 * 1024 * 1024;

/// Everything a worker needs to run the jobs of one sync state.
pub(crate) struct JobContext {
    pub store: Arc<MetadataStore>,
    pub client: Arc<dyn ObjectStore>,
    pub backend_id: String,
    pub local_root: PathBuf,
    pub client_id: String,
    /// Filter sources are views; their downloads never touch metadata.
    pub record_metadata: bool,
    pub chunk_size: u64,
    pub retries: u32,
    pub backoff: Backoff,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainTally {
    pub completed: u64,
    pub failed: u64,
    pub bytes: i64,
}

impl DrainTally {
    fn merge(&mut self, other: DrainTally) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

struct JobResult {
    entry: EntryUpdate,
    bytes: i64,
}

/// Runs `workers` loops over the state's pending jobs. A persistence failure
/// in any worker aborts the batch; the remaining jobs stay queued.
pub(crate) async fn drain(
    ctx: Arc<JobContext>,
    state_id: i64,
    workers: u32,
) -> Result<DrainTally, EngineError> {
    let mut set = JoinSet::new();
    for worker in 0..workers.max(1) {
        let ctx = ctx.clone();
        set.spawn(async move { worker_loop(ctx, state_id, worker).await });
    }

    let mut tally = DrainTally::default();
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(part)) => tally.merge(part),
            Ok(Err(err)) => {
                ctx.cancel.cancel();
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                ctx.cancel.cancel();
                first_error.get_or_insert(EngineError::Io(io::Error::other(join_err)));
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(tally),
    }
}

async fn worker_loop(
    ctx: Arc<JobContext>,
    state_id: i64,
    worker: u32,
) -> Result<DrainTally, EngineError> {
    let mut tally = DrainTally::default();
    while !ctx.cancel.is_cancelled() {
        let Some(job) = ctx.store.claim_next_job(state_id).await? else {
            break;
        };
        match run_with_retries(&ctx, &job).await {
            Ok(result) => {
                ctx.store.complete_job(&job, &result.entry, result.bytes).await?;
                debug!(worker, job = job.id, kind = job.kind.as_str(), path = %job.rel_path, bytes = result.bytes, "job done");
                tally.completed += 1;
                tally.bytes += result.bytes;
            }
            // left running; the next run puts it back in the queue
            Err(EngineError::Cancelled) => break,
            Err(err) if err.aborts_batch() => return Err(err),
            Err(err) => {
                warn!(worker, job = job.id, kind = job.kind.as_str(), path = %job.rel_path, error = %err, "job failed");
                ctx.store.fail_job(&job, &err.to_string()).await?;
                tally.failed += 1;
            }
        }
    }
    Ok(tally)
}

async fn run_with_retries(ctx: &JobContext, job: &SyncJobRecord) -> Result<JobResult, EngineError> {
    let mut attempt = 0;
    loop {
        match execute(ctx, job).await {
            Err(err) if err.is_retryable() && attempt < ctx.retries => {
                let delay = ctx.backoff.delay(attempt);
                debug!(job = job.id, attempt, ?delay, error = %err, "retrying job");
                attempt += 1;
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}

async fn execute(ctx: &JobContext, job: &SyncJobRecord) -> Result<JobResult, EngineError> {
    match job.kind {
        JobKind::Upload => upload(ctx, job).await,
        JobKind::Download => download(ctx, job).await,
        JobKind::DeleteRemote => delete_remote(ctx, job).await,
        JobKind::DeleteLocal => delete_local(ctx, job).await,
    }
}

/// Refuses to overwrite or delete a remote object that changed after the scan.
async fn ensure_remote_unchanged(
    ctx: &JobContext,
    job: &SyncJobRecord,
) -> Result<Option<ObjectInfo>, EngineError> {
    let current = ctx.client.head(&job.remote_key).await?;
    let current_etag = current.as_ref().and_then(|info| info.etag.as_deref());
    let unchanged = match (&job.expected_etag, &current) {
        (None, None) => true,
        (Some(expected), Some(_)) => current_etag.is_none_or(|etag| etag == expected),
        // already gone: only a delete may proceed
        (Some(_), None) => job.kind == JobKind::DeleteRemote,
        (None, Some(_)) => false,
    };
    if !unchanged {
        return Err(EngineError::Conflict(format!(
            "'{}' changed remotely since the scan",
            job.remote_key
        )));
    }
    Ok(current)
}

async fn upload(ctx: &JobContext, job: &SyncJobRecord) -> Result<JobResult, EngineError> {
    let path = local_path_for(&ctx.local_root, &job.rel_path)?;
    let md5 = hash_file(&path, ctx.chunk_size).await?;
    let meta = tokio::fs::metadata(&path).await?;
    ensure_remote_unchanged(ctx, job).await?;

    let info = ctx
        .client
        .put_file(&job.remote_key, &path, clamp_chunk(ctx.chunk_size))
        .await?;
    if ctx.record_metadata {
        ctx.store
            .upsert_file_logged(
                &FileInput {
                    backend_id: ctx.backend_id.clone(),
                    path: job.remote_key.clone(),
                    size: info.size,
                    md5: Some(md5),
                    sha256: None,
                    etag: info.etag.clone(),
                    modified_at: info.modified.unwrap_or_else(now_unix),
                    is_dir: false,
                },
                &ctx.client_id,
            )
            .await?;
    }
    Ok(JobResult {
        bytes: info.size,
        entry: EntryUpdate::Set(SyncEntryRecord {
            rel_path: job.rel_path.clone(),
            remote_key: job.remote_key.clone(),
            local_size: Some(meta.len() as i64),
            local_mtime: Some(mtime_of(&meta)),
            remote_size: Some(info.size),
            remote_etag: info.etag,
            remote_mtime: info.modified,
            synced_at: 0,
        }),
    })
}

async fn download(ctx: &JobContext, job: &SyncJobRecord) -> Result<JobResult, EngineError> {
    let target = local_path_for(&ctx.local_root, &job.rel_path)?;
    let body = ctx.client.get(&job.remote_key).await?;
    let expected = job
        .expected_etag
        .as_deref()
        .filter(|etag| is_md5_hex(etag))
        .map(str::to_ascii_lowercase);
    let bytes = match write_atomically(&target, body, ctx.chunk_size, expected.as_deref()).await? {
        Written::Complete(bytes) => bytes,
        Written::Mismatch => {
            return Err(EngineError::Conflict(format!(
                "'{}' changed remotely since the scan",
                job.remote_key
            )));
        }
    };
    let meta = tokio::fs::metadata(&target).await?;
    Ok(JobResult {
        bytes,
        entry: EntryUpdate::Set(SyncEntryRecord {
            rel_path: job.rel_path.clone(),
            remote_key: job.remote_key.clone(),
            local_size: Some(meta.len() as i64),
            local_mtime: Some(mtime_of(&meta)),
            remote_size: Some(bytes),
            remote_etag: job.expected_etag.clone(),
            remote_mtime: job.remote_mtime,
            synced_at: 0,
        }),
    })
}

async fn delete_remote(ctx: &JobContext, job: &SyncJobRecord) -> Result<JobResult, EngineError> {
    if ensure_remote_unchanged(ctx, job).await?.is_some() {
        ctx.client.delete(&job.remote_key).await?;
    }
    if ctx.record_metadata
        && let Some(file) = ctx.store.get_file(&ctx.backend_id, &job.remote_key).await?
    {
        ctx.store.delete_file_logged(file.id, &ctx.client_id).await?;
    }
    Ok(JobResult {
        bytes: 0,
        entry: EntryUpdate::Remove,
    })
}

async fn delete_local(ctx: &JobContext, job: &SyncJobRecord) -> Result<JobResult, EngineError> {
    let path = local_path_for(&ctx.local_root, &job.rel_path)?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(JobResult {
        bytes: 0,
        entry: EntryUpdate::Remove,
    })
}

fn clamp_chunk(chunk_size: u64) -> usize {
    chunk_size.clamp(MIN_CHUNK, MAX_CHUNK) as usize
}

/// Hashes a file in `chunk_size` pieces without holding more than one chunk.
pub(crate) async fn hash_file(path: &Path, chunk_size: u64) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; clamp_chunk(chunk_size)];
    let mut md5 = Context::new();
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        md5.consume(&buf[..read]);
    }
    Ok(format!("{:x}", md5.compute()))
}

enum Written {
    Complete(i64),
    /// The body's md5 differed from the expected one; nothing was written.
    Mismatch,
}

/// Streams a body into a hidden sibling and renames it over the target, so a
/// reader never sees a half-written file. With `expected_md5` the body is
/// verified before the rename.
async fn write_atomically(
    target: &Path,
    body: ObjectBody,
    chunk_size: u64,
    expected_md5: Option<&str>,
) -> Result<Written, EngineError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let result = match write_partial(&partial, body, chunk_size).await {
        Ok((_, md5)) if expected_md5.is_some_and(|expected| expected != md5) => {
            Ok(Written::Mismatch)
        }
        Ok((bytes, _)) => match tokio::fs::rename(&partial, target).await {
            Ok(()) => return Ok(Written::Complete(bytes)),
            Err(err) => Err(err.into()),
        },
        Err(err) => Err(err),
    };
    let _ = tokio::fs::remove_file(&partial).await;
    result
}

async fn write_partial(
    partial: &Path,
    mut body: ObjectBody,
    chunk_size: u64,
) -> Result<(i64, String), EngineError> {
    let file = tokio::fs::File::create(partial).await?;
    let mut writer = BufWriter::with_capacity(clamp_chunk(chunk_size), file);
    let mut md5 = Context::new();
    let mut bytes = 0i64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        md5.consume(&chunk);
        writer.write_all(&chunk).await?;
        bytes += chunk.len() as i64;
    }
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok((bytes, format!("{:x}", md5.compute())))
}

pub(crate) fn is_md5_hex(etag: &str) -> bool {
    etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_md5_etags_are_verified() {
        assert!(is_md5_hex("9e107d9d372bb6826bd81d3542a419d6"));
        assert!(!is_md5_hex("9e107d9d372bb6826bd81d3542a419d6-3"));
        assert!(!is_md5_hex("abc"));
    }

    #[test]
    fn chunk_sizes_are_clamped() {
        assert_eq!(clamp_chunk(1), MIN_CHUNK as usize);
        assert_eq!(clamp_chunk(u64::MAX), MAX_CHUNK as usize);
        assert_eq!(clamp_chunk(5 * 1024 * 1024), 5 * 1024 * 1024);
    }

    fn body_of(data: &[u8], piece: usize) -> ObjectBody {
        let chunks: Vec<Result<bytes::Bytes, strata_core::StorageError>> = data
            .chunks(piece)
            .map(|chunk| Ok(bytes::Bytes::copy_from_slice(chunk)))
            .collect();
        futures_util::stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn atomic_writes_stream_and_leave_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/out.bin");
        let payload = vec![7u8; 200_000];
        let digest = format!("{:x}", md5::compute(&payload));
        let written = write_atomically(&target, body_of(&payload, 10_000), 1, Some(&digest))
            .await
            .unwrap();
        assert!(matches!(written, Written::Complete(200_000)));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), payload);
        assert!(!partial_path(&target).exists());
        assert_eq!(hash_file(&target, 1).await.unwrap(), digest);
    }

    #[tokio::test]
    async fn mismatched_bodies_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        tokio::fs::write(&target, b"previous").await.unwrap();
        let written = write_atomically(
            &target,
            body_of(b"tampered", 3),
            1,
            Some("9e107d9d372bb6826bd81d3542a419d6"),
        )
        .await
        .unwrap();
        assert!(matches!(written, Written::Mismatch));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"previous");
        assert!(!partial_path(&target).exists());
    }
}
