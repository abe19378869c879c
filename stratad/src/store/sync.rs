use sqlx::any::AnyRow;
use sqlx::{Any, Row, Transaction};

use super::{
    ConflictInput, ConflictRecord, JobKind, JobStatus, MetadataStore, NewSyncConfig, StoreError,
    SyncConfigRecord, SyncDirection, SyncEntryRecord, SyncJobInput, SyncJobRecord, SyncPhase,
    SyncStateRecord, bool_to_int, get_bool, map_unique, now_unix,
};

const CONFIG_COLUMNS: &str = "id, name, source_path, dest_path, direction, enabled, interval_secs, workers, chunk_size, ignore_patterns, created_at, updated_at";
const STATE_COLUMNS: &str = "id, sync_config_id, backend_id, client_id, phase, last_sync_at, cursor, change_cursor, files_scanned, files_synced, bytes_synced, error_count, last_error, updated_at";
const JOB_COLUMNS: &str = "id, sync_state_id, batch, kind, rel_path, remote_key, size, expected_etag, remote_mtime, status, attempt, last_error";
const ENTRY_COLUMNS: &str = "rel_path, remote_key, local_size, local_mtime, remote_size, remote_etag, remote_mtime, synced_at";
const CONFLICT_COLUMNS: &str = "id, sync_config_id, rel_path, winner, discarded_size, discarded_mtime, discarded_etag, reason, created_at";

fn config_from_row(row: &AnyRow) -> Result<SyncConfigRecord, StoreError> {
    let direction: String = row.try_get("direction")?;
    let ignore: String = row.try_get("ignore_patterns")?;
    let interval: i64 = row.try_get("interval_secs")?;
    let workers: i64 = row.try_get("workers")?;
    let chunk: i64 = row.try_get("chunk_size")?;
    Ok(SyncConfigRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        source_path: row.try_get("source_path")?,
        dest_path: row.try_get("dest_path")?,
        direction: SyncDirection::parse(&direction)?,
        enabled: get_bool(row, "enabled")?,
        interval_secs: interval.max(0) as u64,
        workers: workers.clamp(1, u32::MAX as i64) as u32,
        chunk_size: chunk.max(0) as u64,
        ignore_patterns: serde_json::from_str(&ignore)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn state_from_row(row: &AnyRow) -> Result<SyncStateRecord, StoreError> {
    let phase: String = row.try_get("phase")?;
    Ok(SyncStateRecord {
        id: row.try_get("id")?,
        sync_config_id: row.try_get("sync_config_id")?,
        backend_id: row.try_get("backend_id")?,
        client_id: row.try_get("client_id")?,
        phase: SyncPhase::parse(&phase)?,
        last_sync_at: row.try_get("last_sync_at")?,
        cursor: row.try_get("cursor")?,
        change_cursor: row.try_get("change_cursor")?,
        files_scanned: row.try_get("files_scanned")?,
        files_synced: row.try_get("files_synced")?,
        bytes_synced: row.try_get("bytes_synced")?,
        error_count: row.try_get("error_count")?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &AnyRow) -> Result<SyncJobRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(SyncJobRecord {
        id: row.try_get("id")?,
        sync_state_id: row.try_get("sync_state_id")?,
        batch: row.try_get("batch")?,
        kind: JobKind::parse(&kind)?,
        rel_path: row.try_get("rel_path")?,
        remote_key: row.try_get("remote_key")?,
        size: row.try_get("size")?,
        expected_etag: row.try_get("expected_etag")?,
        remote_mtime: row.try_get("remote_mtime")?,
        status: JobStatus::parse(&status)?,
        attempt: row.try_get("attempt")?,
        last_error: row.try_get("last_error")?,
    })
}

fn entry_from_row(row: &AnyRow) -> Result<SyncEntryRecord, StoreError> {
    Ok(SyncEntryRecord {
        rel_path: row.try_get("rel_path")?,
        remote_key: row.try_get("remote_key")?,
        local_size: row.try_get("local_size")?,
        local_mtime: row.try_get("local_mtime")?,
        remote_size: row.try_get("remote_size")?,
        remote_etag: row.try_get("remote_etag")?,
        remote_mtime: row.try_get("remote_mtime")?,
        synced_at: row.try_get("synced_at")?,
    })
}

fn conflict_from_row(row: &AnyRow) -> Result<ConflictRecord, StoreError> {
    Ok(ConflictRecord {
        id: row.try_get("id")?,
        sync_config_id: row.try_get("sync_config_id")?,
        rel_path: row.try_get("rel_path")?,
        winner: row.try_get("winner")?,
        discarded_size: row.try_get("discarded_size")?,
        discarded_mtime: row.try_get("discarded_mtime")?,
        discarded_etag: row.try_get("discarded_etag")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

/// What a completed job leaves behind in the per-path baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryUpdate {
    Set(SyncEntryRecord),
    Remove,
}

async fn write_entry(
    tx: &mut Transaction<'static, Any>,
    state_id: i64,
    rel_path: &str,
    update: &EntryUpdate,
    now: i64,
) -> Result<(), StoreError> {
    match update {
        EntryUpdate::Set(entry) => {
            sqlx::query(
                "INSERT INTO sync_entries (sync_state_id, rel_path, remote_key, local_size, local_mtime, remote_size, remote_etag, remote_mtime, synced_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 ON CONFLICT (sync_state_id, rel_path) DO UPDATE SET
                    remote_key = excluded.remote_key,
                    local_size = excluded.local_size,
                    local_mtime = excluded.local_mtime,
                    remote_size = excluded.remote_size,
                    remote_etag = excluded.remote_etag,
                    remote_mtime = excluded.remote_mtime,
                    synced_at = excluded.synced_at",
            )
            .bind(state_id)
            .bind(rel_path)
            .bind(&entry.remote_key)
            .bind(entry.local_size)
            .bind(entry.local_mtime)
            .bind(entry.remote_size)
            .bind(&entry.remote_etag)
            .bind(entry.remote_mtime)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        EntryUpdate::Remove => {
            sqlx::query("DELETE FROM sync_entries WHERE sync_state_id = $1 AND rel_path = $2")
                .bind(state_id)
                .bind(rel_path)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

impl MetadataStore {
    pub async fn create_sync_config(
        &self,
        config: &NewSyncConfig,
    ) -> Result<SyncConfigRecord, StoreError> {
        let _guard = self.write_lock().await;
        let ignore = serde_json::to_string(&config.ignore_patterns)?;
        let row = sqlx::query(&format!(
            "INSERT INTO sync_configs (name, source_path, dest_path, direction, enabled, interval_secs, workers, chunk_size, ignore_patterns, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
             ON CONFLICT (name) DO NOTHING
             RETURNING {CONFIG_COLUMNS}"
        ))
        .bind(&config.name)
        .bind(&config.source_path)
        .bind(&config.dest_path)
        .bind(config.direction.as_str())
        .bind(bool_to_int(config.enabled))
        .bind(config.interval_secs as i64)
        .bind(config.workers as i64)
        .bind(config.chunk_size as i64)
        .bind(ignore)
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => config_from_row(&row),
            None => Err(StoreError::Duplicate(format!("sync config '{}'", config.name))),
        }
    }

    pub async fn get_sync_config(&self, name: &str) -> Result<Option<SyncConfigRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM sync_configs WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    pub async fn get_sync_config_by_id(
        &self,
        id: i64,
    ) -> Result<Option<SyncConfigRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM sync_configs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    pub async fn list_sync_configs(&self) -> Result<Vec<SyncConfigRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONFIG_COLUMNS} FROM sync_configs ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(config_from_row).collect()
    }

    pub async fn update_sync_config(
        &self,
        config: &SyncConfigRecord,
    ) -> Result<Option<SyncConfigRecord>, StoreError> {
        let _guard = self.write_lock().await;
        let ignore = serde_json::to_string(&config.ignore_patterns)?;
        let row = sqlx::query(&format!(
            "UPDATE sync_configs SET name = $2, source_path = $3, dest_path = $4, direction = $5,
                enabled = $6, interval_secs = $7, workers = $8, chunk_size = $9, ignore_patterns = $10,
                updated_at = $11
             WHERE id = $1
             RETURNING {CONFIG_COLUMNS}"
        ))
        .bind(config.id)
        .bind(&config.name)
        .bind(&config.source_path)
        .bind(&config.dest_path)
        .bind(config.direction.as_str())
        .bind(bool_to_int(config.enabled))
        .bind(config.interval_secs as i64)
        .bind(config.workers as i64)
        .bind(config.chunk_size as i64)
        .bind(ignore)
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_unique(err, format!("sync config '{}'", config.name)))?;
        row.as_ref().map(config_from_row).transpose()
    }

    /// Removes a config together with its states, jobs, baselines and conflicts.
    pub async fn delete_sync_config(&self, id: i64) -> Result<bool, StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        for statement in [
            "DELETE FROM sync_jobs WHERE sync_state_id IN (SELECT id FROM sync_states WHERE sync_config_id = $1)",
            "DELETE FROM sync_entries WHERE sync_state_id IN (SELECT id FROM sync_states WHERE sync_config_id = $1)",
            "DELETE FROM sync_states WHERE sync_config_id = $1",
            "DELETE FROM sync_conflicts WHERE sync_config_id = $1",
        ] {
            sqlx::query(statement).bind(id).execute(&mut *tx).await?;
        }
        let result = sqlx::query("DELETE FROM sync_configs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_or_create_sync_state(
        &self,
        sync_config_id: i64,
        backend_id: &str,
        client_id: &str,
    ) -> Result<SyncStateRecord, StoreError> {
        let _guard = self.write_lock().await;
        sqlx::query(
            "INSERT INTO sync_states (sync_config_id, backend_id, client_id, phase, updated_at)
             VALUES ($1, $2, $3, 'idle', $4)
             ON CONFLICT (sync_config_id, backend_id, client_id) DO NOTHING",
        )
        .bind(sync_config_id)
        .bind(backend_id)
        .bind(client_id)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM sync_states WHERE sync_config_id = $1 AND backend_id = $2 AND client_id = $3"
        ))
        .bind(sync_config_id)
        .bind(backend_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::MissingRow("sync_states"))?;
        state_from_row(&row)
    }

    pub async fn get_sync_state(&self, id: i64) -> Result<Option<SyncStateRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {STATE_COLUMNS} FROM sync_states WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    /// States of one config, or of every config when `sync_config_id` is `None`.
    pub async fn list_sync_states(
        &self,
        sync_config_id: Option<i64>,
    ) -> Result<Vec<SyncStateRecord>, StoreError> {
        let rows = match sync_config_id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {STATE_COLUMNS} FROM sync_states WHERE sync_config_id = $1 ORDER BY backend_id, client_id"
                ))
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {STATE_COLUMNS} FROM sync_states ORDER BY sync_config_id, backend_id, client_id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(state_from_row).collect()
    }

    pub async fn set_sync_phase(&self, state_id: i64, phase: SyncPhase) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        sqlx::query("UPDATE sync_states SET phase = $2, updated_at = $3 WHERE id = $1")
            .bind(state_id)
            .bind(phase.as_str())
            .bind(now_unix())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_scan(
        &self,
        state_id: i64,
        files_scanned: i64,
        batch: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        sqlx::query(
            "UPDATE sync_states SET files_scanned = files_scanned + $2, cursor = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(state_id)
        .bind(files_scanned)
        .bind(format!("{batch}:0"))
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a clean run: back to idle, consecutive errors cleared.
    pub async fn record_sync_success(
        &self,
        state_id: i64,
        change_cursor: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let now = now_unix();
        sqlx::query(
            "UPDATE sync_states SET phase = 'idle', last_sync_at = $2, change_cursor = $3,
                error_count = 0, last_error = NULL, updated_at = $2
             WHERE id = $1",
        )
        .bind(state_id)
        .bind(now)
        .bind(change_cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_sync_failure(&self, state_id: i64, message: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        sqlx::query(
            "UPDATE sync_states SET phase = 'error', error_count = error_count + 1, last_error = $2, updated_at = $3
             WHERE id = $1",
        )
        .bind(state_id)
        .bind(message)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persists a scan's job list. A job already queued for the same path and kind
    /// is reset to pending with the new batch.
    pub async fn enqueue_jobs(
        &self,
        state_id: i64,
        batch: i64,
        jobs: &[SyncJobInput],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        for job in jobs {
            sqlx::query(
                "INSERT INTO sync_jobs (sync_state_id, batch, kind, rel_path, remote_key, size, expected_etag, remote_mtime, status, attempt)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0)
                 ON CONFLICT (sync_state_id, kind, rel_path) DO UPDATE SET
                    batch = excluded.batch,
                    remote_key = excluded.remote_key,
                    size = excluded.size,
                    expected_etag = excluded.expected_etag,
                    remote_mtime = excluded.remote_mtime,
                    status = 'pending',
                    attempt = 0,
                    last_error = NULL",
            )
            .bind(state_id)
            .bind(batch)
            .bind(job.kind.as_str())
            .bind(&job.rel_path)
            .bind(&job.remote_key)
            .bind(job.size)
            .bind(&job.expected_etag)
            .bind(job.remote_mtime)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Atomically moves the oldest pending job of a state to `running`.
    pub async fn claim_next_job(&self, state_id: i64) -> Result<Option<SyncJobRecord>, StoreError> {
        let _guard = self.write_lock().await;
        let row = sqlx::query(&format!(
            "UPDATE sync_jobs SET status = 'running', attempt = attempt + 1
             WHERE id = (
                SELECT id FROM sync_jobs WHERE sync_state_id = $1 AND status = 'pending' ORDER BY id ASC LIMIT 1
             ) AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(state_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Completes a job: job row, baseline entry and state counters move together.
    pub async fn complete_job(
        &self,
        job: &SyncJobRecord,
        entry: &EntryUpdate,
        bytes: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let now = now_unix();
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE sync_jobs SET status = 'done', last_error = NULL WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
        write_entry(&mut tx, job.sync_state_id, &job.rel_path, entry, now).await?;
        sqlx::query(
            "UPDATE sync_states SET files_synced = files_synced + 1, bytes_synced = bytes_synced + $2,
                cursor = $3, updated_at = $4
             WHERE id = $1",
        )
        .bind(job.sync_state_id)
        .bind(bytes)
        .bind(format!("{}:{}", job.batch, job.id))
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Records a failed job and surfaces its message on the state. The error
    /// counter moves once per failed run, in `record_sync_failure`.
    pub async fn fail_job(&self, job: &SyncJobRecord, message: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let now = now_unix();
        let mut tx = self.begin().await?;
        sqlx::query("UPDATE sync_jobs SET status = 'failed', last_error = $2 WHERE id = $1")
            .bind(job.id)
            .bind(message)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE sync_states SET last_error = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(job.sync_state_id)
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Jobs left `running` by an interrupted process go back to `pending`.
    pub async fn reset_running_jobs(&self, state_id: i64) -> Result<u64, StoreError> {
        let _guard = self.write_lock().await;
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'pending' WHERE sync_state_id = $1 AND status = 'running'",
        )
        .bind(state_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_jobs(&self, state_id: i64, status: JobStatus) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sync_jobs WHERE sync_state_id = $1 AND status = $2",
        )
        .bind(state_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn list_jobs(&self, state_id: i64) -> Result<Vec<SyncJobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE sync_state_id = $1 ORDER BY id ASC"
        ))
        .bind(state_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Drops finished jobs once their batch is fully drained.
    pub async fn clear_finished_jobs(&self, state_id: i64) -> Result<u64, StoreError> {
        let _guard = self.write_lock().await;
        let result = sqlx::query(
            "DELETE FROM sync_jobs WHERE sync_state_id = $1 AND status IN ('done', 'failed')",
        )
        .bind(state_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_sync_entries(&self, state_id: i64) -> Result<Vec<SyncEntryRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_entries WHERE sync_state_id = $1 ORDER BY rel_path"
        ))
        .bind(state_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Writes a baseline entry outside of any job, for paths found already in
    /// agreement (or gone from both sides) while scanning.
    pub async fn set_sync_entry(
        &self,
        state_id: i64,
        rel_path: &str,
        update: &EntryUpdate,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        write_entry(&mut tx, state_id, rel_path, update, now_unix()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Records a conflict unless the latest one for the same path already
    /// describes it: an unresolved divergence is seen again on every run.
    /// Returns the new row id, or `None` for a repeat.
    pub async fn record_conflict(
        &self,
        conflict: &ConflictInput,
    ) -> Result<Option<i64>, StoreError> {
        let _guard = self.write_lock().await;
        let latest = sqlx::query(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             WHERE sync_config_id = $1 AND rel_path = $2
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(conflict.sync_config_id)
        .bind(&conflict.rel_path)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = latest {
            let latest = conflict_from_row(&row)?;
            if latest.winner == conflict.winner
                && latest.discarded_size == conflict.discarded_size
                && latest.discarded_mtime == conflict.discarded_mtime
                && latest.discarded_etag == conflict.discarded_etag
                && latest.reason == conflict.reason
            {
                return Ok(None);
            }
        }
        let row = sqlx::query(
            "INSERT INTO sync_conflicts (sync_config_id, rel_path, winner, discarded_size, discarded_mtime, discarded_etag, reason, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(conflict.sync_config_id)
        .bind(&conflict.rel_path)
        .bind(&conflict.winner)
        .bind(conflict.discarded_size)
        .bind(conflict.discarded_mtime)
        .bind(&conflict.discarded_etag)
        .bind(&conflict.reason)
        .bind(now_unix())
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(row.try_get("id")?))
    }

    pub async fn list_conflicts(
        &self,
        sync_config_id: Option<i64>,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let rows = match sync_config_id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE sync_config_id = $1 ORDER BY id ASC"
                ))
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts ORDER BY id ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(conflict_from_row).collect()
    }
}
