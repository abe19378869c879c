use sqlx::Row;

use super::{MetadataStore, StoreError, StoreKind, now_unix};

/// One forward step of the schema. Statements use `{pk}` for an auto-increment
/// primary key and `{key}` for byte-ordered text columns; both are rendered per
/// engine.
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    up: &'static [&'static str],
    down: &'static [&'static str],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: i64,
    pub description: &'static str,
    pub applied_at: Option<i64>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "core catalogue",
        up: &[
            "CREATE TABLE IF NOT EXISTS backends (
                id {key} PRIMARY KEY,
                name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                region TEXT,
                bucket TEXT NOT NULL,
                use_ssl BIGINT NOT NULL DEFAULT 1,
                access_key TEXT NOT NULL,
                secret_key TEXT NOT NULL,
                file_count BIGINT NOT NULL DEFAULT 0,
                total_bytes BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                deleted_at BIGINT
            )",
            "CREATE TABLE IF NOT EXISTS files (
                id {pk},
                backend_id {key} NOT NULL REFERENCES backends(id),
                path {key} NOT NULL,
                size BIGINT NOT NULL DEFAULT 0,
                md5_hash TEXT,
                sha256_hash TEXT,
                etag TEXT,
                modified_at BIGINT NOT NULL,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                is_dir BIGINT NOT NULL DEFAULT 0,
                parent_id BIGINT REFERENCES files(id),
                deleted_at BIGINT,
                UNIQUE (backend_id, path)
            )",
            "CREATE INDEX IF NOT EXISTS idx_files_active ON files(backend_id, deleted_at)",
            "CREATE TABLE IF NOT EXISTS tags (
                id {pk},
                file_id BIGINT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                key {key} NOT NULL,
                value {key} NOT NULL,
                created_at BIGINT NOT NULL,
                UNIQUE (file_id, key, value)
            )",
            "CREATE INDEX IF NOT EXISTS idx_tags_key_value ON tags(key, value)",
            "CREATE TABLE IF NOT EXISTS filters (
                id {pk},
                virtual_path {key} NOT NULL UNIQUE,
                name TEXT NOT NULL,
                query_expression TEXT NOT NULL,
                description TEXT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sync_configs (
                id {pk},
                name {key} NOT NULL UNIQUE,
                source_path TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                direction TEXT NOT NULL,
                enabled BIGINT NOT NULL DEFAULT 1,
                interval_secs BIGINT NOT NULL DEFAULT 300,
                workers BIGINT NOT NULL DEFAULT 4,
                chunk_size BIGINT NOT NULL DEFAULT 5242880,
                ignore_patterns TEXT NOT NULL DEFAULT '[]',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sync_states (
                id {pk},
                sync_config_id BIGINT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                backend_id {key} NOT NULL,
                client_id {key} NOT NULL,
                phase TEXT NOT NULL DEFAULT 'idle',
                last_sync_at BIGINT,
                cursor TEXT,
                change_cursor BIGINT NOT NULL DEFAULT 0,
                files_scanned BIGINT NOT NULL DEFAULT 0,
                files_synced BIGINT NOT NULL DEFAULT 0,
                bytes_synced BIGINT NOT NULL DEFAULT 0,
                error_count BIGINT NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at BIGINT NOT NULL,
                UNIQUE (sync_config_id, backend_id, client_id)
            )",
            "CREATE TABLE IF NOT EXISTS file_changes (
                id {pk},
                file_id BIGINT REFERENCES files(id),
                backend_id {key} NOT NULL,
                path {key} NOT NULL,
                kind TEXT NOT NULL,
                occurred_at BIGINT NOT NULL,
                client_id TEXT NOT NULL,
                old_path TEXT,
                new_path TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_file_changes_backend ON file_changes(backend_id, id)",
        ],
        down: &[
            "DROP TABLE IF EXISTS file_changes",
            "DROP TABLE IF EXISTS sync_states",
            "DROP TABLE IF EXISTS sync_configs",
            "DROP TABLE IF EXISTS filters",
            "DROP TABLE IF EXISTS tags",
            "DROP TABLE IF EXISTS files",
            "DROP TABLE IF EXISTS backends",
        ],
    },
    Migration {
        version: 2,
        description: "sync job queue, baselines and conflicts",
        up: &[
            "CREATE TABLE IF NOT EXISTS sync_jobs (
                id {pk},
                sync_state_id BIGINT NOT NULL REFERENCES sync_states(id) ON DELETE CASCADE,
                batch BIGINT NOT NULL,
                kind TEXT NOT NULL,
                rel_path {key} NOT NULL,
                remote_key TEXT NOT NULL,
                size BIGINT NOT NULL DEFAULT 0,
                expected_etag TEXT,
                remote_mtime BIGINT,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt BIGINT NOT NULL DEFAULT 0,
                last_error TEXT,
                UNIQUE (sync_state_id, kind, rel_path)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_jobs_status ON sync_jobs(sync_state_id, status, id)",
            "CREATE TABLE IF NOT EXISTS sync_entries (
                sync_state_id BIGINT NOT NULL REFERENCES sync_states(id) ON DELETE CASCADE,
                rel_path {key} NOT NULL,
                remote_key TEXT NOT NULL,
                local_size BIGINT,
                local_mtime BIGINT,
                remote_size BIGINT,
                remote_etag TEXT,
                remote_mtime BIGINT,
                synced_at BIGINT NOT NULL,
                PRIMARY KEY (sync_state_id, rel_path)
            )",
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id {pk},
                sync_config_id BIGINT NOT NULL REFERENCES sync_configs(id) ON DELETE CASCADE,
                rel_path TEXT NOT NULL,
                winner TEXT NOT NULL,
                discarded_size BIGINT,
                discarded_mtime BIGINT,
                discarded_etag TEXT,
                reason TEXT NOT NULL,
                created_at BIGINT NOT NULL
            )",
        ],
        down: &[
            "DROP TABLE IF EXISTS sync_conflicts",
            "DROP TABLE IF EXISTS sync_entries",
            "DROP TABLE IF EXISTS sync_jobs",
        ],
    },
];

const LEDGER_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version BIGINT PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at BIGINT NOT NULL
)";

fn render(statement: &str, kind: StoreKind) -> String {
    let (pk, key) = match kind {
        StoreKind::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "TEXT"),
        StoreKind::Postgres => ("BIGSERIAL PRIMARY KEY", "TEXT COLLATE \"C\""),
    };
    statement.replace("{pk}", pk).replace("{key}", key)
}

impl MetadataStore {
    /// Applies every pending migration in order, each in its own transaction.
    /// Returns the versions applied by this call.
    pub async fn migrate(&self) -> Result<Vec<i64>, StoreError> {
        let _guard = self.write_lock().await;
        sqlx::query(LEDGER_DDL).execute(&self.pool).await?;
        let applied = self.applied_versions().await?;

        let mut newly_applied = Vec::new();
        for migration in MIGRATIONS {
            if applied.iter().any(|(version, _)| *version == migration.version) {
                continue;
            }
            let wrap = |source| StoreError::Migration {
                version: migration.version,
                description: migration.description,
                source,
            };
            let mut tx = self.pool.begin().await?;
            for statement in migration.up {
                let sql = render(statement, self.kind);
                sqlx::query(&sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(wrap)?;
            }
            sqlx::query(
                "INSERT INTO schema_migrations (version, description, applied_at) VALUES ($1, $2, $3)",
            )
            .bind(migration.version)
            .bind(migration.description)
            .bind(now_unix())
            .execute(&mut *tx)
            .await
            .map_err(wrap)?;
            tx.commit().await.map_err(wrap)?;
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applied schema migration"
            );
            newly_applied.push(migration.version);
        }
        Ok(newly_applied)
    }

    pub async fn migration_status(&self) -> Result<Vec<MigrationStatus>, StoreError> {
        sqlx::query(LEDGER_DDL).execute(&self.pool).await?;
        let applied = self.applied_versions().await?;
        Ok(MIGRATIONS
            .iter()
            .map(|migration| MigrationStatus {
                version: migration.version,
                description: migration.description,
                applied_at: applied
                    .iter()
                    .find(|(version, _)| *version == migration.version)
                    .map(|(_, at)| *at),
            })
            .collect())
    }

    /// Best-effort undo of the most recent applied migration.
    pub async fn rollback_last(&self) -> Result<i64, StoreError> {
        let _guard = self.write_lock().await;
        let applied = self.applied_versions().await?;
        let Some((version, _)) = applied.iter().max_by_key(|(version, _)| *version).copied() else {
            return Err(StoreError::NothingToRollBack);
        };
        let Some(migration) = MIGRATIONS.iter().find(|m| m.version == version) else {
            return Err(StoreError::InvalidValue {
                column: "schema_migrations.version",
                value: version.to_string(),
            });
        };

        let mut tx = self.pool.begin().await?;
        for statement in migration.down {
            let sql = render(statement, self.kind);
            sqlx::query(&sql).execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::warn!(version, "rolled back schema migration");
        Ok(version)
    }

    async fn applied_versions(&self) -> Result<Vec<(i64, i64)>, StoreError> {
        let rows = sqlx::query("SELECT version, applied_at FROM schema_migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("version")?, row.try_get("applied_at")?));
        }
        Ok(out)
    }
}
