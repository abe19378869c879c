use sqlx::Row;
use sqlx::any::AnyRow;
use strata_core::ConnectionInfo;

use super::{
    BackendRecord, MetadataStore, NewBackend, StoreError, bool_to_int, get_bool, now_unix,
};

const BACKEND_COLUMNS: &str = "id, name, endpoint, region, bucket, use_ssl, access_key, secret_key, file_count, total_bytes, created_at, updated_at";

fn backend_from_row(row: &AnyRow) -> Result<BackendRecord, StoreError> {
    Ok(BackendRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        connection: ConnectionInfo {
            endpoint: row.try_get("endpoint")?,
            region: row.try_get("region")?,
            bucket: row.try_get("bucket")?,
            use_ssl: get_bool(row, "use_ssl")?,
        },
        access_key_enc: row.try_get("access_key")?,
        secret_key_enc: row.try_get("secret_key")?,
        file_count: row.try_get("file_count")?,
        total_bytes: row.try_get("total_bytes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl MetadataStore {
    /// Inserts a backend. A soft-deleted backend with the same id is revived with
    /// the new descriptor; an active one is a duplicate.
    pub async fn create_backend(&self, backend: &NewBackend) -> Result<BackendRecord, StoreError> {
        let _guard = self.write_lock().await;
        let sql = format!(
            "INSERT INTO backends (id, name, endpoint, region, bucket, use_ssl, access_key, secret_key, file_count, total_bytes, created_at, updated_at, deleted_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, 0, $9, $9, NULL)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                endpoint = excluded.endpoint,
                region = excluded.region,
                bucket = excluded.bucket,
                use_ssl = excluded.use_ssl,
                access_key = excluded.access_key,
                secret_key = excluded.secret_key,
                file_count = 0,
                total_bytes = 0,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = NULL
             WHERE backends.deleted_at IS NOT NULL
             RETURNING {BACKEND_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&backend.id)
            .bind(&backend.name)
            .bind(&backend.connection.endpoint)
            .bind(&backend.connection.region)
            .bind(&backend.connection.bucket)
            .bind(bool_to_int(backend.connection.use_ssl))
            .bind(&backend.access_key_enc)
            .bind(&backend.secret_key_enc)
            .bind(now_unix())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => backend_from_row(&row),
            None => Err(StoreError::Duplicate(format!("backend '{}'", backend.id))),
        }
    }

    pub async fn get_backend(&self, id: &str) -> Result<Option<BackendRecord>, StoreError> {
        let sql = format!("SELECT {BACKEND_COLUMNS} FROM backends WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(backend_from_row).transpose()
    }

    pub async fn list_backends(&self) -> Result<Vec<BackendRecord>, StoreError> {
        let sql =
            format!("SELECT {BACKEND_COLUMNS} FROM backends WHERE deleted_at IS NULL ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(backend_from_row).collect()
    }

    /// Writes the mutable descriptor fields of an active backend. The id never
    /// changes.
    pub async fn update_backend(
        &self,
        backend: &BackendRecord,
    ) -> Result<Option<BackendRecord>, StoreError> {
        let _guard = self.write_lock().await;
        let sql = format!(
            "UPDATE backends SET name = $2, endpoint = $3, region = $4, bucket = $5, use_ssl = $6,
                access_key = $7, secret_key = $8, updated_at = $9
             WHERE id = $1 AND deleted_at IS NULL
             RETURNING {BACKEND_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&backend.id)
            .bind(&backend.name)
            .bind(&backend.connection.endpoint)
            .bind(&backend.connection.region)
            .bind(&backend.connection.bucket)
            .bind(bool_to_int(backend.connection.use_ssl))
            .bind(&backend.access_key_enc)
            .bind(&backend.secret_key_enc)
            .bind(now_unix())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(backend_from_row).transpose()
    }

    /// Soft-deletes the backend and every file it owns. Returns `false` when no
    /// active backend had that id.
    pub async fn delete_backend(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock().await;
        let now = now_unix();
        let mut tx = self.begin().await?;
        let result =
            sqlx::query("UPDATE backends SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL")
                .bind(id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE files SET deleted_at = $2, updated_at = $2 WHERE backend_id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.notify_backend_changed(id);
        Ok(true)
    }

    /// Recomputes `file_count`/`total_bytes` from active, non-directory files.
    pub async fn refresh_backend_stats(&self, id: &str) -> Result<(i64, i64), StoreError> {
        let _guard = self.write_lock().await;
        let row = sqlx::query(
            "UPDATE backends SET
                file_count = (SELECT COUNT(*) FROM files WHERE backend_id = $1 AND deleted_at IS NULL AND is_dir = 0),
                total_bytes = (SELECT CAST(COALESCE(SUM(size), 0) AS BIGINT) FROM files WHERE backend_id = $1 AND deleted_at IS NULL AND is_dir = 0),
                updated_at = $2
             WHERE id = $1 AND deleted_at IS NULL
             RETURNING file_count, total_bytes",
        )
        .bind(id)
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::MissingRow("backends"))?;
        Ok((row.try_get("file_count")?, row.try_get("total_bytes")?))
    }
}
