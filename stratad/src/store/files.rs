use sqlx::any::AnyRow;
use sqlx::{Any, Row, Transaction};

use super::changes::insert_change;
use super::{
    ChangeKind, FileInput, FileRecord, MetadataStore, StoreError, bool_to_int, get_bool, now_unix,
    parent_path,
};

pub(crate) const FILE_COLUMNS: &str = "id, backend_id, path, size, md5_hash, sha256_hash, etag, modified_at, created_at, updated_at, is_dir, parent_id";

pub(crate) fn file_from_row(row: &AnyRow) -> Result<FileRecord, StoreError> {
    Ok(FileRecord {
        id: row.try_get("id")?,
        backend_id: row.try_get("backend_id")?,
        path: row.try_get("path")?,
        size: row.try_get("size")?,
        md5: row.try_get("md5_hash")?,
        sha256: row.try_get("sha256_hash")?,
        etag: row.try_get("etag")?,
        modified_at: row.try_get("modified_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        is_dir: get_bool(row, "is_dir")?,
        parent_id: row.try_get("parent_id")?,
    })
}

pub(crate) fn qualified_file_columns() -> String {
    FILE_COLUMNS
        .split(", ")
        .map(|column| format!("f.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Prefix predicate on `files.path`. `substr`/`length` behave the same on both
/// engines, unlike `LIKE`.
const PATH_PREFIX: &str = "substr(path, 1, length($2)) = $2";

/// Outcome of an upsert: the stored row and the change it represents, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub file: FileRecord,
    pub change: Option<ChangeKind>,
}

async fn upsert_file_tx(
    tx: &mut Transaction<'static, Any>,
    input: &FileInput,
) -> Result<UpsertOutcome, StoreError> {
    let existing = sqlx::query(&format!(
        "SELECT {FILE_COLUMNS}, deleted_at FROM files WHERE backend_id = $1 AND path = $2"
    ))
    .bind(&input.backend_id)
    .bind(&input.path)
    .fetch_optional(&mut **tx)
    .await?;
    let change = match &existing {
        None => Some(ChangeKind::Create),
        Some(row) => {
            let deleted_at: Option<i64> = row.try_get("deleted_at")?;
            if deleted_at.is_some() {
                Some(ChangeKind::Create)
            } else if file_from_row(row)?.same_content(input) {
                None
            } else {
                Some(ChangeKind::Update)
            }
        }
    };

    let parent_id: Option<i64> = match parent_path(&input.path) {
        Some(parent) => {
            let row = sqlx::query(
                "SELECT id FROM files WHERE backend_id = $1 AND path = $2 AND is_dir = 1 AND deleted_at IS NULL",
            )
            .bind(&input.backend_id)
            .bind(parent)
            .fetch_optional(&mut **tx)
            .await?;
            row.map(|row| row.try_get("id")).transpose()?
        }
        None => None,
    };

    let now = now_unix();
    let row = sqlx::query(&format!(
        "INSERT INTO files (backend_id, path, size, md5_hash, sha256_hash, etag, modified_at, created_at, updated_at, is_dir, parent_id, deleted_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, $10, NULL)
         ON CONFLICT (backend_id, path) DO UPDATE SET
            size = excluded.size,
            md5_hash = excluded.md5_hash,
            sha256_hash = excluded.sha256_hash,
            etag = excluded.etag,
            modified_at = excluded.modified_at,
            updated_at = excluded.updated_at,
            is_dir = excluded.is_dir,
            parent_id = excluded.parent_id,
            deleted_at = NULL
         RETURNING {FILE_COLUMNS}"
    ))
    .bind(&input.backend_id)
    .bind(&input.path)
    .bind(input.size)
    .bind(&input.md5)
    .bind(&input.sha256)
    .bind(&input.etag)
    .bind(input.modified_at)
    .bind(now)
    .bind(bool_to_int(input.is_dir))
    .bind(parent_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(UpsertOutcome {
        file: file_from_row(&row)?,
        change,
    })
}

impl MetadataStore {
    pub async fn upsert_file(&self, input: &FileInput) -> Result<FileRecord, StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        let outcome = upsert_file_tx(&mut tx, input).await?;
        tx.commit().await?;
        if outcome.change.is_some() {
            self.notify_backend_changed(&input.backend_id);
        }
        Ok(outcome.file)
    }

    /// Upserts the file row and appends the matching change-log entry in one
    /// transaction. Unchanged content writes no log entry.
    pub async fn upsert_file_logged(
        &self,
        input: &FileInput,
        client_id: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        let outcome = upsert_file_tx(&mut tx, input).await?;
        if let Some(kind) = outcome.change {
            insert_change(
                &mut tx,
                Some(outcome.file.id),
                &outcome.file.backend_id,
                &outcome.file.path,
                kind,
                client_id,
                None,
            )
            .await?;
        }
        tx.commit().await?;
        if outcome.change.is_some() {
            self.notify_backend_changed(&input.backend_id);
        }
        Ok(outcome)
    }

    pub async fn get_file(
        &self,
        backend_id: &str,
        path: &str,
    ) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE backend_id = $1 AND path = $2 AND deleted_at IS NULL"
        ))
        .bind(backend_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// Active files of a backend whose path starts with `prefix`, ordered by path.
    pub async fn list_files(
        &self,
        backend_id: &str,
        prefix: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE backend_id = $1 AND deleted_at IS NULL AND {PATH_PREFIX}
             ORDER BY path ASC
             LIMIT $3 OFFSET $4"
        ))
        .bind(backend_id)
        .bind(prefix)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    pub async fn count_files(&self, backend_id: &str, prefix: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM files WHERE backend_id = $1 AND deleted_at IS NULL AND {PATH_PREFIX}"
        ))
        .bind(backend_id)
        .bind(prefix)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Every active file on every active backend, ordered by (backend, path).
    pub async fn list_active_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        let columns = qualified_file_columns();
        let rows = sqlx::query(&format!(
            "SELECT {columns} FROM files f
             JOIN backends b ON b.id = f.backend_id
             WHERE f.deleted_at IS NULL AND b.deleted_at IS NULL
             ORDER BY f.backend_id ASC, f.path ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Soft-deletes one file and logs the deletion. Returns `false` if the file was
    /// not active.
    pub async fn delete_file_logged(&self, file_id: i64, client_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "UPDATE files SET deleted_at = $2, updated_at = $2 WHERE id = $1 AND deleted_at IS NULL
             RETURNING backend_id, path",
        )
        .bind(file_id)
        .bind(now_unix())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let backend_id: String = row.try_get("backend_id")?;
        let path: String = row.try_get("path")?;
        insert_change(
            &mut tx,
            Some(file_id),
            &backend_id,
            &path,
            ChangeKind::Delete,
            client_id,
            None,
        )
        .await?;
        tx.commit().await?;
        self.notify_backend_changed(&backend_id);
        Ok(true)
    }

    /// Soft-deletes every active file of a backend under `prefix` (all of them for
    /// an empty prefix), logging each deletion. Returns the number removed.
    pub async fn delete_prefix_logged(
        &self,
        backend_id: &str,
        prefix: &str,
        client_id: &str,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        let rows = sqlx::query(&format!(
            "UPDATE files SET deleted_at = $3, updated_at = $3
             WHERE backend_id = $1 AND deleted_at IS NULL AND {PATH_PREFIX}
             RETURNING id, path"
        ))
        .bind(backend_id)
        .bind(prefix)
        .bind(now_unix())
        .fetch_all(&mut *tx)
        .await?;
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let path: String = row.try_get("path")?;
            insert_change(
                &mut tx,
                Some(id),
                backend_id,
                &path,
                ChangeKind::Delete,
                client_id,
                None,
            )
            .await?;
        }
        tx.commit().await?;
        if !rows.is_empty() {
            self.notify_backend_changed(backend_id);
        }
        Ok(rows.len() as u64)
    }
}
