use sqlx::any::AnyRow;
use sqlx::{Any, Row, Transaction};

use super::{ChangeKind, FileChangeRecord, MetadataStore, StoreError, now_unix};

const CHANGE_COLUMNS: &str =
    "id, file_id, backend_id, path, kind, occurred_at, client_id, old_path, new_path";

fn change_from_row(row: &AnyRow) -> Result<FileChangeRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(FileChangeRecord {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        backend_id: row.try_get("backend_id")?,
        path: row.try_get("path")?,
        kind: ChangeKind::parse(&kind)?,
        occurred_at: row.try_get("occurred_at")?,
        client_id: row.try_get("client_id")?,
        old_path: row.try_get("old_path")?,
        new_path: row.try_get("new_path")?,
    })
}

/// Appends a change-log entry inside the caller's transaction. `renamed_from`
/// carries the old path of a rename.
pub(crate) async fn insert_change(
    tx: &mut Transaction<'static, Any>,
    file_id: Option<i64>,
    backend_id: &str,
    path: &str,
    kind: ChangeKind,
    client_id: &str,
    renamed_from: Option<&str>,
) -> Result<i64, StoreError> {
    let new_path = renamed_from.map(|_| path);
    let row = sqlx::query(
        "INSERT INTO file_changes (file_id, backend_id, path, kind, occurred_at, client_id, old_path, new_path)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING id",
    )
    .bind(file_id)
    .bind(backend_id)
    .bind(path)
    .bind(kind.as_str())
    .bind(now_unix())
    .bind(client_id)
    .bind(renamed_from)
    .bind(new_path)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.try_get("id")?)
}

impl MetadataStore {
    /// Change-log entries with id greater than `after_id`, oldest first. `None`
    /// reads every backend.
    pub async fn list_changes_since(
        &self,
        backend_id: Option<&str>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<FileChangeRecord>, StoreError> {
        let rows = match backend_id {
            Some(backend_id) => {
                sqlx::query(&format!(
                    "SELECT {CHANGE_COLUMNS} FROM file_changes WHERE backend_id = $1 AND id > $2 ORDER BY id ASC LIMIT $3"
                ))
                .bind(backend_id)
                .bind(after_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {CHANGE_COLUMNS} FROM file_changes WHERE id > $1 ORDER BY id ASC LIMIT $2"
                ))
                .bind(after_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(change_from_row).collect()
    }

    /// Highest change id of a backend, 0 when the log is empty.
    pub async fn latest_change_id(&self, backend_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT CAST(COALESCE(MAX(id), 0) AS BIGINT) AS latest FROM file_changes WHERE backend_id = $1",
        )
        .bind(backend_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("latest")?)
    }

    /// Logs a change that has no file-row counterpart to update, such as a
    /// rename performed directly on the backend.
    pub async fn append_change(
        &self,
        file_id: Option<i64>,
        backend_id: &str,
        path: &str,
        kind: ChangeKind,
        client_id: &str,
        renamed_from: Option<&str>,
    ) -> Result<i64, StoreError> {
        let _guard = self.write_lock().await;
        let mut tx = self.begin().await?;
        let id = insert_change(
            &mut tx,
            file_id,
            backend_id,
            path,
            kind,
            client_id,
            renamed_from,
        )
        .await?;
        tx.commit().await?;
        Ok(id)
    }
}
