use sqlx::Row;
use sqlx::any::AnyRow;

use super::files::{file_from_row, qualified_file_columns};
use super::{FileRecord, MetadataStore, StoreError, TagRecord, now_unix};

fn tag_from_row(row: &AnyRow) -> Result<TagRecord, StoreError> {
    Ok(TagRecord {
        id: row.try_get("id")?,
        file_id: row.try_get("file_id")?,
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        created_at: row.try_get("created_at")?,
    })
}

const INSERT_TAG: &str = "INSERT INTO tags (file_id, key, value, created_at) VALUES ($1, $2, $3, $4)
     ON CONFLICT (file_id, key, value) DO NOTHING";

impl MetadataStore {
    async fn notify_tagged(&self, file_id: i64) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT backend_id FROM files WHERE id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let backend_id: String = row.try_get("backend_id")?;
            self.notify_backend_changed(&backend_id);
        }
        Ok(())
    }

    /// Adds a tag triple. Re-adding an existing triple is a no-op; returns whether
    /// a row was inserted.
    pub async fn add_tag(&self, file_id: i64, key: &str, value: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock().await;
        let result = sqlx::query(INSERT_TAG)
            .bind(file_id)
            .bind(key)
            .bind(value)
            .bind(now_unix())
            .execute(&self.pool)
            .await?;
        let inserted = result.rows_affected() > 0;
        if inserted {
            self.notify_tagged(file_id).await?;
        }
        Ok(inserted)
    }

    /// Removes tags of `key` from a file, only the given value when one is passed.
    /// Removing an absent tag is not an error.
    pub async fn remove_tag(
        &self,
        file_id: i64,
        key: &str,
        value: Option<&str>,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock().await;
        let result = match value {
            Some(value) => {
                sqlx::query("DELETE FROM tags WHERE file_id = $1 AND key = $2 AND value = $3")
                    .bind(file_id)
                    .bind(key)
                    .bind(value)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM tags WHERE file_id = $1 AND key = $2")
                    .bind(file_id)
                    .bind(key)
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() > 0 {
            self.notify_tagged(file_id).await?;
        }
        Ok(result.rows_affected())
    }

    pub async fn get_file_tags(&self, file_id: i64) -> Result<Vec<TagRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, file_id, key, value, created_at FROM tags WHERE file_id = $1 ORDER BY key, value",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(tag_from_row).collect()
    }

    /// Replaces the whole tag set of a file atomically.
    pub async fn replace_file_tags(
        &self,
        file_id: i64,
        tags: &[(String, String)],
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock().await;
        let now = now_unix();
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM tags WHERE file_id = $1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        for (key, value) in tags {
            sqlx::query(INSERT_TAG)
                .bind(file_id)
                .bind(key)
                .bind(value)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.notify_tagged(file_id).await?;
        Ok(())
    }

    /// Active files carrying exactly `key=value`, ordered by (backend, path).
    pub async fn files_by_tag(
        &self,
        key: &str,
        value: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FileRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT {} FROM files f
             JOIN tags t ON t.file_id = f.id
             JOIN backends b ON b.id = f.backend_id
             WHERE t.key = $1 AND t.value = $2 AND f.deleted_at IS NULL AND b.deleted_at IS NULL
             ORDER BY f.backend_id ASC, f.path ASC
             LIMIT $3 OFFSET $4",
            qualified_file_columns()
        ))
        .bind(key)
        .bind(value)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// File ids tagged exactly `key=value` (active or not).
    pub async fn file_ids_with_tag(&self, key: &str, value: &str) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT file_id FROM tags WHERE key = $1 AND value = $2")
            .bind(key)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("file_id").map_err(StoreError::from))
            .collect()
    }

    /// Every (file id, value) pair stored under `key`.
    pub async fn tag_values_for_key(&self, key: &str) -> Result<Vec<(i64, String)>, StoreError> {
        let rows = sqlx::query("SELECT file_id, value FROM tags WHERE key = $1")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("file_id")?, row.try_get("value")?));
        }
        Ok(out)
    }
}
