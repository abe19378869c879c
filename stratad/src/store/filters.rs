use sqlx::Row;
use sqlx::any::AnyRow;

use super::{FilterRecord, MetadataStore, NewFilter, StoreError, map_unique, now_unix};

const FILTER_COLUMNS: &str =
    "id, virtual_path, name, query_expression, description, created_at, updated_at";

fn filter_from_row(row: &AnyRow) -> Result<FilterRecord, StoreError> {
    Ok(FilterRecord {
        id: row.try_get("id")?,
        virtual_path: row.try_get("virtual_path")?,
        name: row.try_get("name")?,
        query: row.try_get("query_expression")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl MetadataStore {
    pub async fn create_filter(&self, filter: &NewFilter) -> Result<FilterRecord, StoreError> {
        let _guard = self.write_lock().await;
        let row = sqlx::query(&format!(
            "INSERT INTO filters (virtual_path, name, query_expression, description, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             ON CONFLICT (virtual_path) DO NOTHING
             RETURNING {FILTER_COLUMNS}"
        ))
        .bind(&filter.virtual_path)
        .bind(&filter.name)
        .bind(&filter.query)
        .bind(&filter.description)
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => filter_from_row(&row),
            None => Err(StoreError::Duplicate(format!(
                "filter '{}'",
                filter.virtual_path
            ))),
        }
    }

    pub async fn get_filter(&self, virtual_path: &str) -> Result<Option<FilterRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters WHERE virtual_path = $1"
        ))
        .bind(virtual_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(filter_from_row).transpose()
    }

    pub async fn list_filters(&self) -> Result<Vec<FilterRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FILTER_COLUMNS} FROM filters ORDER BY virtual_path ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(filter_from_row).collect()
    }

    pub async fn update_filter(
        &self,
        filter: &FilterRecord,
    ) -> Result<Option<FilterRecord>, StoreError> {
        let _guard = self.write_lock().await;
        let row = sqlx::query(&format!(
            "UPDATE filters SET virtual_path = $2, name = $3, query_expression = $4, description = $5, updated_at = $6
             WHERE id = $1
             RETURNING {FILTER_COLUMNS}"
        ))
        .bind(filter.id)
        .bind(&filter.virtual_path)
        .bind(&filter.name)
        .bind(&filter.query)
        .bind(&filter.description)
        .bind(now_unix())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_unique(err, format!("filter '{}'", filter.virtual_path)))?;
        row.as_ref().map(filter_from_row).transpose()
    }

    pub async fn delete_filter(&self, id: i64) -> Result<bool, StoreError> {
        let _guard = self.write_lock().await;
        let result = sqlx::query("DELETE FROM filters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
