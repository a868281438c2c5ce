//! Record store backing the `update_record` step.
//!
//! Each record is a JSON object keyed by `(collection, record_id)`. Updates
//! merge the given fields into the stored object (RFC 7396 merge patch via
//! SQLite's `json_patch`), so a `null` field removes that key.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use stepflow_types::error::RepositoryError;

use super::pool::DatabasePool;

/// SQLite-backed key/value record store.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: DatabasePool,
}

impl SqliteRecordStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Merge `fields` into the record, creating it when absent.
    ///
    /// Returns the record's fields after the merge.
    pub async fn upsert(
        &self,
        collection: &str,
        record_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<Map<String, Value>, RepositoryError> {
        let patch =
            serde_json::to_string(fields).map_err(|e| RepositoryError::Query(e.to_string()))?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let (merged,): (String,) = sqlx::query_as(
            r#"INSERT INTO records (collection, record_id, fields, updated_at)
               VALUES (?1, ?2, json_patch('{}', ?3), ?4)
               ON CONFLICT(collection, record_id) DO UPDATE SET
                 fields = json_patch(records.fields, ?3),
                 updated_at = excluded.updated_at
               RETURNING fields"#,
        )
        .bind(collection)
        .bind(record_id)
        .bind(&patch)
        .bind(&now)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        parse_fields(&merged)
    }

    /// Fetch a record's fields.
    pub async fn get(
        &self,
        collection: &str,
        record_id: &str,
    ) -> Result<Option<Map<String, Value>>, RepositoryError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT fields FROM records WHERE collection = ? AND record_id = ?")
                .bind(collection)
                .bind(record_id)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|(fields,)| parse_fields(&fields)).transpose()
    }
}

fn parse_fields(s: &str) -> Result<Map<String, Value>, RepositoryError> {
    serde_json::from_str(s)
        .map_err(|e| RepositoryError::Query(format!("invalid record JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::sqlite::pool::test_pool;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_creates_record() {
        let (pool, _dir) = test_pool().await;
        let store = SqliteRecordStore::new(pool);

        let merged = store
            .upsert("invoices", "INV-1", &fields(json!({ "status": "approved" })))
            .await
            .unwrap();
        assert_eq!(merged["status"], json!("approved"));

        let loaded = store.get("invoices", "INV-1").await.unwrap().unwrap();
        assert_eq!(loaded, merged);
        assert!(store.get("invoices", "INV-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_merges_fields() {
        let (pool, _dir) = test_pool().await;
        let store = SqliteRecordStore::new(pool);

        store
            .upsert(
                "invoices",
                "INV-1",
                &fields(json!({ "status": "open", "amount": 250, "note": "rush" })),
            )
            .await
            .unwrap();
        let merged = store
            .upsert(
                "invoices",
                "INV-1",
                &fields(json!({ "status": "approved", "note": null })),
            )
            .await
            .unwrap();

        assert_eq!(merged["status"], json!("approved"));
        assert_eq!(merged["amount"], json!(250));
        assert!(!merged.contains_key("note"));
    }

    #[tokio::test]
    async fn test_collections_are_separate() {
        let (pool, _dir) = test_pool().await;
        let store = SqliteRecordStore::new(pool);

        store
            .upsert("invoices", "1", &fields(json!({ "kind": "invoice" })))
            .await
            .unwrap();
        store
            .upsert("customers", "1", &fields(json!({ "kind": "customer" })))
            .await
            .unwrap();

        let invoice = store.get("invoices", "1").await.unwrap().unwrap();
        assert_eq!(invoice["kind"], json!("invoice"));
    }
}
