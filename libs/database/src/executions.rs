//! Execution records written by the execution plane.

use crate::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

/// One job execution as recorded for the owning system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub prompt_id: String,
    /// Job state string as reported by the queue.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub image_urls: Vec<String>,
    pub error: Option<String>,
}

/// Write surface for execution history.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or update the record for `id` (upsert keyed by job id, so
    /// retried executions keep one row).
    async fn record(&self, record: &ExecutionRecord) -> Result<(), DatabaseError>;

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, DatabaseError>;

    async fn list_recent(&self, limit: i64) -> Result<Vec<ExecutionRecord>, DatabaseError>;
}

pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_execution(row: &SqliteRow) -> Result<ExecutionRecord, DatabaseError> {
    let image_urls: Option<String> = row.try_get("image_urls")?;
    let image_urls = match image_urls {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Vec::new(),
    };
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        prompt_id: row.try_get("prompt_id")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        image_urls,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn record(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let image_urls = serde_json::to_string(&record.image_urls)?;
        sqlx::query(
            "INSERT INTO executions \
             (id, workflow_id, prompt_id, status, created_at, started_at, completed_at, image_urls, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             status = excluded.status, \
             started_at = excluded.started_at, \
             completed_at = excluded.completed_at, \
             image_urls = excluded.image_urls, \
             error = excluded.error",
        )
        .bind(&record.id)
        .bind(&record.workflow_id)
        .bind(&record.prompt_id)
        .bind(&record.status)
        .bind(record.created_at)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(image_urls)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM executions ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_execution).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect_in_memory;

    fn record(id: &str, status: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: id.to_string(),
            workflow_id: "wf-1".to_string(),
            prompt_id: format!("prompt-{id}"),
            status: status.to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            image_urls: Vec::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_record_upserts_by_id() {
        let store = SqliteExecutionStore::new(connect_in_memory().await.unwrap());

        store.record(&record("task-1", "processing")).await.unwrap();

        let mut updated = record("task-1", "completed");
        updated.image_urls = vec!["/api/images/p_out.png".to_string()];
        updated.completed_at = Some(Utc::now());
        store.record(&updated).await.unwrap();

        let fetched = store.get("task-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, "completed");
        assert_eq!(fetched.image_urls.len(), 1);
        assert!(fetched.completed_at.is_some());

        let all = store.list_recent(10).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = SqliteExecutionStore::new(connect_in_memory().await.unwrap());
        assert!(store.get("nope").await.unwrap().is_none());
    }
}
