//! Build records: the images available to serve a workflow.

use crate::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Building,
    Completed,
    Failed,
    Cancelled,
}

/// One container image build for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    pub workflow_id: String,
    pub image_name: String,
    pub tag: String,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    /// Full image reference for the container runtime.
    pub fn image_reference(&self) -> String {
        format!("{}:{}", self.image_name, self.tag)
    }
}

/// Request to register a new build.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBuild {
    pub workflow_id: String,
    pub image_name: String,
    pub tag: String,
}

/// One line of build output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogLine {
    pub seq: i64,
    pub line: String,
    pub created_at: DateTime<Utc>,
}

/// Read/update surface over build history.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Register a new pending build.
    async fn create(&self, input: NewBuild) -> Result<BuildRecord, DatabaseError>;

    async fn get(&self, id: &str) -> Result<Option<BuildRecord>, DatabaseError>;

    /// Most recent completed build for a workflow, if any.
    async fn latest_successful(
        &self,
        workflow_id: &str,
    ) -> Result<Option<BuildRecord>, DatabaseError>;

    async fn set_status(
        &self,
        id: &str,
        status: BuildStatus,
    ) -> Result<(), DatabaseError>;

    /// Append one log line, assigning the next sequence number.
    async fn append_log(&self, build_id: &str, line: &str) -> Result<i64, DatabaseError>;

    /// Log lines with `seq > since`, oldest first, at most `limit`.
    async fn fetch_logs(
        &self,
        build_id: &str,
        since: i64,
        limit: i64,
    ) -> Result<Vec<BuildLogLine>, DatabaseError>;
}

/// sqlx-backed store implementation.
pub struct SqliteBuildStore {
    pool: SqlitePool,
}

impl SqliteBuildStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_build(row: &SqliteRow) -> Result<BuildRecord, DatabaseError> {
    let status_raw: String = row.try_get("status")?;
    let status = BuildStatus::from_str(&status_raw).map_err(|_| DatabaseError::InvalidValue {
        field: "status",
        value: status_raw,
    })?;
    Ok(BuildRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        image_name: row.try_get("image_name")?,
        tag: row.try_get("tag")?,
        status,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl BuildStore for SqliteBuildStore {
    async fn create(&self, input: NewBuild) -> Result<BuildRecord, DatabaseError> {
        let record = BuildRecord {
            id: Uuid::new_v4().to_string(),
            workflow_id: input.workflow_id,
            image_name: input.image_name,
            tag: input.tag,
            status: BuildStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };

        sqlx::query(
            "INSERT INTO builds (id, workflow_id, image_name, tag, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.workflow_id)
        .bind(&record.image_name)
        .bind(&record.tag)
        .bind(record.status.to_string())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<BuildRecord>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM builds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_build).transpose()
    }

    async fn latest_successful(
        &self,
        workflow_id: &str,
    ) -> Result<Option<BuildRecord>, DatabaseError> {
        let row = sqlx::query(
            "SELECT * FROM builds WHERE workflow_id = ? AND status = ? \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(workflow_id)
        .bind(BuildStatus::Completed.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_build).transpose()
    }

    async fn set_status(&self, id: &str, status: BuildStatus) -> Result<(), DatabaseError> {
        let completed_at = matches!(
            status,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled
        )
        .then(Utc::now);

        let result = sqlx::query("UPDATE builds SET status = ?, completed_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(completed_at)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "build",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_log(&self, build_id: &str, line: &str) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) + 1 AS next_seq FROM build_logs WHERE build_id = ?",
        )
        .bind(build_id)
        .fetch_one(&self.pool)
        .await?;
        let seq: i64 = row.try_get("next_seq")?;

        sqlx::query(
            "INSERT INTO build_logs (build_id, seq, line, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(build_id)
        .bind(seq)
        .bind(line)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(seq)
    }

    async fn fetch_logs(
        &self,
        build_id: &str,
        since: i64,
        limit: i64,
    ) -> Result<Vec<BuildLogLine>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT seq, line, created_at FROM build_logs \
             WHERE build_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
        )
        .bind(build_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BuildLogLine {
                    seq: row.try_get("seq")?,
                    line: row.try_get("line")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
