//! Relational store surface.
//!
//! Workflow definitions and build history are owned by an external system;
//! the execution plane only reads build records (to pick the image serving
//! a workflow) and writes execution records. This crate provides that
//! surface over SQLite: repository traits, their sqlx implementations, and
//! schema bootstrap.

pub mod builds;
pub mod error;
pub mod executions;

pub use builds::{BuildLogLine, BuildRecord, BuildStatus, BuildStore, NewBuild, SqliteBuildStore};
pub use error::DatabaseError;
pub use executions::{ExecutionRecord, ExecutionStore, SqliteExecutionStore};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    id           TEXT PRIMARY KEY,
    workflow_id  TEXT NOT NULL,
    image_name   TEXT NOT NULL,
    tag          TEXT NOT NULL,
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_builds_workflow ON builds (workflow_id, created_at);

CREATE TABLE IF NOT EXISTS build_logs (
    build_id   TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    line       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (build_id, seq)
);

CREATE TABLE IF NOT EXISTS executions (
    id           TEXT PRIMARY KEY,
    workflow_id  TEXT NOT NULL,
    prompt_id    TEXT NOT NULL,
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT,
    image_urls   TEXT,
    error        TEXT
);
CREATE INDEX IF NOT EXISTS idx_executions_prompt ON executions (prompt_id);
"#;

/// Open (or create) the store at `path` and bootstrap the schema.
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool, DatabaseError> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    ensure_schema(&pool).await?;
    info!(path = %path.as_ref().display(), "Store opened");
    Ok(pool)
}

/// In-memory store for tests.
pub async fn connect_in_memory() -> Result<SqlitePool, DatabaseError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

async fn ensure_schema(pool: &SqlitePool) -> Result<(), DatabaseError> {
    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
