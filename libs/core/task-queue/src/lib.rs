//! Durable priority job queue for generation workloads.
//!
//! This crate provides:
//! - `Job` - the atomic unit of scheduling, with its lifecycle state machine
//! - `DurableQueue` - three priority segments (high/normal/low) plus a dead
//!   letter segment, each backed by an fsync'd append-only log
//! - `SegmentLog` - the on-disk log with crash replay
//!
//! ## Architecture
//!
//! ```text
//! enqueue ──► [high]   ──┐
//!             [normal] ──┼──► dequeue (strict priority, FIFO per segment)
//!             [low]    ──┘        │
//!                                 ▼
//!                     complete / fail(retry?) ──► [dead_letter]
//! ```
//!
//! ## Durability
//!
//! Enqueue, dequeue, and terminal transitions append a record and fsync
//! before returning. A crash loses at most the uncommitted tail; jobs taken
//! but never settled are re-delivered on restart (at-least-once), so
//! consumers must be idempotent on `prompt_id`.

pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod wal;

pub use error::QueueError;
pub use job::{Job, JobPriority, JobResult, JobState};
pub use queue::{DurableQueue, QueueStats, SegmentDepths};
pub use wal::SegmentLog;
