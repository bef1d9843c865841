//! The durable queue: priority segments, retry flow, dead letter tier.

use crate::error::QueueError;
use crate::job::{Job, JobPriority, JobResult, JobState};
use crate::metrics;
use crate::wal::SegmentLog;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Per-segment live depths.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SegmentDepths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub dead_letter: usize,
}

impl SegmentDepths {
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

/// Cumulative counters plus current depths.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub depths: SegmentDepths,
    /// Jobs currently in PROCESSING.
    pub active_jobs: usize,
    /// All jobs the in-memory index knows about, terminal included.
    pub total_tracked: usize,
}

struct TrackedJob {
    job: Job,
    /// Sequence within the segment currently holding the entry, when one
    /// does (queued, retrying, processing, or dead-lettered).
    seq: Option<u64>,
    in_dead_letter: bool,
}

#[derive(Default)]
struct Counters {
    total_enqueued: u64,
    total_processed: u64,
    total_failed: u64,
    total_retried: u64,
}

struct QueueInner {
    high: SegmentLog,
    normal: SegmentLog,
    low: SegmentLog,
    dead_letter: SegmentLog,
    jobs: HashMap<String, TrackedJob>,
    counters: Counters,
}

impl QueueInner {
    fn segment_mut(&mut self, priority: JobPriority) -> &mut SegmentLog {
        match priority {
            JobPriority::High => &mut self.high,
            JobPriority::Normal => &mut self.normal,
            JobPriority::Low => &mut self.low,
        }
    }

    fn segment(&self, priority: JobPriority) -> &SegmentLog {
        match priority {
            JobPriority::High => &self.high,
            JobPriority::Normal => &self.normal,
            JobPriority::Low => &self.low,
        }
    }

    fn depths(&self) -> SegmentDepths {
        SegmentDepths {
            high: self.high.len(),
            normal: self.normal.len(),
            low: self.low.len(),
            dead_letter: self.dead_letter.len(),
        }
    }

    fn publish_gauges(&self) {
        let depths = self.depths();
        metrics::set_depth(JobPriority::High, depths.high);
        metrics::set_depth(JobPriority::Normal, depths.normal);
        metrics::set_depth(JobPriority::Low, depths.low);
        metrics::set_dead_letter_depth(depths.dead_letter);
    }
}

/// Priority-segmented FIFO queue with on-disk persistence.
///
/// All operations are safe under parallel callers; one lock serializes the
/// queue state, and every mutating operation is committed to the owning
/// segment log before it returns.
pub struct DurableQueue {
    max_queue_size: usize,
    queue_path: PathBuf,
    inner: Mutex<QueueInner>,
}

impl DurableQueue {
    /// Open the queue at `queue_path`, replaying all four segment logs.
    ///
    /// Jobs that were in flight when the previous process died come back
    /// QUEUED in their original positions (at-least-once delivery).
    pub async fn open(
        queue_path: impl AsRef<Path>,
        max_queue_size: usize,
    ) -> Result<Self, QueueError> {
        let queue_path = queue_path.as_ref().to_path_buf();

        let high = SegmentLog::open(queue_path.join("high.wal")).await?;
        let normal = SegmentLog::open(queue_path.join("normal.wal")).await?;
        let low = SegmentLog::open(queue_path.join("low.wal")).await?;
        let dead_letter = SegmentLog::open(queue_path.join("dead_letter.wal")).await?;

        let mut jobs = HashMap::new();
        for segment in [&high, &normal, &low] {
            for (seq, mut job) in segment.recovered_jobs() {
                job.state = JobState::Queued;
                job.started_at = None;
                jobs.insert(
                    job.job_id.clone(),
                    TrackedJob {
                        job,
                        seq: Some(seq),
                        in_dead_letter: false,
                    },
                );
            }
        }
        for (seq, job) in dead_letter.recovered_jobs() {
            jobs.insert(
                job.job_id.clone(),
                TrackedJob {
                    job,
                    seq: Some(seq),
                    in_dead_letter: true,
                },
            );
        }

        let inner = QueueInner {
            high,
            normal,
            low,
            dead_letter,
            jobs,
            counters: Counters::default(),
        };
        let depths = inner.depths();
        info!(
            path = %queue_path.display(),
            high = depths.high,
            normal = depths.normal,
            low = depths.low,
            dead_letter = depths.dead_letter,
            "Durable queue opened"
        );
        inner.publish_gauges();

        Ok(Self {
            max_queue_size,
            queue_path,
            inner: Mutex::new(inner),
        })
    }

    pub fn path(&self) -> &Path {
        &self.queue_path
    }

    /// Append the job to its priority segment. Fails with
    /// `QueueError::Full` when total live depth has reached the cap.
    pub async fn enqueue(&self, mut job: Job) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;

        if inner.depths().total() >= self.max_queue_size {
            warn!(job_id = %job.job_id, "Queue full, rejecting job");
            return Err(QueueError::Full {
                capacity: self.max_queue_size,
            });
        }

        job.state = JobState::Queued;
        let priority = job.priority;
        let seq = inner.segment_mut(priority).push(&job).await?;

        inner.counters.total_enqueued += 1;
        metrics::record_enqueued(priority);
        info!(job_id = %job.job_id, priority = %priority, "Job enqueued");

        inner.jobs.insert(
            job.job_id.clone(),
            TrackedJob {
                job,
                seq: Some(seq),
                in_dead_letter: false,
            },
        );
        inner.publish_gauges();
        Ok(())
    }

    /// Non-blocking take of the next job in strict priority order.
    /// The returned job is PROCESSING with `started_at` stamped.
    pub async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        let mut inner = self.inner.lock().await;

        for priority in JobPriority::in_dequeue_order() {
            let Some((seq, stored)) = inner.segment_mut(priority).take().await? else {
                continue;
            };

            let job = match inner.jobs.get_mut(&stored.job_id) {
                Some(tracked) => {
                    tracked.job.state = JobState::Processing;
                    tracked.job.started_at = Some(Utc::now());
                    tracked.seq = Some(seq);
                    tracked.job.clone()
                }
                None => {
                    // Index entry was cleaned up while the log entry
                    // survived; resurrect from the stored copy.
                    let mut job = stored;
                    job.state = JobState::Processing;
                    job.started_at = Some(Utc::now());
                    inner.jobs.insert(
                        job.job_id.clone(),
                        TrackedJob {
                            job: job.clone(),
                            seq: Some(seq),
                            in_dead_letter: false,
                        },
                    );
                    job
                }
            };

            debug!(job_id = %job.job_id, priority = %priority, "Job dequeued");
            inner.publish_gauges();
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Record successful completion.
    pub async fn complete(&self, job_id: &str, result: JobResult) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let tracked = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if tracked.job.state.is_terminal() {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: tracked.job.state,
                attempted: "complete",
            });
        }

        tracked.job.state = JobState::Completed;
        tracked.job.completed_at = Some(Utc::now());
        tracked.job.result = Some(result);
        let seq = tracked.seq.take();
        let priority = tracked.job.priority;

        if let Some(seq) = seq {
            inner.segment_mut(priority).settle(seq).await?;
        }
        inner.counters.total_processed += 1;
        metrics::record_processed("completed");
        info!(job_id, "Job completed");
        inner.publish_gauges();
        Ok(())
    }

    /// Record a failure. With `retry` and remaining budget the job goes
    /// back to its own priority segment as RETRYING (no backoff sleep here;
    /// re-dispatch delay is the scheduler's contract). Otherwise it is
    /// parked in the dead letter segment.
    pub async fn fail(&self, job_id: &str, error: &str, retry: bool) -> Result<(), QueueError> {
        self.fail_with_terminal_state(job_id, error, retry, JobState::Failed)
            .await
    }

    /// Deadline-breach variant of `fail`: same flow, but a job that has no
    /// retry budget left is recorded TIMED_OUT instead of FAILED.
    pub async fn time_out(&self, job_id: &str, error: &str, retry: bool) -> Result<(), QueueError> {
        self.fail_with_terminal_state(job_id, error, retry, JobState::TimedOut)
            .await
    }

    async fn fail_with_terminal_state(
        &self,
        job_id: &str,
        error_message: &str,
        retry: bool,
        terminal_state: JobState,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(tracked) = inner.jobs.get_mut(job_id) else {
            return Err(QueueError::NotFound(job_id.to_string()));
        };

        if tracked.job.state.is_terminal() {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: tracked.job.state,
                attempted: "fail",
            });
        }

        tracked.job.error = Some(error_message.to_string());
        let priority = tracked.job.priority;
        let old_seq = tracked.seq.take();

        if let Some(seq) = old_seq {
            inner.segment_mut(priority).settle(seq).await?;
        }

        let tracked = inner.jobs.get_mut(job_id).expect("tracked above");
        if retry && tracked.job.can_retry() {
            tracked.job.retry_count += 1;
            tracked.job.state = JobState::Retrying;
            tracked.job.started_at = None;
            let job = tracked.job.clone();

            info!(
                job_id,
                retry_count = job.retry_count,
                max_retries = job.max_retries,
                backoff_secs = job.retry_backoff().as_secs(),
                "Retrying job"
            );

            let seq = inner.segment_mut(priority).push(&job).await?;
            let tracked = inner.jobs.get_mut(job_id).expect("tracked above");
            tracked.seq = Some(seq);
            inner.counters.total_retried += 1;
            metrics::record_retry();
        } else {
            tracked.job.state = terminal_state;
            tracked.job.completed_at = Some(Utc::now());
            tracked.in_dead_letter = true;
            let job = tracked.job.clone();

            error!(job_id, error = error_message, "Job failed permanently");

            let seq = inner.dead_letter.push(&job).await?;
            let tracked = inner.jobs.get_mut(job_id).expect("tracked above");
            tracked.seq = Some(seq);
            inner.counters.total_failed += 1;
            metrics::record_processed("failed");
        }

        inner.publish_gauges();
        Ok(())
    }

    /// Cancel a job that has not started processing.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, QueueError> {
        let mut inner = self.inner.lock().await;
        let tracked = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if !tracked.job.state.is_cancellable() {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: tracked.job.state,
                attempted: "cancel",
            });
        }

        tracked.job.state = JobState::Cancelled;
        tracked.job.completed_at = Some(Utc::now());
        let seq = tracked.seq.take();
        let priority = tracked.job.priority;
        let job = tracked.job.clone();

        if let Some(seq) = seq {
            inner.segment_mut(priority).settle(seq).await?;
        }
        metrics::record_processed("cancelled");
        info!(job_id, "Job cancelled");
        inner.publish_gauges();
        Ok(job)
    }

    /// Accept a cancellation request for a job already PROCESSING.
    ///
    /// The in-flight run is not interrupted; the record is marked
    /// CANCELLED and its entry settled, so the executor's own terminal
    /// update loses the race, detects the cancellation, and announces it
    /// to subscribers.
    pub async fn request_cancel(&self, job_id: &str) -> Result<Job, QueueError> {
        let mut inner = self.inner.lock().await;
        let tracked = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

        if tracked.job.state != JobState::Processing {
            return Err(QueueError::InvalidTransition {
                job_id: job_id.to_string(),
                from: tracked.job.state,
                attempted: "cancel",
            });
        }

        tracked.job.state = JobState::Cancelled;
        tracked.job.completed_at = Some(Utc::now());
        let seq = tracked.seq.take();
        let priority = tracked.job.priority;
        let job = tracked.job.clone();

        if let Some(seq) = seq {
            inner.segment_mut(priority).settle(seq).await?;
        }
        metrics::record_processed("cancelled");
        info!(job_id, "Cancellation requested for in-flight job");
        inner.publish_gauges();
        Ok(job)
    }

    /// Queue position: 0 when PROCESSING, 1-based position counting all
    /// higher-priority segments when queued, -1 when unknown or terminal.
    pub async fn position(&self, job_id: &str) -> i64 {
        let inner = self.inner.lock().await;
        let Some(tracked) = inner.jobs.get(job_id) else {
            return -1;
        };

        match tracked.job.state {
            JobState::Processing => 0,
            JobState::Queued | JobState::Retrying => {
                let Some(seq) = tracked.seq else { return -1 };
                let Some(own_position) = inner.segment(tracked.job.priority).position_of(seq)
                else {
                    return -1;
                };
                let ahead: usize = JobPriority::in_dequeue_order()
                    .into_iter()
                    .take_while(|p| *p != tracked.job.priority)
                    .map(|p| inner.segment(p).len())
                    .sum();
                (1 + ahead + own_position) as i64
            }
            _ => -1,
        }
    }

    /// Move up to `max_recover` dead-lettered jobs back into their priority
    /// segments with a fresh retry budget.
    pub async fn recover_dead_letter(&self, max_recover: usize) -> Result<Vec<Job>, QueueError> {
        let mut inner = self.inner.lock().await;
        let mut recovered = Vec::new();

        for _ in 0..max_recover {
            if inner.depths().total() >= self.max_queue_size {
                warn!("Queue full, stopping dead letter recovery");
                break;
            }
            let Some((seq, mut job)) = inner.dead_letter.take().await? else {
                break;
            };
            inner.dead_letter.settle(seq).await?;

            job.retry_count = 0;
            job.state = JobState::Queued;
            job.error = None;
            job.completed_at = None;
            job.started_at = None;

            let priority = job.priority;
            let new_seq = inner.segment_mut(priority).push(&job).await?;
            inner.jobs.insert(
                job.job_id.clone(),
                TrackedJob {
                    job: job.clone(),
                    seq: Some(new_seq),
                    in_dead_letter: false,
                },
            );
            inner.counters.total_enqueued += 1;
            info!(job_id = %job.job_id, "Recovered job from dead letter queue");
            recovered.push(job);
        }

        inner.publish_gauges();
        Ok(recovered)
    }

    /// Drop terminal records older than `age` from the in-memory index.
    pub async fn cleanup_completed(&self, age: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();

        let stale: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, tracked)| {
                tracked.job.state.is_terminal()
                    && !tracked.in_dead_letter
                    && tracked
                        .job
                        .completed_at
                        .is_some_and(|completed| completed < cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            inner.jobs.remove(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Cleaned up completed jobs");
        }
        stale.len()
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        let inner = self.inner.lock().await;
        inner.jobs.get(job_id).map(|t| t.job.clone())
    }

    pub async fn find_by_prompt(&self, prompt_id: &str) -> Option<Job> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .values()
            .find(|t| t.job.prompt_id == prompt_id)
            .map(|t| t.job.clone())
    }

    /// Total live depth across the three priority segments.
    pub async fn depth(&self) -> usize {
        self.inner.lock().await.depths().total()
    }

    pub async fn dead_letter_depth(&self) -> usize {
        self.inner.lock().await.depths().dead_letter
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let active_jobs = inner
            .jobs
            .values()
            .filter(|t| t.job.state == JobState::Processing)
            .count();
        QueueStats {
            total_enqueued: inner.counters.total_enqueued,
            total_processed: inner.counters.total_processed,
            total_failed: inner.counters.total_failed,
            total_retried: inner.counters.total_retried,
            depths: inner.depths(),
            active_jobs,
            total_tracked: inner.jobs.len(),
        }
    }
}
