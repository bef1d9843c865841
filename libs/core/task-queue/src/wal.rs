//! Append-only segment log with crash replay.
//!
//! Each priority segment (and the dead letter tier) is one JSON-lines file.
//! Every mutating call appends a record and fsyncs before returning, so a
//! crash loses at most the uncommitted tail. On open the log is replayed:
//! pushed-but-unsettled entries are live again, and entries that were taken
//! but never settled re-enter the segment in their original order.

use crate::error::QueueError;
use crate::job::Job;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Rewrite the file once this many settle records have accumulated and the
/// dead records outnumber the live ones.
const COMPACT_SETTLED_THRESHOLD: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WalRecord {
    Push { seq: u64, job: Job },
    Take { seq: u64 },
    Settle { seq: u64 },
}

/// One durable FIFO segment.
pub struct SegmentLog {
    path: PathBuf,
    file: File,
    next_seq: u64,
    /// Live entries not yet handed to a consumer, in FIFO order.
    pending: VecDeque<u64>,
    /// All live entries (pending + in flight) by sequence number.
    live: HashMap<u64, Job>,
    /// Taken but not yet settled.
    in_flight: HashSet<u64>,
    settled_since_compact: usize,
    /// Entries that were in flight when the previous process died; they are
    /// back in `pending` (at-least-once re-delivery).
    redelivered: Vec<u64>,
}

impl SegmentLog {
    /// Open (or create) the segment at `path` and replay its records.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut pushed: BTreeMap<u64, Job> = BTreeMap::new();
        let mut taken: HashSet<u64> = HashSet::new();
        let mut settled: HashSet<u64> = HashSet::new();
        let mut next_seq = 0u64;

        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
            for (idx, line) in lines.iter().enumerate() {
                let record: WalRecord = match serde_json::from_str(line) {
                    Ok(record) => record,
                    Err(e) => {
                        if idx + 1 == lines.len() {
                            // Torn tail from a crash mid-append; the record
                            // was never acknowledged, dropping it is correct.
                            warn!(path = %path.display(), "Dropping torn trailing record: {e}");
                            break;
                        }
                        warn!(path = %path.display(), line = idx, "Skipping corrupt record: {e}");
                        continue;
                    }
                };
                match record {
                    WalRecord::Push { seq, job } => {
                        next_seq = next_seq.max(seq + 1);
                        pushed.insert(seq, job);
                    }
                    WalRecord::Take { seq } => {
                        taken.insert(seq);
                    }
                    WalRecord::Settle { seq } => {
                        settled.insert(seq);
                    }
                }
            }
        }

        let mut pending = VecDeque::new();
        let mut live = HashMap::new();
        let mut redelivered = Vec::new();
        for (seq, job) in pushed {
            if settled.contains(&seq) {
                continue;
            }
            if taken.contains(&seq) {
                redelivered.push(seq);
            }
            pending.push_back(seq);
            live.insert(seq, job);
        }

        if !redelivered.is_empty() {
            info!(
                path = %path.display(),
                count = redelivered.len(),
                "Re-queued in-flight entries from previous run"
            );
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file,
            next_seq,
            pending,
            live,
            in_flight: HashSet::new(),
            settled_since_compact: 0,
            redelivered,
        })
    }

    /// Number of entries waiting to be taken.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Live entries in FIFO order, for rebuilding in-memory indices after a
    /// restart.
    pub fn recovered_jobs(&self) -> Vec<(u64, Job)> {
        self.pending
            .iter()
            .filter_map(|seq| self.live.get(seq).map(|job| (*seq, job.clone())))
            .collect()
    }

    /// Sequence numbers that were in flight when the previous process died.
    pub fn redelivered(&self) -> &[u64] {
        &self.redelivered
    }

    /// Append an entry. Committed (fsync'd) before returning.
    pub async fn push(&mut self, job: &Job) -> Result<u64, QueueError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.append(&WalRecord::Push {
            seq,
            job: job.clone(),
        })
        .await?;

        self.pending.push_back(seq);
        self.live.insert(seq, job.clone());
        Ok(seq)
    }

    /// Take the oldest pending entry, marking it in flight.
    pub async fn take(&mut self) -> Result<Option<(u64, Job)>, QueueError> {
        let Some(seq) = self.pending.front().copied() else {
            return Ok(None);
        };

        self.append(&WalRecord::Take { seq }).await?;
        self.pending.pop_front();
        self.in_flight.insert(seq);

        let job = self
            .live
            .get(&seq)
            .cloned()
            .expect("in-flight entry must be live");
        Ok(Some((seq, job)))
    }

    /// Settle an entry: it will never be delivered again. Valid for both
    /// in-flight and still-pending (cancelled) entries.
    pub async fn settle(&mut self, seq: u64) -> Result<(), QueueError> {
        if !self.live.contains_key(&seq) {
            debug!(seq, path = %self.path.display(), "Settle for unknown sequence ignored");
            return Ok(());
        }

        self.append(&WalRecord::Settle { seq }).await?;
        self.in_flight.remove(&seq);
        if let Some(pos) = self.pending.iter().position(|s| *s == seq) {
            self.pending.remove(pos);
        }
        self.live.remove(&seq);
        self.settled_since_compact += 1;

        if self.settled_since_compact >= COMPACT_SETTLED_THRESHOLD
            && self.settled_since_compact > self.live.len()
        {
            self.compact().await?;
        }
        Ok(())
    }

    /// 0-based position of a pending entry.
    pub fn position_of(&self, seq: u64) -> Option<usize> {
        self.pending.iter().position(|s| *s == seq)
    }

    async fn append(&mut self, record: &WalRecord) -> Result<(), QueueError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Rewrite the log with only live records, dropping settled history.
    async fn compact(&mut self) -> Result<(), QueueError> {
        let mut content = String::new();
        let mut seqs: Vec<u64> = self.live.keys().copied().collect();
        seqs.sort_unstable();
        for seq in &seqs {
            let record = WalRecord::Push {
                seq: *seq,
                job: self.live[seq].clone(),
            };
            content.push_str(&serde_json::to_string(&record)?);
            content.push('\n');
        }
        for seq in &seqs {
            if self.in_flight.contains(seq) {
                content.push_str(&serde_json::to_string(&WalRecord::Take { seq: *seq })?);
                content.push('\n');
            }
        }

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path).await?;
            tmp.write_all(content.as_bytes()).await?;
            tmp.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &self.path).await?;

        self.file = OpenOptions::new().append(true).open(&self.path).await?;
        debug!(
            path = %self.path.display(),
            live = self.live.len(),
            "Compacted segment log"
        );
        self.settled_since_compact = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPriority;
    use serde_json::json;

    fn job(tag: &str) -> Job {
        let mut job = Job::new("wf-1", json!({}), json!({}), JobPriority::Normal);
        job.job_id = format!("task-{tag}");
        job
    }

    #[tokio::test]
    async fn test_push_take_settle() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentLog::open(dir.path().join("normal.wal")).await.unwrap();

        log.push(&job("a")).await.unwrap();
        log.push(&job("b")).await.unwrap();
        assert_eq!(log.len(), 2);

        let (seq, taken) = log.take().await.unwrap().unwrap();
        assert_eq!(taken.job_id, "task-a");
        log.settle(seq).await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_replay_preserves_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normal.wal");
        {
            let mut log = SegmentLog::open(&path).await.unwrap();
            for tag in ["a", "b", "c"] {
                log.push(&job(tag)).await.unwrap();
            }
        }

        let mut log = SegmentLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 3);
        let ids: Vec<String> = {
            let mut ids = Vec::new();
            while let Some((_, job)) = log.take().await.unwrap() {
                ids.push(job.job_id);
            }
            ids
        };
        assert_eq!(ids, vec!["task-a", "task-b", "task-c"]);
    }

    #[tokio::test]
    async fn test_taken_but_unsettled_is_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normal.wal");
        {
            let mut log = SegmentLog::open(&path).await.unwrap();
            log.push(&job("a")).await.unwrap();
            log.push(&job("b")).await.unwrap();
            let _ = log.take().await.unwrap().unwrap();
            // Crash before settle.
        }

        let log = SegmentLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.redelivered().len(), 1);
        let recovered = log.recovered_jobs();
        assert_eq!(recovered[0].1.job_id, "task-a");
        assert_eq!(recovered[1].1.job_id, "task-b");
    }

    #[tokio::test]
    async fn test_settled_entries_stay_settled_after_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normal.wal");
        {
            let mut log = SegmentLog::open(&path).await.unwrap();
            log.push(&job("a")).await.unwrap();
            log.push(&job("b")).await.unwrap();
            let (seq, _) = log.take().await.unwrap().unwrap();
            log.settle(seq).await.unwrap();
        }

        let log = SegmentLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.recovered_jobs()[0].1.job_id, "task-b");
    }

    #[tokio::test]
    async fn test_torn_trailing_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normal.wal");
        {
            let mut log = SegmentLog::open(&path).await.unwrap();
            log.push(&job("a")).await.unwrap();
        }
        // Simulate a crash mid-append.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"op\":\"push\",\"seq\":1,\"jo").unwrap();
        }

        let log = SegmentLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.recovered_jobs()[0].1.job_id, "task-a");
    }

    #[tokio::test]
    async fn test_settle_of_pending_entry_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SegmentLog::open(dir.path().join("normal.wal")).await.unwrap();
        let seq_a = log.push(&job("a")).await.unwrap();
        log.push(&job("b")).await.unwrap();

        // Cancel path: settle without take.
        log.settle(seq_a).await.unwrap();
        let (_, next) = log.take().await.unwrap().unwrap();
        assert_eq!(next.job_id, "task-b");
    }

    #[tokio::test]
    async fn test_compaction_preserves_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normal.wal");
        let mut log = SegmentLog::open(&path).await.unwrap();

        // Enough settle traffic to trip compaction.
        for i in 0..(COMPACT_SETTLED_THRESHOLD + 8) {
            log.push(&job(&format!("churn-{i}"))).await.unwrap();
            let (seq, _) = log.take().await.unwrap().unwrap();
            log.settle(seq).await.unwrap();
        }
        log.push(&job("survivor")).await.unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        // The rewritten log should hold a handful of records, not hundreds.
        assert!(size < 20_000, "log not compacted: {size} bytes");

        let log = SegmentLog::open(&path).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.recovered_jobs()[0].1.job_id, "task-survivor");
    }
}
