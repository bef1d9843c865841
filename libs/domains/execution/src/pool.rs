//! The worker pool: dynamic worker set plus the autoscaler.

use crate::error::PoolError;
use crate::executor::JobExecutor;
use crate::worker::{Worker, WorkerInfo};
use metrics::gauge;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysmon::ResourceSensor;
use task_queue::DurableQueue;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue depth per worker above which the pool scales up.
    pub scale_threshold: usize,
    /// Worker queue-poll cadence.
    pub poll_interval: Duration,
    /// Autoscaler cadence.
    pub scale_interval: Duration,
    /// Resource gates for scaling up.
    pub scale_cpu_limit: f64,
    pub scale_memory_limit: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            scale_threshold: 5,
            poll_interval: Duration::from_secs(2),
            scale_interval: Duration::from_secs(10),
            scale_cpu_limit: 80.0,
            scale_memory_limit: 70.0,
        }
    }
}

/// Pool-level introspection payload.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerInfo>,
    pub worker_count: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_depth: usize,
}

struct WorkerHandle {
    worker: Arc<Worker>,
    task: JoinHandle<()>,
}

struct PoolInner {
    workers: HashMap<String, WorkerHandle>,
    next_worker_index: usize,
    running: bool,
}

/// Dynamic set of workers pulling from the queue, scaled on queue depth
/// and resource pressure. Invariant: `min_workers <= live <= max_workers`
/// at all times, including during scaling operations.
pub struct WorkerPool {
    queue: Arc<DurableQueue>,
    executor: Arc<JobExecutor>,
    sensor: Arc<ResourceSensor>,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    scaler: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<DurableQueue>,
        executor: Arc<JobExecutor>,
        sensor: Arc<ResourceSensor>,
        config: PoolConfig,
    ) -> Self {
        info!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            scale_threshold = config.scale_threshold,
            "Worker pool initialized"
        );
        Self {
            queue,
            executor,
            sensor,
            config,
            inner: Mutex::new(PoolInner {
                workers: HashMap::new(),
                next_worker_index: 0,
                running: false,
            }),
            scaler: Mutex::new(None),
        }
    }

    pub fn executor(&self) -> Arc<JobExecutor> {
        Arc::clone(&self.executor)
    }

    /// Launch `min_workers` workers and the background scaler.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.running = true;
        }
        for _ in 0..self.config.min_workers {
            if let Err(e) = self.add_worker(None).await {
                error!("Failed to start initial worker: {e}");
            }
        }

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.scale_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !pool.inner.lock().await.running {
                    break;
                }
                pool.scale_tick().await;
            }
        });
        *self.scaler.lock().await = Some(handle);

        info!(workers = self.worker_count().await, "Worker pool started");
    }

    /// Add a worker, refusing at `max_workers`.
    pub async fn add_worker(&self, worker_id: Option<String>) -> Result<String, PoolError> {
        let mut inner = self.inner.lock().await;

        if inner.workers.len() >= self.config.max_workers {
            warn!("Cannot add worker: max workers reached");
            return Err(PoolError::AtMax(self.config.max_workers));
        }

        let worker_id = match worker_id {
            Some(id) => {
                if inner.workers.contains_key(&id) {
                    return Err(PoolError::Duplicate(id));
                }
                id
            }
            None => {
                let id = format!("worker-{}", inner.next_worker_index);
                inner.next_worker_index += 1;
                id
            }
        };

        let worker = Arc::new(Worker::new(
            worker_id.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.executor),
            self.config.poll_interval,
        ));
        let task = tokio::spawn(Arc::clone(&worker).run());
        inner
            .workers
            .insert(worker_id.clone(), WorkerHandle { worker, task });

        gauge!("worker_pool_size").set(inner.workers.len() as f64);
        info!(worker_id = %worker_id, count = inner.workers.len(), "Added worker");
        Ok(worker_id)
    }

    /// Remove a worker, refusing at `min_workers`. Waits up to 10 s for a
    /// graceful exit, then aborts the task.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<(), PoolError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            if !inner.workers.contains_key(worker_id) {
                return Err(PoolError::NotFound(worker_id.to_string()));
            }
            if inner.workers.len() <= self.config.min_workers {
                warn!("Cannot remove worker: min workers reached");
                return Err(PoolError::AtMin(self.config.min_workers));
            }
            let handle = inner.workers.remove(worker_id).expect("checked above");
            gauge!("worker_pool_size").set(inner.workers.len() as f64);
            handle
        };

        handle.worker.stop().await;
        let mut task = handle.task;
        if tokio::time::timeout(Duration::from_secs(10), &mut task)
            .await
            .is_err()
        {
            warn!(worker_id, "Worker did not stop gracefully, cancelling");
            task.abort();
        }

        info!(worker_id, "Removed worker");
        Ok(())
    }

    /// Pause every worker (they keep polling but take no work).
    pub async fn pause_all(&self) {
        let inner = self.inner.lock().await;
        for handle in inner.workers.values() {
            handle.worker.pause();
        }
        info!("All workers paused");
    }

    pub async fn resume_all(&self) {
        let inner = self.inner.lock().await;
        for handle in inner.workers.values() {
            handle.worker.resume();
        }
        info!("All workers resumed");
    }

    /// Manually scale to a target worker count within the configured
    /// bounds. Returns (previous, current).
    pub async fn scale_to(&self, target: usize) -> Result<(usize, usize), PoolError> {
        if target < self.config.min_workers || target > self.config.max_workers {
            return Err(PoolError::OutOfBounds {
                target,
                min: self.config.min_workers,
                max: self.config.max_workers,
            });
        }

        let previous = self.worker_count().await;
        if target > previous {
            for _ in 0..(target - previous) {
                self.add_worker(None).await?;
            }
        } else if target < previous {
            for _ in 0..(previous - target) {
                let Some(victim) = self.pick_removable().await else {
                    break;
                };
                self.remove_worker(&victim).await?;
            }
        }

        Ok((previous, self.worker_count().await))
    }

    /// One autoscaler pass.
    ///
    /// Scale up when the backlog outgrows the fleet and the host has
    /// headroom; scale down when the fleet outnumbers the backlog, by
    /// removing an idle worker. Readings are instantaneous; there is no
    /// hysteresis.
    async fn scale_tick(&self) {
        let queue_depth = self.queue.depth().await;
        let live = self.worker_count().await;
        let usage = self.sensor.sample();

        if queue_depth > self.config.scale_threshold * live
            && live < self.config.max_workers
            && usage.cpu_percent < self.config.scale_cpu_limit
            && usage.memory_percent < self.config.scale_memory_limit
        {
            match self.add_worker(None).await {
                Ok(_) => info!(
                    workers = live + 1,
                    queue_depth, "Scaled up worker pool"
                ),
                Err(e) => warn!("Scale-up failed: {e}"),
            }
        } else if queue_depth < live && live > self.config.min_workers {
            if let Some(victim) = self.pick_idle().await {
                match self.remove_worker(&victim).await {
                    Ok(()) => info!(workers = live - 1, "Scaled down worker pool"),
                    Err(e) => warn!("Scale-down failed: {e}"),
                }
            }
        }
    }

    /// Signal every worker to stop, wait briefly, then cancel stragglers
    /// and clean up executor state.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.running = false;
        }
        if let Some(scaler) = self.scaler.lock().await.take() {
            scaler.abort();
        }

        let handles: Vec<WorkerHandle> = {
            let mut inner = self.inner.lock().await;
            inner.workers.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.worker.stop().await;
        }
        let mut tasks: Vec<JoinHandle<()>> = handles.into_iter().map(|h| h.task).collect();
        if tokio::time::timeout(
            Duration::from_secs(2),
            futures::future::join_all(tasks.iter_mut()),
        )
        .await
        .is_err()
        {
            warn!("Workers did not stop within grace period, cancelling");
        }
        for task in tasks {
            task.abort();
        }

        gauge!("worker_pool_size").set(0.0);
        self.executor.cleanup_resources().await;
        info!("Worker pool stopped");
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    pub async fn status(&self) -> PoolStatus {
        let workers: Vec<Arc<Worker>> = {
            let inner = self.inner.lock().await;
            inner
                .workers
                .values()
                .map(|handle| Arc::clone(&handle.worker))
                .collect()
        };

        let mut infos = Vec::with_capacity(workers.len());
        for worker in workers {
            infos.push(worker.info().await);
        }
        infos.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        PoolStatus {
            worker_count: infos.len(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            queue_depth: self.queue.depth().await,
            workers: infos,
        }
    }

    async fn pick_idle(&self) -> Option<String> {
        let workers: Vec<Arc<Worker>> = {
            let inner = self.inner.lock().await;
            inner
                .workers
                .values()
                .map(|handle| Arc::clone(&handle.worker))
                .collect()
        };
        for worker in workers {
            if worker.is_idle().await {
                return Some(worker.worker_id().to_string());
            }
        }
        None
    }

    /// Prefer an idle worker for removal, fall back to any.
    async fn pick_removable(&self) -> Option<String> {
        if let Some(idle) = self.pick_idle().await {
            return Some(idle);
        }
        let inner = self.inner.lock().await;
        inner.workers.keys().next().cloned()
    }
}
