//! Operation Worker Pool
//!
//! Runs volume operations with bounded concurrency. Jobs sharing a key run
//! one at a time in submission order; jobs with different keys run in
//! parallel up to `max_concurrent`.

use crate::error::{Error, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { max_concurrent: 64 }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    running: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub submitted: u64,
    pub completed: u64,
    pub running: u64,
    pub queued: u64,
    pub panicked: u64,
    pub max_concurrent: usize,
}

/// Waits for a submitted job's output
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// The job's output; an error if it panicked or the pool shut down first
    pub async fn join(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::Internal("job dropped before completion".into()))
    }
}

/// Keyed worker pool
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    lanes: Arc<Mutex<HashMap<String, VecDeque<Job>>>>,
    counters: Arc<PoolCounters>,
    max_concurrent: usize,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(PoolCounters::default()),
            max_concurrent,
        }
    }

    /// Queue `fut` behind earlier jobs with the same key
    pub fn submit<T, F>(&self, key: impl Into<String>, fut: F) -> JobHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(fut.await);
        });
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let key = key.into();
        let first = {
            let mut lanes = self.lanes.lock();
            match lanes.get_mut(&key) {
                Some(queue) => {
                    queue.push_back(job);
                    None
                }
                None => {
                    lanes.insert(key.clone(), VecDeque::new());
                    Some(job)
                }
            }
        };
        if let Some(job) = first {
            self.spawn_lane(key, job);
        }
        JobHandle { rx }
    }

    /// Drain one key's queue on its own task
    fn spawn_lane(&self, key: String, first: Job) {
        let permits = self.permits.clone();
        let lanes = self.lanes.clone();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(job) = next {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    debug!("Worker pool closed, dropping lane {}", key);
                    lanes.lock().remove(&key);
                    return;
                };
                counters.running.fetch_add(1, Ordering::Relaxed);
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Job on lane {} panicked", key);
                    counters.panicked.fetch_add(1, Ordering::Relaxed);
                }
                counters.running.fetch_sub(1, Ordering::Relaxed);
                counters.completed.fetch_add(1, Ordering::Relaxed);
                drop(permit);

                next = {
                    let mut lanes = lanes.lock();
                    let job = lanes.get_mut(&key).and_then(|q| q.pop_front());
                    if job.is_none() {
                        lanes.remove(&key);
                    }
                    job
                };
            }
        });
    }

    /// Stop starting jobs; queued jobs are dropped
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn stats(&self) -> WorkerStats {
        let queued = self.lanes.lock().values().map(|q| q.len() as u64).sum();
        WorkerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            running: self.counters.running.load(Ordering::Relaxed),
            queued,
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_order() {
        let pool = WorkerPool::new(WorkerConfig { max_concurrent: 8 });
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                pool.submit("vol-1", async move {
                    // Later jobs finish faster; order must still hold
                    tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                    order.lock().push(i);
                    i
                })
            })
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().await.unwrap(), i as u64);
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(WorkerConfig { max_concurrent: 2 });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                pool.submit(format!("vol-{}", i), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let stats = pool.stats();
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stall_lane() {
        let pool = WorkerPool::new(WorkerConfig::default());
        let bad = pool.submit("vol-1", async { panic!("boom") });
        let good = pool.submit("vol-1", async { 7 });

        assert!(bad.join().await.is_err());
        assert_eq!(good.join().await.unwrap(), 7);
        assert_eq!(pool.stats().panicked, 1);
    }

    #[tokio::test]
    async fn test_close_drops_queued_jobs() {
        let pool = WorkerPool::new(WorkerConfig { max_concurrent: 1 });
        pool.close();
        let handle = pool.submit("vol-1", async { 1 });
        assert!(handle.join().await.is_err());
    }
}
