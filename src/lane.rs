//! Write Lane — the two-level write serializer.
//!
//! Global admission caps writes in flight across the process; per-record
//! locks guarantee at most one writer per memory id (or per path key for
//! alias/delete operations). Record locks are fair, so waiters are admitted
//! in arrival order. A writer that cannot acquire both levels within the
//! configured wait budget fails with `lane_timeout` and mutates nothing.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};

use crate::errors::{PalaceError, Result};

pub struct WriteLane {
    global: Arc<Semaphore>,
    records: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    wait_timeout: Duration,
    global_concurrency: usize,
    active: AtomicU64,
    waiting: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct LaneStatus {
    pub global_concurrency: usize,
    pub active: u64,
    pub waiting: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub wait_timeout_ms: u64,
}

/// Tokens held for the duration of one write. Dropping releases the record
/// lock first, then the global permit (reverse acquisition order).
pub struct LaneTicket {
    _record: OwnedMutexGuard<()>,
    _global: OwnedSemaphorePermit,
}

impl WriteLane {
    pub fn new(global_concurrency: usize, wait_timeout: Duration) -> Self {
        let global_concurrency = global_concurrency.max(1);
        Self {
            global: Arc::new(Semaphore::new(global_concurrency)),
            records: Mutex::new(HashMap::new()),
            wait_timeout,
            global_concurrency,
            active: AtomicU64::new(0),
            waiting: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &crate::config::LaneConfig) -> Self {
        Self::new(
            config.global_concurrency,
            Duration::from_millis(config.wait_timeout_ms),
        )
    }

    /// Acquire the global permit then the per-record lock, within one shared
    /// deadline.
    pub async fn admit(&self, record_key: &str) -> Result<LaneTicket> {
        let deadline = Instant::now() + self.wait_timeout;
        self.waiting.fetch_add(1, Ordering::Relaxed);

        let global = match timeout_at(deadline, Arc::clone(&self.global).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                self.waiting.fetch_sub(1, Ordering::Relaxed);
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                return Err(PalaceError::LaneTimeout(self.wait_timeout.as_millis() as u64));
            }
        };

        let record_lock = {
            let mut records = self.records.lock().await;
            Arc::clone(
                records
                    .entry(record_key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let record = match timeout_at(deadline, record_lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.waiting.fetch_sub(1, Ordering::Relaxed);
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                return Err(PalaceError::LaneTimeout(self.wait_timeout.as_millis() as u64));
            }
        };

        self.waiting.fetch_sub(1, Ordering::Relaxed);
        Ok(LaneTicket {
            _record: record,
            _global: global,
        })
    }

    /// Run one write operation under the lane.
    pub async fn run<T, Fut>(
        &self,
        record_key: &str,
        op: impl FnOnce() -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let ticket = self.admit(record_key).await?;
        self.active.fetch_add(1, Ordering::Relaxed);
        let result = op().await;
        drop(ticket);
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        result
    }

    pub fn status(&self) -> LaneStatus {
        LaneStatus {
            global_concurrency: self.global_concurrency,
            active: self.active.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            wait_timeout_ms: self.wait_timeout.as_millis() as u64,
        }
    }
}

/// Lane key for operations addressed at a memory record.
pub fn memory_key(memory_id: i64) -> String {
    format!("memory:{memory_id}")
}

/// Lane key for operations addressed at a path (create/alias/delete).
pub fn path_key(domain: &str, path: &str) -> String {
    format!("path:{domain}://{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn serializes_same_record() {
        let lane = Arc::new(WriteLane::new(4, Duration::from_secs(5)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lane = Arc::clone(&lane);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                lane.run(&memory_key(7), || async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Same record: never more than one writer at a time.
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(lane.status().completed, 8);
    }

    #[tokio::test]
    async fn different_records_run_concurrently() {
        let lane = Arc::new(WriteLane::new(4, Duration::from_secs(5)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let lane = Arc::clone(&lane);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                lane.run(&memory_key(i), || async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn global_admission_caps_concurrency() {
        let lane = Arc::new(WriteLane::new(2, Duration::from_secs(5)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let lane = Arc::clone(&lane);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                lane.run(&memory_key(i), || async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn blocked_writer_times_out_without_effect() {
        let lane = Arc::new(WriteLane::new(4, Duration::from_millis(50)));
        let ticket = lane.admit(&memory_key(1)).await.unwrap();

        let err = lane
            .run(&memory_key(1), || async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "lane_timeout");
        assert_eq!(lane.status().timed_out, 1);
        drop(ticket);

        // The lane recovers once the holder releases.
        lane.run(&memory_key(1), || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn fifo_per_record() {
        let lane = Arc::new(WriteLane::new(4, Duration::from_secs(5)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lane.admit(&memory_key(9)).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..3 {
            let lane = Arc::clone(&lane);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                lane.run(&memory_key(9), || async {
                    order.lock().await.push(i);
                    Ok(())
                })
                .await
            }));
            // Stagger arrivals so the queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
