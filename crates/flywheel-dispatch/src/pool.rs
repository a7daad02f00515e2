use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use flywheel_core::dispatch::{AcquireOptions, WorkerAssignment, WorkerCoordinator};
use flywheel_core::errors::DispatchError;
use flywheel_core::ids::{SessionId, WorkerId};

/// Consecutive transport failures after which a worker is taken out of
/// rotation until it next completes cleanly.
const EVICTION_THRESHOLD: u32 = 3;

/// One endpoint in the pool.
#[derive(Clone, Debug)]
pub struct PoolWorker {
    pub id: WorkerId,
    pub url: String,
}

impl PoolWorker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: WorkerId::new(),
            url: url.into(),
        }
    }
}

/// Coordinator over a fixed set of worker endpoints. The pool size is the
/// system-wide concurrency ceiling shared by every job in the process;
/// acquisition polls until a slot frees up or the attempts run out.
pub struct StaticPoolCoordinator {
    workers: Vec<PoolWorker>,
    busy: DashMap<WorkerId, SessionId>,
    strikes: DashMap<WorkerId, u32>,
}

impl StaticPoolCoordinator {
    pub fn new(workers: Vec<PoolWorker>) -> Self {
        Self {
            workers,
            busy: DashMap::new(),
            strikes: DashMap::new(),
        }
    }

    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(urls.into_iter().map(PoolWorker::new).collect())
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    fn is_evicted(&self, id: &WorkerId) -> bool {
        self.strikes.get(id).map(|s| *s >= EVICTION_THRESHOLD).unwrap_or(false)
    }

    fn try_claim(&self, session_id: &SessionId) -> Option<WorkerAssignment> {
        for worker in &self.workers {
            if self.is_evicted(&worker.id) {
                continue;
            }
            match self.busy.entry(worker.id.clone()) {
                dashmap::Entry::Occupied(_) => continue,
                dashmap::Entry::Vacant(slot) => {
                    slot.insert(session_id.clone());
                    return Some(WorkerAssignment {
                        worker_id: worker.id.clone(),
                        session_id: session_id.clone(),
                        url: worker.url.clone(),
                    });
                }
            }
        }
        None
    }
}

#[async_trait]
impl WorkerCoordinator for StaticPoolCoordinator {
    async fn acquire(
        &self,
        session_id: &SessionId,
        options: &AcquireOptions,
    ) -> Result<Option<WorkerAssignment>, DispatchError> {
        for attempt in 1..=options.retry_attempts.max(1) {
            if let Some(cb) = &options.on_attempt {
                cb(attempt);
            }

            if let Some(assignment) = self.try_claim(session_id) {
                debug!(worker_id = %assignment.worker_id, session_id = %session_id, "worker acquired");
                return Ok(Some(assignment));
            }

            if attempt < options.retry_attempts.max(1) {
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        debug!(session_id = %session_id, "pool saturated, no worker acquired");
        Ok(None)
    }

    async fn release(&self, worker_id: &WorkerId, session_id: &SessionId) {
        let removed = self
            .busy
            .remove_if(worker_id, |_, owner| owner == session_id)
            .is_some();
        if removed {
            self.strikes.remove(worker_id);
        } else {
            warn!(worker_id = %worker_id, session_id = %session_id, "release for unowned worker ignored");
        }
    }

    async fn mark_failed(&self, worker_id: &WorkerId, session_id: &SessionId, reason: &str) {
        let removed = self
            .busy
            .remove_if(worker_id, |_, owner| owner == session_id)
            .is_some();
        if removed {
            let strikes = {
                let mut entry = self.strikes.entry(worker_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            warn!(worker_id = %worker_id, session_id = %session_id, strikes, reason, "worker failure recorded");
        } else {
            warn!(worker_id = %worker_id, session_id = %session_id, "mark_failed for unowned worker ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(n: usize) -> StaticPoolCoordinator {
        StaticPoolCoordinator::from_urls((0..n).map(|i| format!("http://worker-{i}:8080")))
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let pool = pool(2);
        let session = SessionId::new();
        let opts = AcquireOptions::default();

        let assignment = pool.acquire(&session, &opts).await.unwrap().unwrap();
        assert_eq!(pool.busy_count(), 1);
        assert_eq!(assignment.session_id, session);

        pool.release(&assignment.worker_id, &session).await;
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn saturated_pool_returns_none() {
        let pool = pool(1);
        let opts = AcquireOptions::default();

        let s1 = SessionId::new();
        let _held = pool.acquire(&s1, &opts).await.unwrap().unwrap();

        let s2 = SessionId::new();
        let denied = pool.acquire(&s2, &opts).await.unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn retry_invokes_progress_callback() {
        let pool = pool(1);
        let s1 = SessionId::new();
        let _held = pool.acquire(&s1, &AcquireOptions::default()).await.unwrap().unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let opts = AcquireOptions {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            on_attempt: Some(Arc::new(move |n| {
                seen.fetch_max(n, Ordering::Relaxed);
            })),
        };

        let denied = pool.acquire(&SessionId::new(), &opts).await.unwrap();
        assert!(denied.is_none());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn retry_picks_up_freed_slot() {
        let pool = Arc::new(pool(1));
        let s1 = SessionId::new();
        let held = pool.acquire(&s1, &AcquireOptions::default()).await.unwrap().unwrap();

        let releasing = Arc::clone(&pool);
        let release_session = s1.clone();
        let worker_id = held.worker_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releasing.release(&worker_id, &release_session).await;
        });

        let opts = AcquireOptions {
            retry_attempts: 10,
            retry_delay: Duration::from_millis(10),
            on_attempt: None,
        };
        let acquired = pool.acquire(&SessionId::new(), &opts).await.unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn release_requires_owning_session() {
        let pool = pool(1);
        let owner = SessionId::new();
        let assignment = pool.acquire(&owner, &AcquireOptions::default()).await.unwrap().unwrap();

        // A stranger's release must not free the slot.
        pool.release(&assignment.worker_id, &SessionId::new()).await;
        assert_eq!(pool.busy_count(), 1);

        pool.release(&assignment.worker_id, &owner).await;
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn repeated_failures_evict_worker() {
        let pool = pool(1);
        let opts = AcquireOptions::default();

        for _ in 0..EVICTION_THRESHOLD {
            let session = SessionId::new();
            let a = pool.acquire(&session, &opts).await.unwrap().unwrap();
            pool.mark_failed(&a.worker_id, &session, "connection reset").await;
        }

        // Worker is out of rotation now.
        let denied = pool.acquire(&SessionId::new(), &opts).await.unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn clean_release_clears_strikes() {
        let pool = pool(1);
        let opts = AcquireOptions::default();

        for _ in 0..EVICTION_THRESHOLD - 1 {
            let session = SessionId::new();
            let a = pool.acquire(&session, &opts).await.unwrap().unwrap();
            pool.mark_failed(&a.worker_id, &session, "flaky").await;
        }

        let session = SessionId::new();
        let a = pool.acquire(&session, &opts).await.unwrap().unwrap();
        pool.release(&a.worker_id, &session).await;

        // Strikes were reset; the next failures start from zero.
        let session = SessionId::new();
        let a = pool.acquire(&session, &opts).await.unwrap();
        assert!(a.is_some());
    }

    #[tokio::test]
    async fn concurrent_acquires_claim_distinct_workers() {
        let pool = Arc::new(pool(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                p.acquire(&SessionId::new(), &AcquireOptions::default()).await.unwrap()
            }));
        }

        let mut worker_ids = Vec::new();
        for h in handles {
            let assignment = h.await.unwrap().expect("pool of 4 should satisfy 4 acquires");
            worker_ids.push(assignment.worker_id);
        }
        worker_ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        worker_ids.dedup();
        assert_eq!(worker_ids.len(), 4);
    }
}
