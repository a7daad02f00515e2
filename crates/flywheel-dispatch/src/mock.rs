use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use parking_lot::Mutex;

use flywheel_core::dispatch::{
    AcquireOptions, ExecutionTransport, WorkEvent, WorkRequest, WorkStream, WorkerAssignment,
    WorkerCoordinator,
};
use flywheel_core::errors::DispatchError;
use flywheel_core::ids::{SessionId, WorkerId};

/// Scripted transport behavior for deterministic tests without workers.
#[derive(Clone, Debug)]
pub enum MockWork {
    /// Progress then a terminal Completed event.
    Completed { summary: String, branch: Option<String> },
    /// Progress then a terminal Failed event.
    Failed { message: String },
    /// A stream that ends without a terminal event.
    Truncated,
    /// The execute() call itself errors.
    Unreachable { reason: String },
    /// Wait a duration, then behave as the inner response.
    Delay(Duration, Box<MockWork>),
}

impl MockWork {
    pub fn completed(summary: &str) -> Self {
        Self::Completed {
            summary: summary.into(),
            branch: None,
        }
    }

    pub fn failed(message: &str) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn delayed(delay: Duration, inner: MockWork) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock transport. Responses are routed by prompt substring — the last
/// matching route wins, so tests can override earlier routes — falling back
/// to a default. Routing keeps concurrent dispatch deterministic where a
/// sequential script would not be.
pub struct MockTransport {
    routes: Mutex<Vec<(String, MockWork)>>,
    default: MockWork,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn completing(summary: &str) -> Self {
        Self::with_default(MockWork::completed(summary))
    }

    pub fn with_default(default: MockWork) -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            default,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Route prompts containing `needle` to `work`.
    pub fn route(self, needle: &str, work: MockWork) -> Self {
        self.routes.lock().push((needle.to_string(), work));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Prompts seen so far, in dispatch order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn lookup(&self, prompt: &str) -> MockWork {
        let routes = self.routes.lock();
        routes
            .iter()
            .rev()
            .find(|(needle, _)| prompt.contains(needle))
            .map(|(_, work)| work.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

async fn resolve(work: MockWork) -> Result<WorkStream, DispatchError> {
    let mut current = work;
    loop {
        match current {
            MockWork::Completed { summary, branch } => {
                let events = vec![
                    Ok(WorkEvent::Progress { message: "working".into() }),
                    Ok(WorkEvent::Completed { summary, branch }),
                ];
                return Ok(Box::pin(stream::iter(events)));
            }
            MockWork::Failed { message } => {
                let events = vec![Ok(WorkEvent::Failed { message })];
                return Ok(Box::pin(stream::iter(events)));
            }
            MockWork::Truncated => {
                let events = vec![Ok(WorkEvent::Progress { message: "working".into() })];
                return Ok(Box::pin(stream::iter(events)));
            }
            MockWork::Unreachable { reason } => {
                return Err(DispatchError::WorkerUnreachable(reason));
            }
            MockWork::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[async_trait]
impl ExecutionTransport for MockTransport {
    async fn execute(
        &self,
        _assignment: &WorkerAssignment,
        request: &WorkRequest,
    ) -> Result<WorkStream, DispatchError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(request.prompt.clone());
        resolve(self.lookup(&request.prompt)).await
    }
}

/// Mock coordinator handing out synthetic assignments, with optional
/// per-call denials to simulate a saturated pool.
pub struct MockCoordinator {
    acquire_calls: AtomicUsize,
    release_calls: AtomicUsize,
    failed_calls: AtomicUsize,
    /// 1-based acquire call indexes that are denied.
    denied_calls: Vec<usize>,
    active: DashMap<WorkerId, SessionId>,
    failure_reasons: Mutex<Vec<String>>,
}

impl MockCoordinator {
    pub fn unlimited() -> Self {
        Self {
            acquire_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            failed_calls: AtomicUsize::new(0),
            denied_calls: Vec::new(),
            active: DashMap::new(),
            failure_reasons: Mutex::new(Vec::new()),
        }
    }

    /// Deny the given 1-based acquire call indexes, grant the rest.
    pub fn denying_calls(calls: &[usize]) -> Self {
        let mut coordinator = Self::unlimited();
        coordinator.denied_calls = calls.to_vec();
        coordinator
    }

    pub fn acquire_count(&self) -> usize {
        self.acquire_calls.load(Ordering::Relaxed)
    }

    pub fn release_count(&self) -> usize {
        self.release_calls.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> usize {
        self.failed_calls.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn failure_reasons(&self) -> Vec<String> {
        self.failure_reasons.lock().clone()
    }
}

#[async_trait]
impl WorkerCoordinator for MockCoordinator {
    async fn acquire(
        &self,
        session_id: &SessionId,
        options: &AcquireOptions,
    ) -> Result<Option<WorkerAssignment>, DispatchError> {
        let call = self.acquire_calls.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(cb) = &options.on_attempt {
            cb(1);
        }
        if self.denied_calls.contains(&call) {
            return Ok(None);
        }
        let worker_id = WorkerId::new();
        self.active.insert(worker_id.clone(), session_id.clone());
        Ok(Some(WorkerAssignment {
            worker_id: worker_id.clone(),
            session_id: session_id.clone(),
            url: format!("mock://{worker_id}"),
        }))
    }

    async fn release(&self, worker_id: &WorkerId, _session_id: &SessionId) {
        self.release_calls.fetch_add(1, Ordering::Relaxed);
        self.active.remove(worker_id);
    }

    async fn mark_failed(&self, worker_id: &WorkerId, _session_id: &SessionId, reason: &str) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_reasons.lock().push(reason.to_string());
        self.active.remove(worker_id);
    }
}
