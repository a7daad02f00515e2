use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::warn;

use flywheel_core::events::{BroadcastEvent, EventKind};
use flywheel_core::ids::{JobId, SubscriberId, TaskId};

/// Callback invoked synchronously for every event of the subscribed job.
pub type EventCallback = Arc<dyn Fn(&BroadcastEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriberId,
    token: u64,
    callback: EventCallback,
}

#[derive(Default)]
struct JobEntry {
    active: bool,
    subscribers: Vec<Subscriber>,
}

/// In-memory per-job publish/subscribe hub. Events are delivered
/// synchronously, in emission order, to the subscribers registered at the
/// moment of the broadcast; there is no buffering and no replay — history
/// lives in the store, not here.
pub struct Broadcaster {
    jobs: DashMap<JobId, JobEntry>,
    next_token: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Mark a job active. Idempotent.
    pub fn start_job(&self, job_id: &JobId) {
        self.jobs.entry(job_id.clone()).or_default().active = true;
    }

    pub fn is_job_active(&self, job_id: &JobId) -> bool {
        self.jobs.get(job_id).map(|e| e.active).unwrap_or(false)
    }

    /// Deliver a terminal `job_ended` event to every current subscriber,
    /// then drop all state for the job. Later subscribers see nothing.
    pub fn end_job(&self, job_id: &JobId, reason: &str) {
        let event = BroadcastEvent::new(
            EventKind::JobEnded,
            job_id.clone(),
            json!({ "reason": reason }),
        );
        if let Some((_, entry)) = self.jobs.remove(job_id) {
            for sub in &entry.subscribers {
                deliver(&sub.id, &sub.callback, &event);
            }
        }
    }

    /// Register a callback for every future broadcast scoped to this job.
    /// The same subscriber id may be registered twice; each registration is
    /// an independent entry and dedup is the caller's responsibility.
    pub fn subscribe(
        self: &Arc<Self>,
        job_id: &JobId,
        subscriber_id: SubscriberId,
        callback: EventCallback,
    ) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.jobs
            .entry(job_id.clone())
            .or_default()
            .subscribers
            .push(Subscriber {
                id: subscriber_id.clone(),
                token,
                callback,
            });

        Subscription {
            hub: Arc::clone(self),
            job_id: job_id.clone(),
            subscriber_id,
            token,
        }
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.jobs.get(job_id).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    /// Fan an event out to the job's current subscribers, in registration
    /// order. Dropped silently when nobody is listening.
    pub fn broadcast(&self, event: BroadcastEvent) {
        // Snapshot the callbacks so a subscriber acting on the hub from
        // inside its callback cannot deadlock the shard lock.
        let subscribers: Vec<(SubscriberId, EventCallback)> = match self.jobs.get(&event.job_id) {
            Some(entry) => entry
                .subscribers
                .iter()
                .map(|s| (s.id.clone(), Arc::clone(&s.callback)))
                .collect(),
            None => return,
        };

        for (id, callback) in subscribers {
            deliver(&id, &callback, &event);
        }
    }

    fn unsubscribe(&self, job_id: &JobId, token: u64) {
        if let Some(mut entry) = self.jobs.get_mut(job_id) {
            entry.subscribers.retain(|s| s.token != token);
        }
    }

    // -- typed emitters --

    pub fn broadcast_job_started(&self, job_id: &JobId) {
        self.broadcast(BroadcastEvent::new(EventKind::JobStarted, job_id.clone(), Value::Null));
    }

    pub fn broadcast_job_resumed(&self, job_id: &JobId) {
        self.broadcast(BroadcastEvent::new(EventKind::JobResumed, job_id.clone(), Value::Null));
    }

    pub fn broadcast_job_paused(&self, job_id: &JobId) {
        self.broadcast(BroadcastEvent::new(EventKind::JobPaused, job_id.clone(), Value::Null));
    }

    pub fn broadcast_job_completed(
        &self,
        job_id: &JobId,
        cycles_run: u32,
        total_tasks: u32,
        reason: &str,
    ) {
        self.broadcast(BroadcastEvent::new(
            EventKind::JobCompleted,
            job_id.clone(),
            json!({ "cycles_run": cycles_run, "total_tasks": total_tasks, "reason": reason }),
        ));
    }

    pub fn broadcast_job_error(&self, job_id: &JobId, message: &str) {
        self.broadcast(BroadcastEvent::new(
            EventKind::JobError,
            job_id.clone(),
            json!({ "error": message }),
        ));
    }

    pub fn broadcast_cycle_started(&self, job_id: &JobId, cycle: u32) {
        self.broadcast(
            BroadcastEvent::new(EventKind::CycleStarted, job_id.clone(), Value::Null)
                .with_cycle(cycle),
        );
    }

    pub fn broadcast_cycle_phase(&self, job_id: &JobId, cycle: u32, phase: &str) {
        self.broadcast(
            BroadcastEvent::new(EventKind::CyclePhase, job_id.clone(), json!({ "phase": phase }))
                .with_cycle(cycle),
        );
    }

    pub fn broadcast_cycle_tasks_discovered(&self, job_id: &JobId, cycle: u32, tasks: Value) {
        self.broadcast(
            BroadcastEvent::new(
                EventKind::CycleTasksDiscovered,
                job_id.clone(),
                json!({ "tasks": tasks }),
            )
            .with_cycle(cycle),
        );
    }

    pub fn broadcast_cycle_completed(&self, job_id: &JobId, cycle: u32, summary: Option<&str>) {
        self.broadcast(
            BroadcastEvent::new(
                EventKind::CycleCompleted,
                job_id.clone(),
                json!({ "summary": summary }),
            )
            .with_cycle(cycle),
        );
    }

    pub fn broadcast_task_started(&self, job_id: &JobId, cycle: u32, task_id: &TaskId, description: &str) {
        self.broadcast(
            BroadcastEvent::new(
                EventKind::TaskStarted,
                job_id.clone(),
                json!({ "description": description }),
            )
            .with_cycle(cycle)
            .with_task(task_id.clone()),
        );
    }

    pub fn broadcast_task_progress(&self, job_id: &JobId, cycle: Option<u32>, task_id: Option<&TaskId>, message: &str) {
        let mut event = BroadcastEvent::new(
            EventKind::TaskProgress,
            job_id.clone(),
            json!({ "message": message }),
        );
        if let Some(c) = cycle {
            event = event.with_cycle(c);
        }
        if let Some(t) = task_id {
            event = event.with_task(t.clone());
        }
        self.broadcast(event);
    }

    pub fn broadcast_task_completed(&self, job_id: &JobId, cycle: u32, task_id: &TaskId, summary: &str) {
        self.broadcast(
            BroadcastEvent::new(
                EventKind::TaskCompleted,
                job_id.clone(),
                json!({ "summary": summary }),
            )
            .with_cycle(cycle)
            .with_task(task_id.clone()),
        );
    }

    pub fn broadcast_task_failed(&self, job_id: &JobId, cycle: u32, task_id: &TaskId, error: &str) {
        self.broadcast(
            BroadcastEvent::new(
                EventKind::TaskFailed,
                job_id.clone(),
                json!({ "error": error }),
            )
            .with_cycle(cycle)
            .with_task(task_id.clone()),
        );
    }

    pub fn broadcast_agent_message(&self, job_id: &JobId, cycle: Option<u32>, task_id: Option<&TaskId>, text: &str) {
        let mut event = BroadcastEvent::new(
            EventKind::AgentMessage,
            job_id.clone(),
            json!({ "text": text }),
        );
        if let Some(c) = cycle {
            event = event.with_cycle(c);
        }
        if let Some(t) = task_id {
            event = event.with_task(t.clone());
        }
        self.broadcast(event);
    }
}

/// Invoke one subscriber, isolating its panics so one misbehaving callback
/// cannot block delivery to the rest.
fn deliver(id: &SubscriberId, callback: &EventCallback, event: &BroadcastEvent) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!(subscriber_id = %id, event = event.event_type(), "subscriber panicked, continuing delivery");
    }
}

/// Capability to deregister one subscription. Unsubscribes on drop.
pub struct Subscription {
    hub: Arc<Broadcaster>,
    job_id: JobId,
    subscriber_id: SubscriberId,
    token: u64,
}

impl Subscription {
    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber_id
    }

    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.job_id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn capture() -> (EventCallback, Arc<Mutex<Vec<String>>>) {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: EventCallback = Arc::new(move |evt| sink.lock().push(evt.event_type().to_string()));
        (cb, seen)
    }

    #[test]
    fn start_job_is_idempotent() {
        let hub = Broadcaster::new();
        let job = JobId::new();
        hub.start_job(&job);
        hub.start_job(&job);
        assert!(hub.is_job_active(&job));
    }

    #[test]
    fn subscriber_receives_events_in_order() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();
        let (cb, seen) = capture();
        let _sub = hub.subscribe(&job, SubscriberId::new(), cb);

        hub.broadcast_job_started(&job);
        hub.broadcast_cycle_started(&job, 1);
        hub.broadcast_cycle_phase(&job, 1, "execution");

        assert_eq!(*seen.lock(), vec!["job_started", "cycle_started", "cycle_phase"]);
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();
        hub.start_job(&job);

        hub.broadcast_job_started(&job); // nobody listening — dropped

        let (cb, seen) = capture();
        let _sub = hub.subscribe(&job, SubscriberId::new(), cb);
        hub.broadcast_cycle_started(&job, 1);

        assert_eq!(*seen.lock(), vec!["cycle_started"]);
    }

    #[test]
    fn broadcast_without_subscribers_is_dropped() {
        let hub = Broadcaster::new();
        let job = JobId::new();
        // No registration at all: must not panic or accumulate anything.
        hub.broadcast_job_started(&job);
        assert_eq!(hub.subscriber_count(&job), 0);
    }

    #[test]
    fn multiple_subscribers_all_receive() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();
        let (cb1, seen1) = capture();
        let (cb2, seen2) = capture();
        let _s1 = hub.subscribe(&job, SubscriberId::new(), cb1);
        let _s2 = hub.subscribe(&job, SubscriberId::new(), cb2);

        hub.broadcast_job_started(&job);

        assert_eq!(*seen1.lock(), vec!["job_started"]);
        assert_eq!(*seen2.lock(), vec!["job_started"]);
    }

    #[test]
    fn duplicate_subscriber_ids_are_independent() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();
        let dup = SubscriberId::from_raw("sub_dup");
        let (cb1, seen1) = capture();
        let (cb2, seen2) = capture();
        let s1 = hub.subscribe(&job, dup.clone(), cb1);
        let _s2 = hub.subscribe(&job, dup, cb2);

        hub.broadcast_job_started(&job);
        drop(s1);
        hub.broadcast_job_paused(&job);

        assert_eq!(*seen1.lock(), vec!["job_started"]);
        assert_eq!(*seen2.lock(), vec!["job_started", "job_paused"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();
        let (cb, seen) = capture();
        let sub = hub.subscribe(&job, SubscriberId::new(), cb);

        hub.broadcast_job_started(&job);
        sub.unsubscribe();
        hub.broadcast_job_paused(&job);

        assert_eq!(*seen.lock(), vec!["job_started"]);
        assert_eq!(hub.subscriber_count(&job), 0);
    }

    #[test]
    fn end_job_delivers_final_event_then_clears() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();
        hub.start_job(&job);
        let (cb, seen) = capture();
        let _sub = hub.subscribe(&job, SubscriberId::new(), cb);

        hub.end_job(&job, "completed");

        assert_eq!(*seen.lock(), vec!["job_ended"]);
        assert!(!hub.is_job_active(&job));

        // A subscriber registered afterwards never sees the terminal event.
        let (cb2, seen2) = capture();
        let _late = hub.subscribe(&job, SubscriberId::new(), cb2);
        assert!(seen2.lock().is_empty());
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();

        let bad: EventCallback = Arc::new(|_| panic!("bad subscriber"));
        let _s1 = hub.subscribe(&job, SubscriberId::new(), bad);
        let (cb, seen) = capture();
        let _s2 = hub.subscribe(&job, SubscriberId::new(), cb);

        hub.broadcast_job_started(&job);

        assert_eq!(*seen.lock(), vec!["job_started"]);
    }

    #[test]
    fn events_scoped_to_their_job() {
        let hub = Arc::new(Broadcaster::new());
        let job_a = JobId::new();
        let job_b = JobId::new();
        let (cb, seen) = capture();
        let _sub = hub.subscribe(&job_a, SubscriberId::new(), cb);

        hub.broadcast_job_started(&job_b);
        assert!(seen.lock().is_empty());

        hub.broadcast_job_started(&job_a);
        assert_eq!(*seen.lock(), vec!["job_started"]);
    }

    #[test]
    fn task_events_carry_cycle_and_task() {
        let hub = Arc::new(Broadcaster::new());
        let job = JobId::new();
        let task = TaskId::new();

        let captured: Arc<Mutex<Vec<BroadcastEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        let cb: EventCallback = Arc::new(move |evt| sink.lock().push(evt.clone()));
        let _sub = hub.subscribe(&job, SubscriberId::new(), cb);

        hub.broadcast_task_failed(&job, 2, &task, "no worker available");

        let events = captured.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cycle, Some(2));
        assert_eq!(events[0].task_id.as_ref(), Some(&task));
        assert_eq!(events[0].payload["error"], "no worker available");
    }
}
