//! Durable delayed-event queue.
//!
//! An event is persisted with `scheduled` status before `enqueue` returns,
//! and is marked `fired` only after its handler has returned. A crash
//! between those two points re-runs the handler on recovery, which is why
//! handlers must claim their event in the event log before doing anything
//! externally visible.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::model::UserChatKey;
use crate::persist;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RemoveMember,
}

/// What the deadline is about. Opaque to the scheduler itself; only the
/// registered handler interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    pub case: UserChatKey,
    pub action: ActionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub event_id: EventId,
    pub fire_time: DateTime<Utc>,
    pub status: EventStatus,
    pub payload: EventPayload,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    next_event_id: u64,
    events: Vec<ScheduledEvent>,
}

struct SchedulerInner {
    next_event_id: u64,
    events: HashMap<EventId, ScheduledEvent>,
    // Scheduled-status events only, ordered by (fire_time, event_id).
    queue: BTreeSet<(DateTime<Utc>, EventId)>,
    // The event currently being handled by `run`. Its persisted status
    // stays `scheduled` until the handler returns, so a crash mid-handler
    // retries it on recovery.
    in_flight: Option<EventId>,
}

impl SchedulerInner {
    fn snapshot(&self) -> QueueSnapshot {
        let mut events: Vec<ScheduledEvent> = self.events.values().copied().collect();
        events.sort_by_key(|e| e.event_id);
        QueueSnapshot {
            next_event_id: self.next_event_id,
            events,
        }
    }
}

pub struct Scheduler {
    path: PathBuf,
    inner: Mutex<SchedulerInner>,
    notify: Notify,
}

impl Scheduler {
    /// Opens the queue, rebuilding the in-memory ordering from persisted
    /// state alone. Events whose fire time already elapsed will fire first
    /// once `run` starts.
    pub fn open(path: PathBuf) -> Result<Self> {
        let snapshot: QueueSnapshot = persist::load_snapshot(&path)?.unwrap_or_default();
        let mut events = HashMap::new();
        let mut queue = BTreeSet::new();
        let mut next_event_id = snapshot.next_event_id;
        for event in snapshot.events {
            next_event_id = next_event_id.max(event.event_id.0 + 1);
            if event.status == EventStatus::Scheduled {
                queue.insert((event.fire_time, event.event_id));
            }
            events.insert(event.event_id, event);
        }
        if !queue.is_empty() {
            info!("recovered {} scheduled event(s) from {}", queue.len(), path.display());
        }
        Ok(Scheduler {
            path,
            inner: Mutex::new(SchedulerInner {
                next_event_id,
                events,
                queue,
                in_flight: None,
            }),
            notify: Notify::new(),
        })
    }

    /// Durable before return: the event is on disk with `scheduled` status
    /// when this yields an id. A fire time in the past is not an error; the
    /// event simply fires immediately.
    pub fn enqueue(&self, fire_time: DateTime<Utc>, payload: EventPayload) -> Result<EventId> {
        let mut inner = self.lock();
        let event_id = EventId(inner.next_event_id);
        inner.next_event_id += 1;
        let event = ScheduledEvent {
            event_id,
            fire_time,
            status: EventStatus::Scheduled,
            payload,
        };
        inner.events.insert(event_id, event);
        inner.queue.insert((fire_time, event_id));
        persist::save_snapshot(&self.path, &inner.snapshot())?;
        drop(inner);
        self.notify.notify_one();
        debug!("enqueued event {} firing at {}", event_id, fire_time);
        Ok(event_id)
    }

    /// Idempotent. Returns false for events already fired, already
    /// cancelled, currently firing, or never known (treated as
    /// already-cancelled).
    pub fn cancel(&self, event_id: EventId) -> Result<bool> {
        let mut inner = self.lock();
        if inner.in_flight == Some(event_id) {
            return Ok(false);
        }
        let Some(event) = inner.events.get_mut(&event_id) else {
            return Ok(false);
        };
        if event.status != EventStatus::Scheduled {
            return Ok(false);
        }
        event.status = EventStatus::Cancelled;
        let fire_time = event.fire_time;
        inner.queue.remove(&(fire_time, event_id));
        persist::save_snapshot(&self.path, &inner.snapshot())?;
        drop(inner);
        self.notify.notify_one();
        debug!("cancelled event {}", event_id);
        Ok(true)
    }

    /// Fires due events in `(fire_time, event_id)` order, awaiting the
    /// handler for each before moving on. Suspends until the next deadline
    /// or until an enqueue/cancel changes the earliest one.
    pub async fn run<H, Fut>(&self, handler: H, mut shutdown: broadcast::Receiver<()>) -> Result<()>
    where
        H: Fn(ScheduledEvent) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            if let Some(event) = self.pop_due(Utc::now()) {
                let event_id = event.event_id;
                if let Err(e) = handler(event).await {
                    // Not an ActionError (the handler absorbs those); a bug
                    // escaping the handler. Mark fired anyway so one poisoned
                    // event cannot wedge the loop.
                    error!("deadline handler failed for event {}: {}", event_id, e);
                }
                self.finish_fired(event_id)?;
                continue;
            }
            match self.next_fire_time() {
                Some(next) => {
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops fired/cancelled events older than the horizon. Scheduled
    /// events are never touched.
    pub fn prune_resolved(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock();
        let before = inner.events.len();
        inner.events.retain(|_, event| {
            event.status == EventStatus::Scheduled || event.fire_time >= older_than
        });
        let removed = before - inner.events.len();
        if removed > 0 {
            persist::save_snapshot(&self.path, &inner.snapshot())?;
            info!("pruned {} resolved scheduler event(s)", removed);
        }
        Ok(removed)
    }

    pub fn event(&self, event_id: EventId) -> Option<ScheduledEvent> {
        self.lock().events.get(&event_id).copied()
    }

    /// Events with the given status, in `(fire_time, event_id)` order.
    pub fn events_with_status(&self, status: EventStatus) -> Vec<ScheduledEvent> {
        let inner = self.lock();
        let mut events: Vec<ScheduledEvent> = inner
            .events
            .values()
            .filter(|e| e.status == status)
            .copied()
            .collect();
        events.sort_by_key(|e| (e.fire_time, e.event_id));
        events
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerInner> {
        self.inner.lock().expect("scheduler state poisoned")
    }

    fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.lock().queue.iter().next().map(|&(fire_time, _)| fire_time)
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Option<ScheduledEvent> {
        let mut inner = self.lock();
        let &(fire_time, event_id) = inner.queue.iter().next()?;
        if fire_time > now {
            return None;
        }
        inner.queue.remove(&(fire_time, event_id));
        inner.in_flight = Some(event_id);
        inner.events.get(&event_id).copied()
    }

    fn finish_fired(&self, event_id: EventId) -> Result<()> {
        let mut inner = self.lock();
        inner.in_flight = None;
        if let Some(event) = inner.events.get_mut(&event_id) {
            event.status = EventStatus::Fired;
        }
        persist::save_snapshot(&self.path, &inner.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn payload(user: u64) -> EventPayload {
        EventPayload {
            case: UserChatKey {
                chat_id: crate::model::ChatId(-100),
                user_id: crate::model::UserId(user),
            },
            action: ActionKind::RemoveMember,
        }
    }

    struct RunningScheduler {
        fired: Arc<Mutex<Vec<EventId>>>,
        shutdown_tx: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    impl RunningScheduler {
        fn start(scheduler: Arc<Scheduler>) -> Self {
            let fired = Arc::new(Mutex::new(Vec::new()));
            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let task_scheduler = scheduler.clone();
            let task_fired = fired.clone();
            let handle = tokio::spawn(async move {
                let handler = move |event: ScheduledEvent| {
                    let fired = task_fired.clone();
                    async move {
                        fired.lock().unwrap().push(event.event_id);
                        Ok(())
                    }
                };
                task_scheduler.run(handler, shutdown_rx).await.unwrap();
            });
            RunningScheduler {
                fired,
                shutdown_tx,
                handle,
            }
        }

        fn fired(&self) -> Vec<EventId> {
            self.fired.lock().unwrap().clone()
        }

        async fn stop(self) {
            let _ = self.shutdown_tx.send(());
            let _ = self.handle.await;
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    #[tokio::test]
    async fn cancelled_event_never_fires() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(Scheduler::open(dir.path().join("queue.json")).unwrap());
        let fire_time = Utc::now() + chrono::Duration::milliseconds(150);
        let id = scheduler.enqueue(fire_time, payload(1)).unwrap();

        let running = RunningScheduler::start(scheduler.clone());
        assert!(scheduler.cancel(id).unwrap());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(running.fired().is_empty());
        assert_eq!(scheduler.event(id).unwrap().status, EventStatus::Cancelled);
        running.stop().await;
    }

    #[tokio::test]
    async fn fires_overdue_events_in_fire_time_then_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(Scheduler::open(dir.path().join("queue.json")).unwrap());
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        let t1 = Utc::now() - chrono::Duration::seconds(5);
        // Same fire time twice: ties break by ascending event id.
        let a = scheduler.enqueue(t1, payload(1)).unwrap();
        let b = scheduler.enqueue(t0, payload(2)).unwrap();
        let c = scheduler.enqueue(t0, payload(3)).unwrap();

        let running = RunningScheduler::start(scheduler.clone());
        settle().await;
        assert_eq!(running.fired(), vec![b, c, a]);
        assert_eq!(scheduler.event(a).unwrap().status, EventStatus::Fired);
        running.stop().await;
    }

    #[tokio::test]
    async fn enqueue_in_past_fires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(Scheduler::open(dir.path().join("queue.json")).unwrap());
        let running = RunningScheduler::start(scheduler.clone());
        settle().await;

        let id = scheduler
            .enqueue(Utc::now() - chrono::Duration::seconds(1), payload(1))
            .unwrap();
        settle().await;
        assert_eq!(running.fired(), vec![id]);
        running.stop().await;
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_tolerates_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Scheduler::open(dir.path().join("queue.json")).unwrap();
        let id = scheduler
            .enqueue(Utc::now() + chrono::Duration::seconds(60), payload(1))
            .unwrap();
        assert!(scheduler.cancel(id).unwrap());
        assert!(!scheduler.cancel(id).unwrap());
        assert!(!scheduler.cancel(EventId(9999)).unwrap());
    }

    #[tokio::test]
    async fn restart_recovers_pending_events_and_does_not_refire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let future_id;
        let past_id;
        {
            let scheduler = Arc::new(Scheduler::open(path.clone()).unwrap());
            past_id = scheduler
                .enqueue(Utc::now() - chrono::Duration::seconds(1), payload(1))
                .unwrap();
            future_id = scheduler
                .enqueue(Utc::now() + chrono::Duration::milliseconds(250), payload(2))
                .unwrap();
            let running = RunningScheduler::start(scheduler.clone());
            settle().await;
            // Only the overdue event fired before the "crash".
            assert_eq!(running.fired(), vec![past_id]);
            running.stop().await;
        }

        // Recovery rebuilds ordering from disk alone: the fired event stays
        // fired, the pending one fires at its original deadline.
        let scheduler = Arc::new(Scheduler::open(path).unwrap());
        assert_eq!(
            scheduler.event(past_id).unwrap().status,
            EventStatus::Fired
        );
        let running = RunningScheduler::start(scheduler.clone());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(running.fired(), vec![future_id]);
        running.stop().await;
    }

    #[tokio::test]
    async fn overdue_events_fire_before_new_deadlines_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let overdue;
        {
            let scheduler = Scheduler::open(path.clone()).unwrap();
            overdue = scheduler
                .enqueue(Utc::now() - chrono::Duration::seconds(30), payload(1))
                .unwrap();
        }
        let scheduler = Arc::new(Scheduler::open(path).unwrap());
        let soon = scheduler
            .enqueue(Utc::now() + chrono::Duration::milliseconds(50), payload(2))
            .unwrap();
        let running = RunningScheduler::start(scheduler.clone());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(running.fired(), vec![overdue, soon]);
        running.stop().await;
    }

    #[tokio::test]
    async fn event_ids_stay_monotonic_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let first = {
            let scheduler = Scheduler::open(path.clone()).unwrap();
            scheduler
                .enqueue(Utc::now() + chrono::Duration::seconds(60), payload(1))
                .unwrap()
        };
        let scheduler = Scheduler::open(path).unwrap();
        let second = scheduler
            .enqueue(Utc::now() + chrono::Duration::seconds(60), payload(2))
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn prune_drops_only_old_resolved_events() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(Scheduler::open(dir.path().join("queue.json")).unwrap());
        let old_fired = scheduler
            .enqueue(Utc::now() - chrono::Duration::days(30), payload(1))
            .unwrap();
        let cancelled = scheduler
            .enqueue(Utc::now() - chrono::Duration::days(30), payload(2))
            .unwrap();
        let pending = scheduler
            .enqueue(Utc::now() + chrono::Duration::days(30), payload(3))
            .unwrap();
        assert!(scheduler.cancel(cancelled).unwrap());

        let running = RunningScheduler::start(scheduler.clone());
        settle().await;
        assert_eq!(running.fired(), vec![old_fired]);
        running.stop().await;

        let removed = scheduler
            .prune_resolved(Utc::now() - chrono::Duration::days(14))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(scheduler.event(old_fired).is_none());
        assert!(scheduler.event(cancelled).is_none());
        assert_eq!(
            scheduler.event(pending).unwrap().status,
            EventStatus::Scheduled
        );
    }
}
