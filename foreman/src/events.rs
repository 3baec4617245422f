//! Engine event bus.
//!
//! Every observable state change is published as an [`EngineEvent`] to
//! subscribers matched by [`Topic`]. Delivery is asynchronous through
//! bounded per-subscriber queues: a slow subscriber loses its *own* oldest
//! events (counted, observable) and never blocks publication or other
//! subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::engine::job::JobId;
use crate::run::{RunId, RunState};
use crate::sink::StreamKind;

/// An observable engine state change.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    JobAdded {
        job_id: JobId,
    },
    JobRemoved {
        job_id: JobId,
    },
    /// A fire time was dropped by the skip concurrency policy.
    TickSkipped {
        job_id: JobId,
        fire_time: DateTime<Utc>,
    },
    RunCreated {
        job_id: JobId,
        run_id: RunId,
    },
    RunStarted {
        job_id: JobId,
        run_id: RunId,
    },
    /// A chunk of run output arrived.
    RunOutput {
        job_id: JobId,
        run_id: RunId,
        stream: StreamKind,
        chunk: Bytes,
    },
    RunFinished {
        job_id: JobId,
        run_id: RunId,
        state: RunState,
        exit_code: Option<i32>,
        error: Option<String>,
    },
}

impl EngineEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::JobAdded { job_id }
            | Self::JobRemoved { job_id }
            | Self::TickSkipped { job_id, .. }
            | Self::RunCreated { job_id, .. }
            | Self::RunStarted { job_id, .. }
            | Self::RunOutput { job_id, .. }
            | Self::RunFinished { job_id, .. } => job_id,
        }
    }

    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::RunStarted { run_id, .. }
            | Self::RunOutput { run_id, .. }
            | Self::RunFinished { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }

    /// Short type name for logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "job_added",
            Self::JobRemoved { .. } => "job_removed",
            Self::TickSkipped { .. } => "tick_skipped",
            Self::RunCreated { .. } => "run_created",
            Self::RunStarted { .. } => "run_started",
            Self::RunOutput { .. } => "run_output",
            Self::RunFinished { .. } => "run_finished",
        }
    }
}

/// What a subscriber receives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event in the engine.
    All,
    /// Events for one job (including its runs).
    Job(JobId),
    /// Events for one run.
    Run(RunId),
}

impl Topic {
    fn matches(&self, event: &EngineEvent) -> bool {
        match self {
            Self::All => true,
            Self::Job(job_id) => event.job_id() == job_id,
            Self::Run(run_id) => event.run_id() == Some(*run_id),
        }
    }
}

/// Identifier handed back by [`EventBus::subscribe`] for unsubscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct EventQueue {
    deque: Mutex<VecDeque<EngineEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    fn push(&self, event: EngineEvent) {
        let mut deque = self.deque.lock().expect("event queue lock poisoned");
        if deque.len() >= self.capacity {
            deque.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        deque.push_back(event);
        drop(deque);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct SubscriberSlot {
    topic: Topic,
    queue: Arc<EventQueue>,
}

/// Topic-filtered fan-out of engine events.
pub struct EventBus {
    subscribers: DashMap<SubscriberId, SubscriberSlot>,
    next_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Registers a subscriber for a topic.
    pub fn subscribe(&self, topic: Topic) -> EventSubscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(EventQueue::new(self.capacity));
        self.subscribers.insert(
            id,
            SubscriberSlot {
                topic,
                queue: Arc::clone(&queue),
            },
        );
        EventSubscription { id, queue }
    }

    /// Removes a subscriber; its queue drains and then ends.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if let Some((_, slot)) = self.subscribers.remove(&id) {
            slot.queue.close();
        }
    }

    /// Publishes an event to all matching subscribers. Never blocks.
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(
            event_type = event.event_type(),
            job_id = %event.job_id(),
            "publishing event"
        );
        for entry in self.subscribers.iter() {
            if entry.value().topic.matches(&event) {
                entry.value().queue.push(event.clone());
            }
        }
    }

    /// Closes every subscriber queue. Used at shutdown.
    pub fn close_all(&self) {
        for entry in self.subscribers.iter() {
            entry.value().queue.close();
        }
        self.subscribers.clear();
    }
}

/// A subscriber's receiving end.
pub struct EventSubscription {
    id: SubscriberId,
    queue: Arc<EventQueue>,
}

impl EventSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receives the next event, waiting if none is buffered. Returns
    /// `None` once unsubscribed (or the engine shut down) and the queue
    /// is drained.
    pub async fn recv(&self) -> Option<EngineEvent> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a publication
            // landing between the check and the await is not lost.
            notified.as_mut().enable();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return self.try_recv();
            }
            notified.await;
        }
    }

    /// Pops a buffered event without waiting.
    pub fn try_recv(&self) -> Option<EngineEvent> {
        self.queue
            .deque
            .lock()
            .expect("event queue lock poisoned")
            .pop_front()
    }

    /// Number of events this subscriber lost to backlog overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_created(job: &str, run: u64) -> EngineEvent {
        EngineEvent::RunCreated {
            job_id: JobId::from(job),
            run_id: RunId(run),
        }
    }

    #[tokio::test]
    async fn test_topic_filtering() {
        let bus = EventBus::new(16);
        let all = bus.subscribe(Topic::All);
        let job_a = bus.subscribe(Topic::Job(JobId::from("a")));
        let run_2 = bus.subscribe(Topic::Run(RunId(2)));

        bus.publish(run_created("a", 1));
        bus.publish(run_created("b", 2));

        assert_eq!(all.try_recv().unwrap().run_id(), Some(RunId(1)));
        assert_eq!(all.try_recv().unwrap().run_id(), Some(RunId(2)));

        assert_eq!(job_a.try_recv().unwrap().run_id(), Some(RunId(1)));
        assert!(job_a.try_recv().is_none());

        assert_eq!(run_2.try_recv().unwrap().run_id(), Some(RunId(2)));
        assert!(run_2.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_only_for_itself() {
        let bus = EventBus::new(2);
        let slow = bus.subscribe(Topic::All);
        let other = bus.subscribe(Topic::All);

        // Drain `other` as we go so only `slow` overflows.
        for i in 0..4 {
            bus.publish(run_created("a", i));
            other.try_recv();
        }

        assert_eq!(slow.dropped(), 2);
        assert_eq!(slow.try_recv().unwrap().run_id(), Some(RunId(2)));
        assert_eq!(slow.try_recv().unwrap().run_id(), Some(RunId(3)));
        assert_eq!(other.dropped(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream_after_drain() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe(Topic::All);
        bus.publish(run_created("a", 1));
        bus.unsubscribe(sub.id());

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());

        // Publications after unsubscription are not delivered.
        bus.publish(run_created("a", 2));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_waits_for_publication() {
        let bus = Arc::new(EventBus::new(16));
        let sub = bus.subscribe(Topic::All);

        let publisher = Arc::clone(&bus);
        let task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            publisher.publish(run_created("a", 7));
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(event.run_id(), Some(RunId(7)));
        task.await.unwrap();
    }
}
