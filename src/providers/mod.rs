//! Storage and queue abstractions.
//!
//! A provider owns two things for the runtime: per-instance append-only
//! histories (one log per execution) and the three peek-lock work queues the
//! dispatchers drain. Delivery is at-least-once; `append` deduplicates
//! completion events so redelivered work converges to the same history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Event;

pub mod fs;
pub mod in_memory;

pub use fs::{FsCorrelationStore, FsHistoryStore};
pub use in_memory::{InMemoryCorrelationStore, InMemoryHistoryStore};

/// The three dispatch lanes. Orchestrator items drive replay turns, worker
/// items run activities, timer items wait for a deadline before being
/// re-enqueued elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// A unit of work in transit between dispatchers. Serialized verbatim into
/// the queues, so every variant carries full routing context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        execution_id: u64,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
        execution_id: u64,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
        retry: crate::RetryPolicy,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
        attempt: u32,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        error: String,
        attempt: u32,
        retry: crate::RetryPolicy,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    /// A backoff delay for a failed activity attempt. Sits in the timer
    /// queue until due, then re-enters the worker queue as ActivityExecute.
    ActivityRetry {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
        retry: crate::RetryPolicy,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    SubOrchFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Instance the item routes to (the parent, for sub-orchestration
    /// completions).
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ActivityRetry { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::SubOrchCompleted { instance, .. }
            | WorkItem::SubOrchFailed { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }
}

/// Durable history plus peek-lock queues. Implementations must keep `append`
/// idempotent for completion events and must re-deliver locked items that
/// were never acked (crash recovery).
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full history of the latest execution, empty when unknown.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Append events to the latest execution. Completion events already
    /// present (same source and kind) are dropped, not duplicated.
    async fn append(&self, instance: &str, events: Vec<Event>) -> Result<(), String>;

    /// Ensure the instance exists with an empty first execution.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    /// Replace the instance's history with a fresh execution seeded with
    /// `seed`. Prior execution logs are discarded, which keeps storage flat
    /// across continue-as-new.
    async fn reset_execution(
        &self,
        instance: &str,
        new_execution_id: u64,
        seed: Vec<Event>,
    ) -> Result<(), String>;

    async fn list_instances(&self) -> Vec<String>;

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;

    /// Take the next item under a lock token. The item stays invisible until
    /// acked or abandoned; a crashed holder's items come back on restart.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    /// Testing hook: drop all state.
    async fn reset(&self);

    /// Human-readable dump of all histories, for debugging and tests.
    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for instance in self.list_instances().await {
            out.push_str(&format!("== {instance} ==\n"));
            for e in self.read(&instance).await {
                out.push_str(&format!("  {e:?}\n"));
            }
        }
        out
    }
}

/// Durable record mapping a single-use token to the instance that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub token: String,
    pub instance: String,
    pub created_at_ms: u64,
}

/// Single-use token registry for out-of-band callbacks (approvals). Resolve
/// consumes: a token answers exactly once, a second resolve misses.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Register a token for the instance. Activity attempts are redelivered
    /// at least once, so re-registering the same token for the same instance
    /// succeeds; a token held by a different instance fails.
    async fn register(&self, token: &str, instance: &str) -> Result<(), String>;

    /// Look up and consume the token, returning the owning instance.
    async fn resolve(&self, token: &str) -> Option<String>;
}

/// Whether enqueue should drop an identical item already in the queue.
/// Runtime-dispatched items are redelivered verbatim in the crash window
/// between dispatch and history append; client raises are never
/// redispatched, and two identical raises are two distinct events.
pub(crate) fn dedup_on_enqueue(item: &WorkItem) -> bool {
    !matches!(item, WorkItem::ExternalRaised { .. })
}

/// True when a history entry is a completion that should be deduplicated on
/// redelivery. Keyed by source event id plus kind tag.
pub(crate) fn completion_key(event: &Event) -> Option<(u64, &'static str)> {
    match event {
        Event::ActivityCompleted { source_event_id, .. } => Some((*source_event_id, "activity-ok")),
        Event::ActivityFailed { source_event_id, .. } => Some((*source_event_id, "activity-err")),
        Event::TimerFired { source_event_id, .. } => Some((*source_event_id, "timer")),
        Event::ExternalEvent { source_event_id, .. } => Some((*source_event_id, "external")),
        Event::SubOrchestrationCompleted { source_event_id, .. } => Some((*source_event_id, "suborch-ok")),
        Event::SubOrchestrationFailed { source_event_id, .. } => Some((*source_event_id, "suborch-err")),
        _ => None,
    }
}
