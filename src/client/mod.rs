//! Management surface: start instances, raise events, resolve approval
//! tokens, terminate, and query status. Everything goes through the store's
//! orchestrator queue; the client never touches history directly.

use std::sync::Arc;

use serde::Serialize;

use crate::providers::{CorrelationStore, HistoryStore, QueueKind, WorkItem};
use crate::runtime::status::{self, OrchestrationStatus, WaitError};
use crate::{codec, Event, INITIAL_EXECUTION_ID};

#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
    correlations: Arc<dyn CorrelationStore>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>, correlations: Arc<dyn CorrelationStore>) -> Self {
        Self { store, correlations }
    }

    /// Enqueue a new top-level instance. Starting an existing instance is a
    /// no-op on the runtime side.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input: input.into(),
                    execution_id: INITIAL_EXECUTION_ID,
                    parent_instance: None,
                    parent_id: None,
                },
            )
            .await
    }

    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), String> {
        self.start_orchestration(instance, orchestration, codec::encode(input)?).await
    }

    /// Deliver a named external event to a running instance. Unknown
    /// instances and closed subscriptions are dropped by the runtime.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: &str,
        data: impl Into<String>,
    ) -> Result<(), String> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name.to_string(),
                    data: data.into(),
                },
            )
            .await
    }

    /// Resolve a single-use approval token and forward the result to the
    /// instance that issued it. A second submission for the same token fails
    /// here, before anything reaches the instance.
    pub async fn submit_approval(&self, token: &str, result: impl Into<String>) -> Result<(), String> {
        let Some(instance) = self.correlations.resolve(token).await else {
            return Err(format!("unknown or already used approval token: {token}"));
        };
        self.raise_event(&instance, crate::pipeline::APPROVAL_EVENT, result).await
    }

    /// Force the instance to a Terminated state. In-flight activities are
    /// not interrupted; their completions are discarded.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), String> {
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await
    }

    pub async fn get_status(&self, instance: &str) -> OrchestrationStatus {
        status::status_from_history(&self.store.read(instance).await)
    }

    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout_ms: u64,
    ) -> Result<OrchestrationStatus, WaitError> {
        status::wait_for_orchestration(&self.store, instance, timeout_ms).await
    }

    pub async fn read_history(&self, instance: &str) -> Vec<Event> {
        self.store.read(instance).await
    }
}
