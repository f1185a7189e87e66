#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use duraflow::client::Client;
use duraflow::providers::{CorrelationStore, HistoryStore, InMemoryCorrelationStore, InMemoryHistoryStore};
use duraflow::runtime::{ActivityRegistry, OrchestrationRegistry, Runtime};
use duraflow::{codec, Event};

pub struct TestHost {
    pub runtime: Arc<Runtime>,
    pub client: Client,
    pub store: Arc<dyn HistoryStore>,
    pub correlations: Arc<dyn CorrelationStore>,
}

pub fn stores() -> (Arc<dyn HistoryStore>, Arc<dyn CorrelationStore>) {
    (
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(InMemoryCorrelationStore::new()),
    )
}

pub async fn start_host(
    store: Arc<dyn HistoryStore>,
    correlations: Arc<dyn CorrelationStore>,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
) -> TestHost {
    let runtime = Runtime::start_with_store(store.clone(), orchestrations, activities).await;
    let client = Client::new(store.clone(), correlations.clone());
    TestHost {
        runtime,
        client,
        store,
        correlations,
    }
}

pub async fn start_in_memory(orchestrations: OrchestrationRegistry, activities: ActivityRegistry) -> TestHost {
    let (store, correlations) = stores();
    start_host(store, correlations, orchestrations, activities).await
}

/// Poll the instance history until `pred` holds, panicking on timeout with
/// the last history snapshot for diagnosis.
pub async fn wait_for_history(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    timeout_ms: u64,
    pred: impl Fn(&[Event]) -> bool,
) -> Vec<Event> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let history = store.read(instance).await;
        if pred(&history) {
            return history;
        }
        if Instant::now() >= deadline {
            panic!("condition not reached for {instance} within {timeout_ms}ms; history: {history:#?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Extract the approval token from the scheduled SendApprovalRequestEmail
/// input once the pipeline reaches the approval gate. Waits for the matching
/// ActivityCompleted, since the token only enters the correlation store when
/// the activity handler runs.
pub async fn approval_token(store: &Arc<dyn HistoryStore>, instance: &str, timeout_ms: u64) -> String {
    let approval_completed = |h: &[Event]| {
        h.iter().any(|e| {
            let Event::ActivityScheduled { event_id, name, .. } = e else {
                return false;
            };
            name == duraflow::pipeline::SEND_APPROVAL_REQUEST
                && h.iter().any(|c| {
                    matches!(c, Event::ActivityCompleted { source_event_id, .. } if source_event_id == event_id)
                })
        })
    };
    let history = wait_for_history(store, instance, timeout_ms, approval_completed).await;
    let input = history
        .iter()
        .find_map(|e| match e {
            Event::ActivityScheduled { name, input, .. }
                if name == duraflow::pipeline::SEND_APPROVAL_REQUEST =>
            {
                Some(input.clone())
            }
            _ => None,
        })
        .expect("approval request scheduled");
    let request: duraflow::pipeline::ApprovalRequest = codec::decode(&input).expect("approval request input");
    request.token
}
