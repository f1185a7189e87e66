//! In-process provider used by tests and samples. Same visibility semantics
//! as the durable providers: peek-locked items disappear from the queue and
//! return on abandon.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::providers::{completion_key, dedup_on_enqueue, CorrelationStore, HistoryStore, QueueKind, WorkItem};
use crate::Event;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<WorkItem>,
    locked: HashMap<String, WorkItem>,
}

#[derive(Default)]
struct StoreState {
    // instance -> (latest execution id, its history)
    histories: HashMap<String, (u64, Vec<Event>)>,
    orchestrator: QueueState,
    worker: QueueState,
    timer: QueueState,
}

impl StoreState {
    fn queue(&mut self, kind: QueueKind) -> &mut QueueState {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator,
            QueueKind::Worker => &mut self.worker,
            QueueKind::Timer => &mut self.timer,
        }
    }
}

pub struct InMemoryHistoryStore {
    state: Mutex<StoreState>,
    token_counter: AtomicU64,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            token_counter: AtomicU64::new(1),
        }
    }
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self) -> String {
        format!("mem-{}", self.token_counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.state
            .lock()
            .await
            .histories
            .get(instance)
            .map(|(_, h)| h.clone())
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, events: Vec<Event>) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let (_, history) = state
            .histories
            .entry(instance.to_string())
            .or_insert_with(|| (crate::INITIAL_EXECUTION_ID, Vec::new()));
        let seen: HashSet<_> = history.iter().filter_map(completion_key).collect();
        for e in events {
            if completion_key(&e).is_some_and(|k| seen.contains(&k)) {
                continue;
            }
            history.push(e);
        }
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        self.state
            .lock()
            .await
            .histories
            .entry(instance.to_string())
            .or_insert_with(|| (crate::INITIAL_EXECUTION_ID, Vec::new()));
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        self.state.lock().await.histories.get(instance).map(|(id, _)| *id)
    }

    async fn reset_execution(
        &self,
        instance: &str,
        new_execution_id: u64,
        seed: Vec<Event>,
    ) -> Result<(), String> {
        self.state
            .lock()
            .await
            .histories
            .insert(instance.to_string(), (new_execution_id, seed));
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.histories.keys().cloned().collect();
        names.sort();
        names
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let q = state.queue(kind);
        // Redelivered dispatches are common in the crash window; an item
        // already visible or locked is not enqueued twice.
        if dedup_on_enqueue(&item)
            && (q.ready.contains(&item) || q.locked.values().any(|v| *v == item))
        {
            return Ok(());
        }
        q.ready.push_back(item);
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let token = self.next_token();
        let mut state = self.state.lock().await;
        let q = state.queue(kind);
        let item = q.ready.pop_front()?;
        q.locked.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        state
            .queue(kind)
            .locked
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| format!("ack: unknown token {token}"))
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut state = self.state.lock().await;
        let q = state.queue(kind);
        let item = q
            .locked
            .remove(token)
            .ok_or_else(|| format!("abandon: unknown token {token}"))?;
        q.ready.push_front(item);
        Ok(())
    }

    async fn reset(&self) {
        *self.state.lock().await = StoreState::default();
    }
}

#[derive(Default)]
pub struct InMemoryCorrelationStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl InMemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn register(&self, token: &str, instance: &str) -> Result<(), String> {
        let mut tokens = self.tokens.lock().await;
        match tokens.get(token) {
            Some(owner) if owner.as_str() == instance => Ok(()),
            Some(_) => Err(format!("correlation token already registered: {token}")),
            None => {
                tokens.insert(token.to_string(), instance.to_string());
                Ok(())
            }
        }
    }

    async fn resolve(&self, token: &str) -> Option<String> {
        self.tokens.lock().await.remove(token)
    }
}
