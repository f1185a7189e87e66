//! Timer service: holds due-dated work items in a min-heap and releases them
//! when their deadline passes.
//!
//! Two item kinds flow through here. TimerSchedule becomes a TimerFired on
//! the orchestrator queue; ActivityRetry becomes a fresh ActivityExecute on
//! the worker queue. The source timer-queue item is acked only after the
//! follow-up enqueue succeeds, so a crash between fire and ack redelivers.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;

use crate::providers::{HistoryStore, QueueKind, WorkItem};

/// A timer-queue item together with its peek-lock token.
#[derive(Debug)]
pub struct TimerWithToken {
    pub item: WorkItem,
    pub token: String,
}

pub struct TimerService;

impl TimerService {
    /// Spawn the service loop. The timer dispatcher feeds items through the
    /// returned sender; dropping it stops the loop.
    pub fn start(
        store: Arc<dyn HistoryStore>,
        idle_sleep_ms: u64,
    ) -> (JoinHandle<()>, UnboundedSender<TimerWithToken>) {
        let (tx, mut rx) = unbounded_channel::<TimerWithToken>();
        let handle = tokio::spawn(async move {
            // Keyed by (fire_at_ms, seq) so same-deadline timers fire in
            // arrival order.
            let mut heap: BinaryHeap<Reverse<(u64, u64)>> = BinaryHeap::new();
            let mut pending: std::collections::HashMap<u64, TimerWithToken> =
                std::collections::HashMap::new();
            let mut seq: u64 = 0;

            loop {
                // Drain newly arrived timers without blocking.
                loop {
                    match rx.try_recv() {
                        Ok(entry) => {
                            let fire_at = match &entry.item {
                                WorkItem::TimerSchedule { fire_at_ms, .. }
                                | WorkItem::ActivityRetry { fire_at_ms, .. } => *fire_at_ms,
                                other => {
                                    tracing::warn!(
                                        target: "duraflow::runtime",
                                        item = ?other,
                                        "non-timer item routed to timer service"
                                    );
                                    let _ = store.ack(QueueKind::Timer, &entry.token).await;
                                    continue;
                                }
                            };
                            heap.push(Reverse((fire_at, seq)));
                            pending.insert(seq, entry);
                            seq += 1;
                        }
                        Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
                        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => return,
                    }
                }

                let now = crate::wall_clock_ms();
                let mut fired = false;
                while let Some(Reverse((fire_at, id))) = heap.peek().copied() {
                    if fire_at > now {
                        break;
                    }
                    heap.pop();
                    let Some(entry) = pending.remove(&id) else { continue };
                    if Self::fire(store.as_ref(), &entry.item).await.is_ok() {
                        if let Err(e) = store.ack(QueueKind::Timer, &entry.token).await {
                            tracing::warn!(target: "duraflow::runtime", error = %e, "timer ack failed");
                        }
                    } else {
                        let _ = store.abandon(QueueKind::Timer, &entry.token).await;
                    }
                    fired = true;
                }

                if !fired {
                    tokio::time::sleep(std::time::Duration::from_millis(idle_sleep_ms)).await;
                }
            }
        });
        (handle, tx)
    }

    async fn fire(store: &dyn HistoryStore, item: &WorkItem) -> Result<(), String> {
        match item {
            WorkItem::TimerSchedule {
                instance,
                execution_id,
                id,
                fire_at_ms,
            } => {
                store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::TimerFired {
                            instance: instance.clone(),
                            execution_id: *execution_id,
                            id: *id,
                            fire_at_ms: *fire_at_ms,
                        },
                    )
                    .await
            }
            WorkItem::ActivityRetry {
                instance,
                execution_id,
                id,
                name,
                input,
                attempt,
                retry,
                ..
            } => {
                tracing::debug!(
                    target: "duraflow::runtime",
                    instance = %instance,
                    activity = %name,
                    attempt = *attempt,
                    "retry backoff elapsed, redispatching activity"
                );
                store
                    .enqueue_work(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.clone(),
                            execution_id: *execution_id,
                            id: *id,
                            name: name.clone(),
                            input: input.clone(),
                            attempt: *attempt,
                            retry: retry.clone(),
                        },
                    )
                    .await
            }
            other => Err(format!("timer service cannot fire {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InMemoryHistoryStore;

    fn schedule(instance: &str, id: u64, fire_at_ms: u64) -> WorkItem {
        WorkItem::TimerSchedule {
            instance: instance.into(),
            execution_id: 1,
            id,
            fire_at_ms,
        }
    }

    #[tokio::test]
    async fn fires_due_timers_in_deadline_order() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let (handle, tx) = TimerService::start(store.clone(), 5);

        let now = crate::wall_clock_ms();
        for (id, delay) in [(2u64, 40u64), (1, 10)] {
            let item = schedule("i1", id, now + delay);
            store.enqueue_work(QueueKind::Timer, item).await.unwrap();
            let (item, token) = store.dequeue_peek_lock(QueueKind::Timer).await.unwrap();
            tx.send(TimerWithToken { item, token }).unwrap();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut fired = Vec::new();
        while fired.len() < 2 && std::time::Instant::now() < deadline {
            if let Some((item, token)) = store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                if let WorkItem::TimerFired { id, .. } = item {
                    fired.push(id);
                }
                store.ack(QueueKind::Orchestrator, &token).await.unwrap();
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
        assert_eq!(fired, vec![1, 2]);

        drop(tx);
        handle.await.unwrap();
    }
}
