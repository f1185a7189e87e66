//! Host runtime: three dispatcher loops over the provider queues.
//!
//! The orchestration dispatcher replays instances one work item at a time,
//! the worker dispatcher runs activities concurrently, and the timer
//! dispatcher feeds due-dated items through the timer service. History is
//! the only authority; dispatch happens before the matching history append,
//! so a crash between the two redelivers work and `append` deduplication
//! converges the outcome.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{next_event_id, run_turn, Action, Event, INITIAL_EXECUTION_ID};

pub mod registry;
pub mod status;
pub mod timers;

pub use registry::{ActivityContext, ActivityRegistry, OrchestrationRegistry};
pub use status::{status_from_history, OrchestrationStatus, WaitError};

use timers::{TimerService, TimerWithToken};

/// Called when an instance reaches Failed, with (instance, error). Lets a
/// host hang compensation off failures without polling.
pub type FailureHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

pub struct RuntimeOptions {
    pub dispatcher_idle_sleep_ms: u64,
    pub failure_hook: Option<FailureHook>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            failure_hook: None,
        }
    }
}

pub struct Runtime {
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
    joins: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        orchestrations: OrchestrationRegistry,
        activities: ActivityRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, orchestrations, activities, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        orchestrations: OrchestrationRegistry,
        activities: ActivityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let rt = Arc::new(Self {
            store,
            orchestrations,
            options,
            joins: std::sync::Mutex::new(Vec::new()),
        });

        let orch = Arc::clone(&rt);
        let orch_join = tokio::spawn(async move { orch.orchestration_dispatcher().await });
        let work = Arc::clone(&rt);
        let work_join = tokio::spawn(async move { work.worker_dispatcher(activities).await });
        let timer = Arc::clone(&rt);
        let timer_join = tokio::spawn(async move { timer.timer_dispatcher().await });
        rt.joins
            .lock()
            .expect("joins lock")
            .extend([orch_join, work_join, timer_join]);
        rt
    }

    /// Stop all dispatcher loops. In-flight peek-locked items come back on
    /// the next start.
    pub async fn shutdown(&self) {
        for join in self.joins.lock().expect("joins lock").drain(..) {
            join.abort();
        }
    }

    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        status_from_history(&self.store.read(instance).await)
    }

    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout_ms: u64,
    ) -> Result<OrchestrationStatus, WaitError> {
        status::wait_for_orchestration(&self.store, instance, timeout_ms).await
    }

    // One item at a time: the sequential loop is what guarantees at most
    // one replay turn per instance is in flight.
    async fn orchestration_dispatcher(self: Arc<Self>) {
        loop {
            match self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                Some((item, token)) => {
                    self.process_orchestrator_item(item).await;
                    if let Err(e) = self.store.ack(QueueKind::Orchestrator, &token).await {
                        tracing::warn!(target: "duraflow::runtime", error = %e, "orchestrator ack failed");
                    }
                }
                None => {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await
                }
            }
        }
    }

    async fn worker_dispatcher(self: Arc<Self>, activities: ActivityRegistry) {
        loop {
            match self.store.dequeue_peek_lock(QueueKind::Worker).await {
                Some((item, token)) => {
                    let rt = Arc::clone(&self);
                    let activities = activities.clone();
                    tokio::spawn(async move { rt.run_activity(activities, item, token).await });
                }
                None => {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await
                }
            }
        }
    }

    async fn timer_dispatcher(self: Arc<Self>) {
        let (service, tx) = TimerService::start(Arc::clone(&self.store), self.options.dispatcher_idle_sleep_ms);
        loop {
            match self.store.dequeue_peek_lock(QueueKind::Timer).await {
                Some((item, token)) => {
                    if tx.send(TimerWithToken { item, token }).is_err() {
                        break;
                    }
                }
                None => {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.options.dispatcher_idle_sleep_ms,
                    ))
                    .await
                }
            }
        }
        service.abort();
    }

    async fn run_activity(&self, activities: ActivityRegistry, item: WorkItem, token: String) {
        let WorkItem::ActivityExecute {
            instance,
            execution_id,
            id,
            name,
            input,
            attempt,
            retry,
        } = item
        else {
            tracing::warn!(target: "duraflow::runtime", item = ?item, "non-activity item on worker queue");
            let _ = self.store.ack(QueueKind::Worker, &token).await;
            return;
        };

        let outcome = match activities.resolve(&name) {
            Some(handler) => {
                let ctx = ActivityContext {
                    instance: instance.clone(),
                    execution_id,
                    attempt,
                };
                handler.invoke(ctx, input.clone()).await
            }
            None => Err(format!("{}unregistered activity: {name}", crate::retry::FATAL_ERROR_PREFIX)),
        };

        let completion = match outcome {
            Ok(result) => WorkItem::ActivityCompleted {
                instance,
                execution_id,
                id,
                result,
                attempt,
            },
            Err(error) => WorkItem::ActivityFailed {
                instance,
                execution_id,
                id,
                name,
                input,
                error,
                attempt,
                retry,
            },
        };

        // Ack only after the completion is safely enqueued; otherwise the
        // attempt is redelivered and runs again.
        match self.store.enqueue_work(QueueKind::Orchestrator, completion).await {
            Ok(()) => {
                if let Err(e) = self.store.ack(QueueKind::Worker, &token).await {
                    tracing::warn!(target: "duraflow::runtime", error = %e, "worker ack failed");
                }
            }
            Err(e) => {
                tracing::warn!(target: "duraflow::runtime", error = %e, "enqueue completion failed, abandoning");
                let _ = self.store.abandon(QueueKind::Worker, &token).await;
            }
        }
    }

    async fn process_orchestrator_item(&self, item: WorkItem) {
        match item {
            WorkItem::StartOrchestration {
                instance,
                orchestration,
                input,
                parent_instance,
                parent_id,
                ..
            } => {
                if !self.store.read(&instance).await.is_empty() {
                    tracing::warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        "duplicate start ignored"
                    );
                    return;
                }
                if let Err(e) = self.store.create_instance(&instance).await {
                    tracing::error!(target: "duraflow::runtime", instance = %instance, error = %e, "create instance failed");
                    return;
                }
                let pending = vec![Event::OrchestrationStarted {
                    event_id: 1,
                    name: orchestration,
                    input,
                    parent_instance,
                    parent_id,
                }];
                self.run_instance_turn(&instance, Vec::new(), pending).await;
            }
            WorkItem::ContinueAsNew {
                instance,
                orchestration,
                input,
                parent_instance,
                parent_id,
                ..
            } => {
                if !self.store.read(&instance).await.is_empty() {
                    tracing::warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        "stale continue-as-new ignored"
                    );
                    return;
                }
                let pending = vec![
                    Event::OrchestrationContinuedAsNew {
                        event_id: 1,
                        input: input.clone(),
                    },
                    Event::OrchestrationStarted {
                        event_id: 2,
                        name: orchestration,
                        input,
                        parent_instance,
                        parent_id,
                    },
                ];
                self.run_instance_turn(&instance, Vec::new(), pending).await;
            }
            WorkItem::ActivityCompleted {
                instance,
                execution_id,
                id,
                result,
                attempt,
            } => {
                let Some(history) = self
                    .validated_history(&instance, execution_id, id, |e| {
                        matches!(e, Event::ActivityScheduled { event_id, .. } if *event_id == id)
                    })
                    .await
                else {
                    return;
                };
                let event = Event::ActivityCompleted {
                    event_id: next_event_id(&history),
                    source_event_id: id,
                    result,
                    attempt,
                };
                self.run_instance_turn(&instance, history, vec![event]).await;
            }
            WorkItem::ActivityFailed {
                instance,
                execution_id,
                id,
                name,
                input,
                error,
                attempt,
                retry,
            } => {
                let Some(history) = self
                    .validated_history(&instance, execution_id, id, |e| {
                        matches!(e, Event::ActivityScheduled { event_id, .. } if *event_id == id)
                    })
                    .await
                else {
                    return;
                };
                if retry.should_retry(attempt, &error) {
                    // Transient: schedule the next attempt behind a backoff
                    // timer and leave history untouched.
                    let delay = retry.base_delay_ms.saturating_mul(1 << (attempt - 1).min(16));
                    tracing::warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        activity = %name,
                        attempt,
                        error = %error,
                        delay_ms = delay,
                        "activity attempt failed, retrying"
                    );
                    let item = WorkItem::ActivityRetry {
                        instance,
                        execution_id,
                        id,
                        name,
                        input,
                        attempt: attempt + 1,
                        retry,
                        fire_at_ms: crate::wall_clock_ms() + delay,
                    };
                    if let Err(e) = self.store.enqueue_work(QueueKind::Timer, item).await {
                        tracing::error!(target: "duraflow::runtime", error = %e, "enqueue retry failed");
                    }
                    return;
                }
                let event = Event::ActivityFailed {
                    event_id: next_event_id(&history),
                    source_event_id: id,
                    error,
                    attempt,
                };
                self.run_instance_turn(&instance, history, vec![event]).await;
            }
            WorkItem::TimerFired {
                instance,
                execution_id,
                id,
                fire_at_ms,
            } => {
                let Some(history) = self
                    .validated_history(&instance, execution_id, id, |e| {
                        matches!(e, Event::TimerCreated { event_id, .. } if *event_id == id)
                    })
                    .await
                else {
                    return;
                };
                let event = Event::TimerFired {
                    event_id: next_event_id(&history),
                    source_event_id: id,
                    fire_at_ms,
                };
                self.run_instance_turn(&instance, history, vec![event]).await;
            }
            WorkItem::SubOrchCompleted {
                instance,
                execution_id,
                id,
                result,
            } => {
                let Some(history) = self
                    .validated_history(&instance, execution_id, id, |e| {
                        matches!(e, Event::SubOrchestrationScheduled { event_id, .. } if *event_id == id)
                    })
                    .await
                else {
                    return;
                };
                let event = Event::SubOrchestrationCompleted {
                    event_id: next_event_id(&history),
                    source_event_id: id,
                    result,
                };
                self.run_instance_turn(&instance, history, vec![event]).await;
            }
            WorkItem::SubOrchFailed {
                instance,
                execution_id,
                id,
                error,
            } => {
                let Some(history) = self
                    .validated_history(&instance, execution_id, id, |e| {
                        matches!(e, Event::SubOrchestrationScheduled { event_id, .. } if *event_id == id)
                    })
                    .await
                else {
                    return;
                };
                let event = Event::SubOrchestrationFailed {
                    event_id: next_event_id(&history),
                    source_event_id: id,
                    error,
                };
                self.run_instance_turn(&instance, history, vec![event]).await;
            }
            WorkItem::ExternalRaised { instance, name, data } => {
                let history = self.store.read(&instance).await;
                if history.is_empty() || status_from_history(&history).is_terminal() {
                    tracing::warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        event = %name,
                        "external event dropped: instance not running"
                    );
                    return;
                }
                // Match the first subscription for this name that has no
                // delivered event yet; with none open, the raise is a no-op.
                let delivered: std::collections::HashSet<u64> = history
                    .iter()
                    .filter_map(|e| match e {
                        Event::ExternalEvent { source_event_id, .. } => Some(*source_event_id),
                        _ => None,
                    })
                    .collect();
                let source = history.iter().find_map(|e| match e {
                    Event::ExternalSubscribed { event_id, name: n } if *n == name && !delivered.contains(event_id) => {
                        Some(*event_id)
                    }
                    _ => None,
                });
                let Some(source_event_id) = source else {
                    tracing::warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        event = %name,
                        "external event dropped: no open subscription"
                    );
                    return;
                };
                let event = Event::ExternalEvent {
                    event_id: next_event_id(&history),
                    source_event_id,
                    name,
                    data,
                };
                self.run_instance_turn(&instance, history, vec![event]).await;
            }
            WorkItem::TerminateInstance { instance, reason } => {
                let history = self.store.read(&instance).await;
                if history.is_empty() || status_from_history(&history).is_terminal() {
                    tracing::warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        "terminate ignored: instance not running"
                    );
                    return;
                }
                let event = Event::OrchestrationTerminated {
                    event_id: next_event_id(&history),
                    reason: reason.clone(),
                };
                self.append_with_retry(&instance, vec![event]).await;
                // In-flight activities keep running; their completions are
                // dropped at the terminal-state validation above.
                self.notify_parent(&history, Err(format!("terminated: {reason}"))).await;
            }
            other => {
                tracing::warn!(target: "duraflow::runtime", item = ?other, "unexpected item on orchestrator queue");
            }
        }
    }

    /// Shared completion validation: instance running, execution current,
    /// scheduling entry present, completion not yet recorded. Returns the
    /// history to replay against, or None when the item should be dropped.
    async fn validated_history(
        &self,
        instance: &str,
        execution_id: u64,
        source_id: u64,
        is_scheduling: impl Fn(&Event) -> bool,
    ) -> Option<Vec<Event>> {
        let history = self.store.read(instance).await;
        if history.is_empty() {
            tracing::warn!(target: "duraflow::runtime", instance = %instance, "completion for unknown instance dropped");
            return None;
        }
        if status_from_history(&history).is_terminal() {
            tracing::debug!(target: "duraflow::runtime", instance = %instance, "completion after terminal state dropped");
            return None;
        }
        let latest = self.store.latest_execution_id(instance).await.unwrap_or(INITIAL_EXECUTION_ID);
        if latest != execution_id {
            tracing::warn!(
                target: "duraflow::runtime",
                instance = %instance,
                completion_execution = execution_id,
                latest_execution = latest,
                "completion from superseded execution dropped"
            );
            return None;
        }
        if !history.iter().any(&is_scheduling) {
            tracing::warn!(
                target: "duraflow::runtime",
                instance = %instance,
                source_id,
                "completion without matching scheduling event dropped"
            );
            return None;
        }
        let already = history.iter().any(|e| {
            crate::providers::completion_key(e).is_some_and(|(sid, _)| sid == source_id)
        });
        if already {
            tracing::debug!(
                target: "duraflow::runtime",
                instance = %instance,
                source_id,
                "duplicate completion dropped"
            );
            return None;
        }
        Some(history)
    }

    async fn run_instance_turn(&self, instance: &str, base: Vec<Event>, pending: Vec<Event>) {
        let execution_id = self
            .store
            .latest_execution_id(instance)
            .await
            .unwrap_or(INITIAL_EXECUTION_ID);

        let descriptor = pending.iter().chain(base.iter()).find_map(|e| match e {
            Event::OrchestrationStarted {
                name,
                input,
                parent_instance,
                parent_id,
                ..
            } => Some((name.clone(), input.clone(), parent_instance.clone(), parent_id.clone())),
            _ => None,
        });
        let Some((name, input, parent_instance, parent_id)) = descriptor else {
            tracing::error!(target: "duraflow::runtime", instance = %instance, "no start record in history");
            return;
        };

        let base_len = base.len();
        let mut full = base;
        full.extend(pending.iter().cloned());

        let Some(handler) = self.orchestrations.resolve(&name) else {
            let error = format!("unregistered orchestration: {name}");
            let mut delta = pending;
            delta.push(Event::OrchestrationFailed {
                event_id: next_event_id(&full),
                error: error.clone(),
            });
            self.append_with_retry(instance, delta).await;
            self.notify_parent_link(&parent_instance, parent_id, Err(error.clone())).await;
            self.invoke_failure_hook(instance, &error);
            return;
        };

        let outcome = run_turn(instance, execution_id, full, move |ctx| async move {
            handler.invoke(ctx, input).await
        });

        let mut delta: Vec<Event> = outcome.history[base_len..].to_vec();

        let continue_input = outcome.actions.iter().find_map(|a| match a {
            Action::ContinueAsNew { input } => Some(input.clone()),
            _ => None,
        });
        if let Some(input) = continue_input {
            let next_execution = execution_id + 1;
            if let Err(e) = self.store.reset_execution(instance, next_execution, Vec::new()).await {
                tracing::error!(target: "duraflow::runtime", instance = %instance, error = %e, "reset execution failed");
                return;
            }
            let item = WorkItem::ContinueAsNew {
                instance: instance.to_string(),
                orchestration: name,
                input,
                execution_id: next_execution,
                parent_instance,
                parent_id,
            };
            if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, item).await {
                tracing::error!(target: "duraflow::runtime", instance = %instance, error = %e, "enqueue continue-as-new failed");
            }
            return;
        }

        if let Some(nd) = outcome.nondeterminism {
            tracing::error!(target: "duraflow::runtime", instance = %instance, "{nd}");
            let error = format!("nondeterministic execution: {nd}");
            delta.push(Event::OrchestrationFailed {
                event_id: next_event_id(&outcome.history),
                error: error.clone(),
            });
            self.append_with_retry(instance, delta).await;
            self.notify_parent_link(&parent_instance, parent_id, Err(error.clone())).await;
            self.invoke_failure_hook(instance, &error);
            return;
        }

        // Dispatch before append: redelivery after a crash in this window
        // is absorbed by enqueue/append idempotence.
        for action in &outcome.actions {
            self.dispatch_action(instance, execution_id, action).await;
        }

        let terminal = match &outcome.output {
            Some(Ok(output)) => {
                delta.push(Event::OrchestrationCompleted {
                    event_id: next_event_id(&outcome.history),
                    output: output.clone(),
                });
                Some(Ok(output.clone()))
            }
            Some(Err(error)) => {
                delta.push(Event::OrchestrationFailed {
                    event_id: next_event_id(&outcome.history),
                    error: error.clone(),
                });
                Some(Err(error.clone()))
            }
            None => None,
        };

        self.append_with_retry(instance, delta).await;

        if let Some(result) = terminal {
            if let Err(error) = &result {
                self.invoke_failure_hook(instance, error);
            }
            self.notify_parent_link(&parent_instance, parent_id, result).await;
        }
    }

    async fn dispatch_action(&self, instance: &str, execution_id: u64, action: &Action) {
        let result = match action {
            Action::CallActivity {
                scheduling_event_id,
                name,
                input,
                retry,
            } => {
                self.store
                    .enqueue_work(
                        QueueKind::Worker,
                        WorkItem::ActivityExecute {
                            instance: instance.to_string(),
                            execution_id,
                            id: *scheduling_event_id,
                            name: name.clone(),
                            input: input.clone(),
                            attempt: 1,
                            retry: retry.clone(),
                        },
                    )
                    .await
            }
            Action::CreateTimer {
                scheduling_event_id,
                fire_at_ms,
            } => {
                self.store
                    .enqueue_work(
                        QueueKind::Timer,
                        WorkItem::TimerSchedule {
                            instance: instance.to_string(),
                            execution_id,
                            id: *scheduling_event_id,
                            fire_at_ms: *fire_at_ms,
                        },
                    )
                    .await
            }
            // Subscriptions live entirely in history; raises find them there.
            Action::WaitExternal { .. } => Ok(()),
            Action::StartSubOrchestration {
                scheduling_event_id,
                name,
                instance: child,
                input,
            } => {
                self.store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::StartOrchestration {
                            instance: child.clone(),
                            orchestration: name.clone(),
                            input: input.clone(),
                            execution_id: INITIAL_EXECUTION_ID,
                            parent_instance: Some(instance.to_string()),
                            parent_id: Some(*scheduling_event_id),
                        },
                    )
                    .await
            }
            Action::ContinueAsNew { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(target: "duraflow::runtime", instance = %instance, error = %e, "dispatch failed");
        }
    }

    /// Deliver a terminal result to the parent named in the child's start
    /// record.
    async fn notify_parent(&self, child_history: &[Event], result: Result<String, String>) {
        let link = child_history.iter().find_map(|e| match e {
            Event::OrchestrationStarted {
                parent_instance,
                parent_id,
                ..
            } => Some((parent_instance.clone(), *parent_id)),
            _ => None,
        });
        if let Some((parent_instance, parent_id)) = link {
            self.notify_parent_link(&parent_instance, parent_id, result).await;
        }
    }

    async fn notify_parent_link(
        &self,
        parent_instance: &Option<String>,
        parent_id: Option<u64>,
        result: Result<String, String>,
    ) {
        let (Some(parent), Some(id)) = (parent_instance, parent_id) else {
            return;
        };
        let execution_id = self
            .store
            .latest_execution_id(parent)
            .await
            .unwrap_or(INITIAL_EXECUTION_ID);
        let item = match result {
            Ok(result) => WorkItem::SubOrchCompleted {
                instance: parent.clone(),
                execution_id,
                id,
                result,
            },
            Err(error) => WorkItem::SubOrchFailed {
                instance: parent.clone(),
                execution_id,
                id,
                error,
            },
        };
        if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, item).await {
            tracing::error!(target: "duraflow::runtime", parent = %parent, error = %e, "parent notification failed");
        }
    }

    fn invoke_failure_hook(&self, instance: &str, error: &str) {
        if let Some(hook) = &self.options.failure_hook {
            hook(instance, error);
        }
    }

    // Appends must not be lost to a transient provider error; back off and
    // retry a few times before giving up loudly.
    async fn append_with_retry(&self, instance: &str, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        for attempt in 0..5u32 {
            match self.store.append(instance, events.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        target: "duraflow::runtime",
                        instance = %instance,
                        attempt,
                        error = %e,
                        "history append failed"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(10u64 << attempt)).await;
                }
            }
        }
        tracing::error!(
            target: "duraflow::runtime",
            instance = %instance,
            "history append failed permanently; state may be inconsistent"
        );
    }
}
