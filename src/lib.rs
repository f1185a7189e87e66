use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod futures;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture, WaitResult};
pub use crate::retry::RetryPolicy;

/// First execution of every instance. Continue-as-new bumps this by one.
pub const INITIAL_EXECUTION_ID: u64 = 1;

/// Append-only history record for one orchestration execution.
///
/// Scheduling events carry the `event_id` assigned in the order the
/// definition requested operations; completion events carry their own
/// `event_id` plus the `source_event_id` of the scheduling entry they
/// resolve. Replay reconstructs execution state purely from this sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    OrchestrationStarted {
        event_id: u64,
        name: String,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
        attempt: u32,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
        attempt: u32,
    },
    TimerCreated {
        event_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    ExternalEvent {
        event_id: u64,
        source_event_id: u64,
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    /// Deterministic ambient accessor (guid, clock, replay-safe trace) with
    /// its recorded value.
    SystemCall {
        event_id: u64,
        op: String,
        value: String,
    },
    OrchestrationContinuedAsNew {
        event_id: u64,
        input: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        error: String,
    },
    OrchestrationTerminated {
        event_id: u64,
        reason: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. } => *event_id,
        }
    }
}

/// Next free event id for a history (ids are 1-based and monotonic).
pub fn next_event_id(history: &[Event]) -> u64 {
    history.iter().map(Event::event_id).max().unwrap_or(0) + 1
}

/// Side effects a replay turn asks the host to materialize. Pure data; the
/// runtime maps these onto provider queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
        retry: RetryPolicy,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
    },
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    /// Wall clock captured at turn start; only consulted when recording a
    /// brand-new TimerCreated or SystemCall event, never during replay.
    pub(crate) base_time_ms: u64,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    pub(crate) cancelled_source_ids: HashSet<u64>,
    pub(crate) nondeterminism_error: Option<String>,
}

impl CtxInner {
    fn new(instance: String, execution_id: u64, history: Vec<Event>) -> Self {
        let next = next_event_id(&history);
        Self {
            instance,
            execution_id,
            history,
            actions: Vec::new(),
            next_event_id: next,
            base_time_ms: wall_clock_ms(),
            claimed_scheduling_events: HashSet::new(),
            consumed_completions: HashSet::new(),
            cancelled_source_ids: HashSet::new(),
            nondeterminism_error: None,
        }
    }

    pub(crate) fn allocate_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// First scheduling event in history not yet claimed by a durable future
    /// this turn. Scheduling order is the determinism contract: the next
    /// future to claim must match this event exactly.
    pub(crate) fn next_unclaimed_scheduling(&self) -> Option<Event> {
        self.history
            .iter()
            .find(|e| {
                matches!(
                    e,
                    Event::ActivityScheduled { .. }
                        | Event::TimerCreated { .. }
                        | Event::ExternalSubscribed { .. }
                        | Event::SubOrchestrationScheduled { .. }
                ) && !self.claimed_scheduling_events.contains(&e.event_id())
            })
            .cloned()
    }

    pub(crate) fn fail_nondeterminism(&mut self, expected: &str, found: &Event) {
        let msg = format!(
            "schedule order mismatch: next in history is {found:?} but the definition requested {expected}"
        );
        self.nondeterminism_error.get_or_insert(msg);
    }
}

/// Replay context handed to orchestration definitions. All interaction with
/// the outside world goes through the durable futures and system accessors
/// on this type; definitions must not read the wall clock, environment, or
/// random state directly.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: &str, execution_id: u64, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(
                instance.to_string(),
                execution_id,
                history,
            ))),
        }
    }

    pub fn instance(&self) -> String {
        self.inner.lock().expect("ctx lock").instance.clone()
    }

    /// Schedule a named activity with no retry (a single attempt).
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_with_retry(name, input, RetryPolicy::no_retry())
    }

    /// Schedule a named activity governed by the given retry policy. Failed
    /// attempts are retried by the runtime and stay invisible to the
    /// definition until the policy is exhausted or the error is permanent.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), retry)
    }

    /// Durable timer that resolves at or after `delay_ms` from now, across
    /// process restarts.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay_ms)
    }

    /// Subscribe to a named external event for this instance.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    /// Invoke a child orchestration and await its terminal output.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), input.into())
    }

    /// Restart this instance with fresh history and the given input. The
    /// returned future never resolves; the runtime tears the execution down
    /// and re-seeds it.
    pub fn continue_as_new(&self, input: impl Into<String>) -> futures::ContinueAsNewFuture {
        futures::ContinueAsNewFuture::new(self.clone(), input.into())
    }

    /// Race two durable operations; resolves to the winner's index and
    /// output. The loser is cancelled: its eventual completion is skipped
    /// during consumption and never surfaces.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture::new(self.clone(), vec![a, b])
    }

    /// Await all of the given durable operations; outputs are returned in
    /// the order the operations were scheduled.
    pub fn join(&self, children: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(children)
    }

    /// Wait for a named external event, racing it against a durable timer.
    /// A missed deadline is an explicit outcome, not an error.
    pub async fn wait_external_with_timeout(
        &self,
        name: impl Into<String>,
        timeout_ms: u64,
    ) -> WaitResult {
        let event = self.schedule_wait(name);
        let timer = self.schedule_timer(timeout_ms);
        let (winner, output) = self.select2(event, timer).await;
        match (winner, output) {
            (0, DurableOutput::External(data)) => WaitResult::Event(data),
            (1, DurableOutput::Timer) => WaitResult::TimedOut,
            (idx, other) => {
                // Only reachable if a future kind leaks through select2.
                panic!("unexpected select2 outcome at index {idx}: {other:?}")
            }
        }
    }

    /// Deterministic guid: generated once, recorded in history, replayed
    /// from the record on every subsequent turn.
    pub fn new_guid(&self) -> String {
        self.system_call("guid", |_| generate_guid())
    }

    /// Deterministic UTC timestamp in milliseconds, recorded like a guid.
    pub fn utc_now_ms(&self) -> u64 {
        self.system_call("utcnow", |inner| inner.base_time_ms.to_string())
            .parse()
            .unwrap_or(0)
    }

    pub fn trace_info(&self, msg: impl Into<String>) {
        self.trace("INFO", msg.into());
    }

    pub fn trace_warn(&self, msg: impl Into<String>) {
        self.trace("WARN", msg.into());
    }

    pub fn trace_error(&self, msg: impl Into<String>) {
        self.trace("ERROR", msg.into());
    }

    /// Replay-safe trace: recorded as a SystemCall event and emitted through
    /// `tracing` only on first execution, never again during replay.
    fn trace(&self, level: &str, msg: String) {
        let op = format!("trace:{level}");
        self.system_call(&op, |inner| {
            let instance = inner.instance.as_str();
            let execution_id = inner.execution_id;
            match level {
                "ERROR" => {
                    tracing::error!(target: "duraflow::orchestration", instance, execution_id, "{msg}")
                }
                "WARN" => {
                    tracing::warn!(target: "duraflow::orchestration", instance, execution_id, "{msg}")
                }
                _ => {
                    tracing::info!(target: "duraflow::orchestration", instance, execution_id, "{msg}")
                }
            }
            msg.clone()
        });
    }

    /// Claim-or-record for synchronous system operations. System calls keep
    /// their own cursor: the first unclaimed SystemCall event must carry the
    /// same op, otherwise the turn is flagged nondeterministic.
    fn system_call(&self, op: &str, compute: impl FnOnce(&CtxInner) -> String) -> String {
        let mut inner = self.inner.lock().expect("ctx lock");
        let found = inner.history.iter().find_map(|e| match e {
            Event::SystemCall {
                event_id,
                op: h_op,
                value,
            } if !inner.claimed_scheduling_events.contains(event_id) => {
                Some((*event_id, h_op.clone(), value.clone()))
            }
            _ => None,
        });
        if let Some((event_id, h_op, value)) = found {
            if h_op == op {
                inner.claimed_scheduling_events.insert(event_id);
                return value;
            }
            let msg = format!(
                "system call order mismatch: next in history is SystemCall('{h_op}') but the definition requested SystemCall('{op}')"
            );
            inner.nondeterminism_error.get_or_insert(msg);
        }
        let value = compute(&inner);
        let event_id = inner.allocate_event_id();
        inner.history.push(Event::SystemCall {
            event_id,
            op: op.to_string(),
            value: value.clone(),
        });
        inner.claimed_scheduling_events.insert(event_id);
        value
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().expect("ctx lock").actions)
    }
}

/// Result of stepping a definition once against a history prefix.
#[derive(Debug)]
pub struct TurnOutcome {
    /// History after the turn: the input prefix plus any newly appended
    /// scheduling/system events.
    pub history: Vec<Event>,
    /// Side effects for the host to dispatch.
    pub actions: Vec<Action>,
    /// Terminal result, once the definition returned.
    pub output: Option<Result<String, String>>,
    /// Set when the definition's requests diverged from recorded history.
    pub nondeterminism: Option<String>,
}

/// Replay the definition from its beginning against `history`. Memoized
/// completions resolve synchronously; execution suspends at the first
/// incomplete operation. A single poll drives the whole pass. A panic
/// inside the definition is caught and surfaced as a failed turn.
pub fn run_turn<F>(
    instance: &str,
    execution_id: u64,
    history: Vec<Event>,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutcome
where
    F: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(instance, execution_id, history);
    let mut fut = Box::pin(orchestrator(ctx.clone()));
    let mut poll_cx = Context::from_waker(::futures::task::noop_waker_ref());
    // The unwind must stop here: the dispatcher task above this call serves
    // every instance in the process.
    let poll = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        fut.as_mut().poll(&mut poll_cx)
    }));
    let output = match poll {
        Ok(Poll::Ready(out)) => Some(out),
        Ok(Poll::Pending) => None,
        Err(payload) => Some(Err(format!(
            "definition panicked: {}",
            panic_message(payload)
        ))),
    };
    drop(fut);
    let actions = ctx.take_actions();
    let mut inner = ctx.inner.lock().expect("ctx lock");
    TurnOutcome {
        history: std::mem::take(&mut inner.history),
        actions,
        output,
        nondeterminism: inner.nondeterminism_error.take(),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn generate_guid() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    thread_local! {
        static COUNTER: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
    }
    let counter = COUNTER.with(|c| {
        let val = c.get();
        c.set(val.wrapping_add(1));
        val
    });

    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (timestamp >> 96) as u32,
        ((timestamp >> 80) & 0xFFFF) as u16,
        (counter & 0xFFFF) as u16,
        ((timestamp >> 64) & 0xFFFF) as u16,
        (timestamp & 0xFFFF_FFFF_FFFF) as u64
    )
}

/// JSON codec for typed orchestration and activity registration.
pub mod codec {
    use serde::{de::DeserializeOwned, Serialize};

    pub fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
    }

    pub fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
    }
}
