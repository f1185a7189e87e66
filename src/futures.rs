use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, Event, OrchestrationContext, RetryPolicy};

/// Completion gate: a completion event may be consumed only once every
/// completion that precedes it in history has been consumed, except
/// completions whose scheduling entry was cancelled (select2 losers), which
/// never block. This preserves the logical completion order across replays
/// regardless of physical arrival order.
fn can_consume_completion(
    history: &[Event],
    consumed_completions: &HashSet<u64>,
    cancelled_source_ids: &HashSet<u64>,
    completion_event_id: u64,
) -> bool {
    history.iter().all(|e| match e {
        Event::ActivityCompleted {
            event_id,
            source_event_id,
            ..
        }
        | Event::ActivityFailed {
            event_id,
            source_event_id,
            ..
        }
        | Event::TimerFired {
            event_id,
            source_event_id,
            ..
        }
        | Event::ExternalEvent {
            event_id,
            source_event_id,
            ..
        }
        | Event::SubOrchestrationCompleted {
            event_id,
            source_event_id,
            ..
        }
        | Event::SubOrchestrationFailed {
            event_id,
            source_event_id,
            ..
        } => {
            cancelled_source_ids.contains(source_event_id)
                || *event_id >= completion_event_id
                || consumed_completions.contains(event_id)
        }
        _ => true,
    })
}

/// Resolved value of a durable operation.
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
}

/// Outcome of waiting for an external event under a deadline. A missed
/// deadline is a first-class alternative, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    Event(String),
    TimedOut,
}

/// A single awaited durable operation. Correlated to history by the
/// scheduling event id it claims, in the order the definition requests
/// operations; reconstructed from scratch on every replay pass.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity {
        name: String,
        input: String,
        retry: RetryPolicy,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    Timer {
        delay_ms: u64,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    External {
        name: String,
        claimed_event_id: Cell<Option<u64>>,
        result: RefCell<Option<String>>,
        ctx: OrchestrationContext,
    },
    SubOrch {
        name: String,
        instance: RefCell<String>,
        input: String,
        claimed_event_id: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String, retry: RetryPolicy) -> Self {
        Self(Kind::Activity {
            name,
            input,
            retry,
            claimed_event_id: Cell::new(None),
            ctx,
        })
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self(Kind::Timer {
            delay_ms,
            claimed_event_id: Cell::new(None),
            ctx,
        })
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self(Kind::External {
            name,
            claimed_event_id: Cell::new(None),
            result: RefCell::new(None),
            ctx,
        })
    }

    pub(crate) fn sub_orchestration(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self(Kind::SubOrch {
            name,
            instance: RefCell::new(String::new()),
            input,
            claimed_event_id: Cell::new(None),
            ctx,
        })
    }

    pub(crate) fn claimed_id(&self) -> Option<u64> {
        match &self.0 {
            Kind::Activity { claimed_event_id, .. }
            | Kind::Timer { claimed_event_id, .. }
            | Kind::External { claimed_event_id, .. }
            | Kind::SubOrch { claimed_event_id, .. } => claimed_event_id.get(),
        }
    }

    /// Narrow to an activity result.
    pub fn into_activity(self) -> ActivityFuture {
        ActivityFuture(self)
    }

    /// Narrow to a timer elapse.
    pub fn into_timer(self) -> TimerElapsedFuture {
        TimerElapsedFuture(self)
    }

    /// Narrow to an external event payload.
    pub fn into_event(self) -> ExternalEventFuture {
        ExternalEventFuture(self)
    }

    /// Narrow to a sub-orchestration result.
    pub fn into_sub_orchestration(self) -> SubOrchestrationFuture {
        SubOrchestrationFuture(self)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        match &mut this.0 {
            Kind::Activity {
                name,
                input,
                retry,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().expect("ctx lock");

                if claimed_event_id.get().is_none() {
                    match inner.next_unclaimed_scheduling() {
                        Some(Event::ActivityScheduled {
                            event_id,
                            name: h_name,
                            input: h_input,
                        }) if h_name == *name && h_input == *input => {
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                        Some(other) => {
                            inner.fail_nondeterminism(&format!("ActivityScheduled('{name}')"), &other);
                            return Poll::Pending;
                        }
                        None => {
                            let event_id = inner.allocate_event_id();
                            inner.history.push(Event::ActivityScheduled {
                                event_id,
                                name: name.clone(),
                                input: input.clone(),
                            });
                            inner.record_action(Action::CallActivity {
                                scheduling_event_id: event_id,
                                name: name.clone(),
                                input: input.clone(),
                                retry: retry.clone(),
                            });
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                    }
                }

                let our_id = claimed_event_id.get().expect("claimed above");
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::ActivityCompleted {
                        event_id,
                        source_event_id,
                        result,
                        ..
                    } if *source_event_id == our_id => Some((*event_id, Ok(result.clone()))),
                    Event::ActivityFailed {
                        event_id,
                        source_event_id,
                        error,
                        ..
                    } if *source_event_id == our_id => Some((*event_id, Err(error.clone()))),
                    _ => None,
                });

                if let Some((completion_event_id, result)) = completion {
                    if can_consume_completion(
                        &inner.history,
                        &inner.consumed_completions,
                        &inner.cancelled_source_ids,
                        completion_event_id,
                    ) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::Activity(result));
                    }
                }

                Poll::Pending
            }
            Kind::Timer {
                delay_ms,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().expect("ctx lock");

                if claimed_event_id.get().is_none() {
                    match inner.next_unclaimed_scheduling() {
                        Some(Event::TimerCreated { event_id, .. }) => {
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                        Some(other) => {
                            inner.fail_nondeterminism("TimerCreated", &other);
                            return Poll::Pending;
                        }
                        None => {
                            let event_id = inner.allocate_event_id();
                            let fire_at_ms = inner.base_time_ms.saturating_add(*delay_ms);
                            inner.history.push(Event::TimerCreated { event_id, fire_at_ms });
                            inner.record_action(Action::CreateTimer {
                                scheduling_event_id: event_id,
                                fire_at_ms,
                            });
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                    }
                }

                let our_id = claimed_event_id.get().expect("claimed above");
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::TimerFired {
                        event_id,
                        source_event_id,
                        ..
                    } if *source_event_id == our_id => Some(*event_id),
                    _ => None,
                });

                if let Some(completion_event_id) = completion {
                    if can_consume_completion(
                        &inner.history,
                        &inner.consumed_completions,
                        &inner.cancelled_source_ids,
                        completion_event_id,
                    ) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::Timer);
                    }
                }

                Poll::Pending
            }
            Kind::External {
                name,
                claimed_event_id,
                result,
                ctx,
            } => {
                if let Some(cached) = result.borrow().clone() {
                    return Poll::Ready(DurableOutput::External(cached));
                }

                let mut inner = ctx.inner.lock().expect("ctx lock");

                if claimed_event_id.get().is_none() {
                    match inner.next_unclaimed_scheduling() {
                        Some(Event::ExternalSubscribed { event_id, name: h_name }) if h_name == *name => {
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                        Some(other) => {
                            inner.fail_nondeterminism(&format!("ExternalSubscribed('{name}')"), &other);
                            return Poll::Pending;
                        }
                        None => {
                            let event_id = inner.allocate_event_id();
                            inner.history.push(Event::ExternalSubscribed {
                                event_id,
                                name: name.clone(),
                            });
                            inner.record_action(Action::WaitExternal {
                                scheduling_event_id: event_id,
                                name: name.clone(),
                            });
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                    }
                }

                let our_id = claimed_event_id.get().expect("claimed above");
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::ExternalEvent {
                        event_id,
                        source_event_id,
                        data,
                        ..
                    } if *source_event_id == our_id => Some((*event_id, data.clone())),
                    _ => None,
                });

                if let Some((completion_event_id, data)) = completion {
                    if can_consume_completion(
                        &inner.history,
                        &inner.consumed_completions,
                        &inner.cancelled_source_ids,
                        completion_event_id,
                    ) {
                        inner.consumed_completions.insert(completion_event_id);
                        *result.borrow_mut() = Some(data.clone());
                        return Poll::Ready(DurableOutput::External(data));
                    }
                }

                Poll::Pending
            }
            Kind::SubOrch {
                name,
                instance,
                input,
                claimed_event_id,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().expect("ctx lock");

                if claimed_event_id.get().is_none() {
                    match inner.next_unclaimed_scheduling() {
                        Some(Event::SubOrchestrationScheduled {
                            event_id,
                            name: h_name,
                            instance: h_instance,
                            input: h_input,
                        }) if h_name == *name && h_input == *input => {
                            *instance.borrow_mut() = h_instance;
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                        Some(other) => {
                            inner.fail_nondeterminism(&format!("SubOrchestrationScheduled('{name}')"), &other);
                            return Poll::Pending;
                        }
                        None => {
                            let event_id = inner.allocate_event_id();
                            let child = format!("{}::sub-{event_id}", inner.instance);
                            *instance.borrow_mut() = child.clone();
                            inner.history.push(Event::SubOrchestrationScheduled {
                                event_id,
                                name: name.clone(),
                                instance: child.clone(),
                                input: input.clone(),
                            });
                            inner.record_action(Action::StartSubOrchestration {
                                scheduling_event_id: event_id,
                                name: name.clone(),
                                instance: child,
                                input: input.clone(),
                            });
                            inner.claimed_scheduling_events.insert(event_id);
                            claimed_event_id.set(Some(event_id));
                        }
                    }
                }

                let our_id = claimed_event_id.get().expect("claimed above");
                let completion = inner.history.iter().find_map(|e| match e {
                    Event::SubOrchestrationCompleted {
                        event_id,
                        source_event_id,
                        result,
                    } if *source_event_id == our_id => Some((*event_id, Ok(result.clone()))),
                    Event::SubOrchestrationFailed {
                        event_id,
                        source_event_id,
                        error,
                    } if *source_event_id == our_id => Some((*event_id, Err(error.clone()))),
                    _ => None,
                });

                if let Some((completion_event_id, result)) = completion {
                    if can_consume_completion(
                        &inner.history,
                        &inner.consumed_completions,
                        &inner.cancelled_source_ids,
                        completion_event_id,
                    ) {
                        inner.consumed_completions.insert(completion_event_id);
                        return Poll::Ready(DurableOutput::SubOrchestration(result));
                    }
                }

                Poll::Pending
            }
        }
    }
}

// Poll projects freely into Kind; keep the future Unpin so that stays sound.
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<DurableFuture>();
};

pub struct ActivityFuture(DurableFuture);

impl Future for ActivityFuture {
    type Output = Result<String, String>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::Activity(r)) => Poll::Ready(r),
            Poll::Ready(other) => panic!("expected activity completion, got {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct TimerElapsedFuture(DurableFuture);

impl Future for TimerElapsedFuture {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
            Poll::Ready(other) => panic!("expected timer completion, got {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct ExternalEventFuture(DurableFuture);

impl Future for ExternalEventFuture {
    type Output = String;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::External(data)) => Poll::Ready(data),
            Poll::Ready(other) => panic!("expected external event, got {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct SubOrchestrationFuture(DurableFuture);

impl Future for SubOrchestrationFuture {
    type Output = Result<String, String>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().0).poll(cx) {
            Poll::Ready(DurableOutput::SubOrchestration(r)) => Poll::Ready(r),
            Poll::Ready(other) => panic!("expected sub-orchestration completion, got {other:?}"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Race between durable operations; first consumable completion wins.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Poll every child first so all of them claim their scheduling
        // events; skipping losers here would shift the claim order on
        // replay and corrupt determinism.
        let mut ready: Vec<Option<DurableOutput>> = Vec::with_capacity(this.children.len());
        for child in this.children.iter_mut() {
            ready.push(match Pin::new(child).poll(cx) {
                Poll::Ready(out) => Some(out),
                Poll::Pending => None,
            });
        }

        // The completion gate admits the earliest unconsumed completion
        // first, so whichever child is Ready is the true winner by history
        // order regardless of child index.
        let Some(winner) = ready.iter().position(|r| r.is_some()) else {
            return Poll::Pending;
        };

        // Cancel the losers: their completions must never block consumption
        // nor surface later; a late arrival becomes a no-op.
        let mut inner = this.ctx.inner.lock().expect("ctx lock");
        for (i, child) in this.children.iter().enumerate() {
            if i != winner {
                if let Some(source_id) = child.claimed_id() {
                    inner.cancelled_source_ids.insert(source_id);
                }
            }
        }
        drop(inner);

        let output = ready[winner].take().expect("winner is ready");
        Poll::Ready((winner, output))
    }
}

/// Await all child operations; outputs come back in scheduling order.
pub struct JoinFuture {
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        Self { children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut results: Vec<Option<DurableOutput>> = (0..this.children.len()).map(|_| None).collect();

        // Fixed point: consuming one completion can unblock the next in
        // history order, so keep sweeping until a full pass makes no
        // progress.
        loop {
            let mut made_progress = false;
            for (i, child) in this.children.iter_mut().enumerate() {
                if results[i].is_some() {
                    continue;
                }
                if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                    results[i] = Some(out);
                    made_progress = true;
                }
            }
            if results.iter().all(|r| r.is_some()) {
                return Poll::Ready(results.into_iter().map(|r| r.expect("all ready")).collect());
            }
            if !made_progress {
                return Poll::Pending;
            }
        }
    }
}

/// Requests a restart of the instance with fresh history; never resolves.
pub struct ContinueAsNewFuture {
    ctx: OrchestrationContext,
    input: String,
    recorded: Cell<bool>,
}

impl ContinueAsNewFuture {
    pub(crate) fn new(ctx: OrchestrationContext, input: String) -> Self {
        Self {
            ctx,
            input,
            recorded: Cell::new(false),
        }
    }
}

impl Future for ContinueAsNewFuture {
    type Output = ();
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.recorded.replace(true) {
            this.ctx
                .inner
                .lock()
                .expect("ctx lock")
                .record_action(Action::ContinueAsNew {
                    input: this.input.clone(),
                });
        }
        Poll::Pending
    }
}
