//! Terminal-state queries derived from history.

use std::sync::Arc;

use crate::providers::HistoryStore;
use crate::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Status of the execution this history belongs to. An empty history means
/// the instance is unknown.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for e in history.iter().rev() {
        match e {
            Event::OrchestrationCompleted { output, .. } => {
                return OrchestrationStatus::Completed {
                    output: output.clone(),
                }
            }
            Event::OrchestrationFailed { error, .. } => {
                return OrchestrationStatus::Failed {
                    error: error.clone(),
                }
            }
            Event::OrchestrationTerminated { reason, .. } => {
                return OrchestrationStatus::Terminated {
                    reason: reason.clone(),
                }
            }
            _ => {}
        }
    }
    OrchestrationStatus::Running
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Poll the store until the instance reaches a terminal state or the
/// timeout elapses. Continue-as-new restarts are not terminal.
pub async fn wait_for_orchestration(
    store: &Arc<dyn HistoryStore>,
    instance: &str,
    timeout_ms: u64,
) -> Result<OrchestrationStatus, WaitError> {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        let status = status_from_history(&store.read(instance).await);
        if status.is_terminal() {
            return Ok(status);
        }
        if std::time::Instant::now() >= deadline {
            return Err(WaitError::Timeout);
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_until_terminal_event() {
        let mut history = vec![Event::OrchestrationStarted {
            event_id: 1,
            name: "O".into(),
            input: String::new(),
            parent_instance: None,
            parent_id: None,
        }];
        assert_eq!(status_from_history(&history), OrchestrationStatus::Running);
        history.push(Event::OrchestrationCompleted {
            event_id: 2,
            output: "done".into(),
        });
        assert_eq!(
            status_from_history(&history),
            OrchestrationStatus::Completed { output: "done".into() }
        );
        assert_eq!(status_from_history(&[]), OrchestrationStatus::NotFound);
    }
}
