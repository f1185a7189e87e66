use serde::{Deserialize, Serialize};

/// Errors carrying this prefix are permanent: no retry policy will
/// reschedule them. Activities use it to signal non-retryable failures.
pub const FATAL_ERROR_PREFIX: &str = "fatal:";

/// Per-call retry policy for activities. Travels inside durable work items,
/// so retryability is expressed as data (error-prefix matching) rather than
/// a closure: an error is retryable unless it starts with one of
/// `non_retryable_prefixes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. 1 means no retry.
    pub max_attempts: u32,
    /// Delay between attempts, scheduled through the durable timer service.
    pub base_delay_ms: u64,
    pub non_retryable_prefixes: Vec<String>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            non_retryable_prefixes: vec![FATAL_ERROR_PREFIX.to_string()],
        }
    }

    /// Single attempt, permanent on any error.
    pub fn no_retry() -> Self {
        Self::new(1, 0)
    }

    pub fn with_non_retryable_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.non_retryable_prefixes.push(prefix.into());
        self
    }

    pub fn is_retryable(&self, error: &str) -> bool {
        !self
            .non_retryable_prefixes
            .iter()
            .any(|p| error.starts_with(p.as_str()))
    }

    /// Whether the attempt that just failed (1-based) should be retried.
    pub fn should_retry(&self, attempt: u32, error: &str) -> bool {
        attempt < self.max_attempts && self.is_retryable(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_attempts_exhausted() {
        let p = RetryPolicy::new(3, 10);
        assert!(p.should_retry(1, "transient glitch"));
        assert!(p.should_retry(2, "transient glitch"));
        assert!(!p.should_retry(3, "transient glitch"));
    }

    #[test]
    fn fatal_prefix_is_never_retried() {
        let p = RetryPolicy::new(5, 10);
        assert!(!p.should_retry(1, "fatal:bad input"));
    }

    #[test]
    fn custom_prefix_marks_errors_permanent() {
        let p = RetryPolicy::new(5, 10).with_non_retryable_prefix("unregistered");
        assert!(!p.should_retry(1, "unregistered activity: Foo"));
        assert!(p.should_retry(1, "timeout talking to backend"));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let p = RetryPolicy::new(0, 10);
        assert_eq!(p.max_attempts, 1);
        assert!(!p.should_retry(1, "anything"));
    }
}
