//! Retry policy shared by [`crate::observer::QueryObserver`] and
//! [`crate::mutation::MutationObserver`].

use std::time::Duration;

/// How many attempts beyond the initial one are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCount {
    Finite(u32),
    Infinite,
}

impl RetryCount {
    fn allows(&self, attempt_index: i64) -> bool {
        match self {
            RetryCount::Infinite => true,
            RetryCount::Finite(n) => attempt_index < *n as i64,
        }
    }
}

impl From<u32> for RetryCount {
    fn from(n: u32) -> Self {
        RetryCount::Finite(n)
    }
}

/// Per-attempt delay strategy. The default matches spec §4.4:
/// `min(1000 * 2^attempt, max_retry_delay)`.
#[derive(Clone)]
pub struct RetryDelay(std::sync::Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl RetryDelay {
    pub fn new(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(std::sync::Arc::new(f))
    }

    pub fn exponential(max: Duration) -> Self {
        Self::new(move |attempt| {
            let millis = 1000u64.saturating_mul(1u64 << attempt.min(32));
            Duration::from_millis(millis).min(max)
        })
    }

    pub fn call(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RetryDelay(..)")
    }
}

/// A caller override deciding whether attempt `attempt_index` should run,
/// given the error from the previous attempt.
pub type RetryPredicate =
    std::sync::Arc<dyn Fn(u32, &crate::error::QueryError) -> bool + Send + Sync>;

/// Full retry configuration for one observer or mutation.
#[derive(Clone)]
pub struct RetryPolicy {
    pub count: RetryCount,
    pub delay: RetryDelay,
    pub predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(count: impl Into<RetryCount>, max_retry_delay: Duration) -> Self {
        Self { count: count.into(), delay: RetryDelay::exponential(max_retry_delay), predicate: None }
    }

    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// `attempt_index` is zero-based and counts the attempt about to be
    /// made *after* the initial one (spec §4.4: `retry=N` ⇒ up to N
    /// retries ⇒ N+1 total attempts).
    pub fn should_retry(&self, attempt_index: u32, error: &crate::error::QueryError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            return predicate(attempt_index, error);
        }
        self.count.allows(attempt_index as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3u32, Duration::from_secs(30))
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("count", &self.count)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Mutations default to no retries (spec §4.7).
pub fn mutation_default_policy() -> RetryPolicy {
    RetryPolicy::new(0u32, Duration::from_secs(30))
}
