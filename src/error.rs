//! The one error type returned by fallible operations in this crate.

use std::fmt;
use std::sync::Arc;

/// Failure modes surfaced by the cache, observers, and mutations.
///
/// `fetchFn`/`mutationFn` failures are wrapped in [`QueryError::Failed`];
/// everything else names a condition internal to the engine itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The caller-supplied fetch or mutation function returned an error.
    #[error("fetch failed: {0}")]
    Failed(Arc<dyn StdErrorLike>),

    /// The in-flight fetch was cancelled via a cancellation signal.
    #[error("fetch was cancelled")]
    Cancelled,

    /// No fetch function was supplied and no default is registered for the
    /// observer's element type.
    #[error("no fetch function registered for this query's type")]
    NoFetchFn,

    /// A mutation could not run because the client is offline and its
    /// network mode requires connectivity.
    #[error("mutation paused: offline")]
    MutationPaused,
}

impl QueryError {
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        QueryError::Failed(Arc::new(err))
    }

    pub fn failed_msg(msg: impl Into<String>) -> Self {
        QueryError::Failed(Arc::new(MessageError(msg.into())))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}

/// Object-safe supertrait so `QueryError::Failed` can box any caller error
/// while remaining `Clone` (a plain `Box<dyn Error>` is not `Clone`).
///
/// `dyn StdErrorLike` can't inherit `Display`/`Debug` impls from its
/// supertrait automatically, so the blanket impl forwards through a method
/// that still sees the concrete type.
pub trait StdErrorLike: std::error::Error + Send + Sync + 'static {
    fn fmt_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
impl<T: std::error::Error + Send + Sync + 'static> StdErrorLike for T {}

impl fmt::Debug for dyn StdErrorLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_dyn(f)
    }
}

impl fmt::Display for dyn StdErrorLike {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_dyn(f)
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MessageError {}

pub type Result<T> = std::result::Result<T, QueryError>;
