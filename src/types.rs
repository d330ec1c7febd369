//! Shared status enums used across observers, the cache, and mutations.

use std::time::Duration;

/// The data-presence half of an observer's state (spec §4.1, §4.4).
///
/// Independent of [`FetchStatus`]: a query can be `Success` while a
/// background refetch is `Fetching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No data has ever successfully resolved for this key.
    Pending,
    /// The most recent resolution was a success; `data` is populated.
    Success,
    /// The most recent resolution was a failure; `error` is populated and
    /// any previously-fetched `data` is retained (spec §3).
    Error,
}

/// The activity half of an observer's state, independent of [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    Idle,
    Fetching,
    /// Gated by network mode while [`crate::manager::OnlineManager`]
    /// reports offline (spec §4.4 step 3).
    Paused,
}

/// Governs whether a fetch proceeds while offline (spec §4.4, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkMode {
    /// Runs only while online; pauses and resumes on reconnect. Default.
    #[default]
    Online,
    /// Always runs regardless of connectivity.
    Always,
    /// Runs the first attempt regardless of connectivity, but pauses
    /// retries while offline.
    OfflineFirst,
}

/// Imperative status of a [`crate::mutation::MutationObserver`] (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// Default freshness window: data older than this is considered stale and
/// eligible for a background refetch (spec §4.3). Zero means "always stale".
pub const DEFAULT_STALE_WINDOW: Duration = Duration::ZERO;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_mode_defaults_to_online() {
        assert_eq!(NetworkMode::default(), NetworkMode::Online);
    }

    #[test]
    fn mutation_status_defaults_to_idle() {
        assert_eq!(MutationStatus::default(), MutationStatus::Idle);
    }
}
