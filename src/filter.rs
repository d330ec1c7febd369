//! The filter algebra shared by `invalidate_queries`, `remove_queries`,
//! `reset_queries`, `cancel_queries`, and `refetch_queries` (spec §4.6).

use std::sync::Arc;

use crate::key::Key;
use crate::types::FetchStatus;

/// How a filter's key criterion is matched against a cached key.
#[derive(Clone)]
pub enum KeyMatch {
    /// Matches any key for which [`Key::starts_with`] holds.
    Prefix(Key),
    /// Matches only the exact key.
    Exact(Key),
}

/// Whether a query currently has at least one mounted observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    All,
    Active,
    Inactive,
}

impl Default for Activity {
    fn default() -> Self {
        Activity::All
    }
}

/// The facts about one cached query a [`QueryFilters`] is evaluated against.
/// Built fresh from [`crate::cache::CacheEntry`] at filter-evaluation time.
pub struct QuerySnapshot<'a> {
    pub key: &'a Key,
    pub is_active: bool,
    pub is_stale: bool,
    pub fetch_status: FetchStatus,
}

type Predicate = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// A composable filter: all populated criteria must hold (logical AND).
/// An empty filter (the [`Default`]) matches every query.
#[derive(Clone, Default)]
pub struct QueryFilters {
    key_match: Option<KeyMatch>,
    activity: Activity,
    stale: Option<bool>,
    fetch_status: Option<FetchStatus>,
    predicate: Option<Predicate>,
}

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, key: Key) -> Self {
        self.key_match = Some(KeyMatch::Prefix(key));
        self
    }

    pub fn exact(mut self, key: Key) -> Self {
        self.key_match = Some(KeyMatch::Exact(key));
        self
    }

    pub fn activity(mut self, activity: Activity) -> Self {
        self.activity = activity;
        self
    }

    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn fetch_status(mut self, status: FetchStatus) -> Self {
        self.fetch_status = Some(status);
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&Key) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, snapshot: &QuerySnapshot<'_>) -> bool {
        if let Some(key_match) = &self.key_match {
            let matched = match key_match {
                KeyMatch::Prefix(prefix) => snapshot.key.starts_with(prefix),
                KeyMatch::Exact(key) => snapshot.key == key,
            };
            if !matched {
                return false;
            }
        }

        match self.activity {
            Activity::All => {}
            Activity::Active if snapshot.is_active => {}
            Activity::Inactive if !snapshot.is_active => {}
            _ => return false,
        }

        if let Some(stale) = self.stale {
            if snapshot.is_stale != stale {
                return false;
            }
        }

        if let Some(status) = self.fetch_status {
            if snapshot.fetch_status != status {
                return false;
            }
        }

        if let Some(predicate) = &self.predicate {
            if !predicate(snapshot.key) {
                return false;
            }
        }

        true
    }
}
