use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the commits of a node.
pub struct ReplicationStatistics(Arc<ReplicationStatisticsInner>);

impl Deref for ReplicationStatistics {
    type Target = ReplicationStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ReplicationStatisticsInner {
    pub(crate) num_forwarded: Counter,
    pub(crate) num_applied: Counter,
    pub(crate) num_duplicates: Counter,
    pub(crate) num_conflicts: Counter,
    pub(crate) num_transient_failures: Counter,
    pub(crate) num_fatal_failures: Counter,
}

impl ReplicationStatisticsInner {
    /// The number of commits this node has forwarded to a leader.
    pub fn num_forwarded(&self) -> u64 {
        self.num_forwarded.load(Ordering::Relaxed)
    }

    /// The number of transactions this node applied while being leader.
    pub fn num_applied(&self) -> u64 {
        self.num_applied.load(Ordering::Relaxed)
    }

    /// The number of requests this node recognised as retries of applied events.
    pub fn num_duplicates(&self) -> u64 {
        self.num_duplicates.load(Ordering::Relaxed)
    }

    /// The number of commits rejected because of their context.
    pub fn num_conflicts(&self) -> u64 {
        self.num_conflicts.load(Ordering::Relaxed)
    }

    /// The number of commits which failed in a retryable way.
    pub fn num_transient_failures(&self) -> u64 {
        self.num_transient_failures.load(Ordering::Relaxed)
    }

    /// The number of commits the leader failed to apply.
    pub fn num_fatal_failures(&self) -> u64 {
        self.num_fatal_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn incr(counter: &Counter) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
