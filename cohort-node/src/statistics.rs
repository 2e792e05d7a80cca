use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the membership of a node.
pub struct ClusterStatistics(Arc<ClusterStatisticsInner>);

impl Deref for ClusterStatistics {
    type Target = ClusterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ClusterStatisticsInner {
    /// The number of agreed members which are not suspected.
    pub(crate) num_live_members: Counter,
    /// The number of agreed members the local failure detector suspects.
    pub(crate) num_suspected_members: Counter,
    /// The number of members the cluster agreed have failed.
    pub(crate) num_failed_members: Counter,
    /// The version of the configuration the node has adopted.
    pub(crate) configuration_version: Counter,
    /// The number of agreement rounds abandoned by the node.
    pub(crate) num_abandoned_rounds: Counter,
}

impl ClusterStatisticsInner {
    /// The number of agreed members which are not suspected.
    pub fn num_live_members(&self) -> u64 {
        self.num_live_members.load(Ordering::Relaxed)
    }

    /// The number of agreed members the local failure detector suspects.
    pub fn num_suspected_members(&self) -> u64 {
        self.num_suspected_members.load(Ordering::Relaxed)
    }

    /// The number of members the cluster agreed have failed.
    pub fn num_failed_members(&self) -> u64 {
        self.num_failed_members.load(Ordering::Relaxed)
    }

    /// The version of the configuration the node has adopted.
    pub fn configuration_version(&self) -> u64 {
        self.configuration_version.load(Ordering::Relaxed)
    }

    /// The number of agreement rounds abandoned by the node.
    pub fn num_abandoned_rounds(&self) -> u64 {
        self.num_abandoned_rounds.load(Ordering::Relaxed)
    }
}
