use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::MemberId;

/// Metadata the discovery layer needs to know about a member.
pub trait DiscoveryInfo {
    /// The database the member serves.
    fn database_name(&self) -> &str;

    /// The server groups the member belongs to.
    fn groups(&self) -> &BTreeSet<String>;

    /// The address clients connect to.
    fn address(&self) -> SocketAddr;
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// An immutable point-in-time view of `member -> metadata`.
pub struct Topology<T> {
    members: BTreeMap<MemberId, T>,
}

impl<T> Default for Topology<T> {
    fn default() -> Self {
        Self {
            members: BTreeMap::new(),
        }
    }
}

impl<T> FromIterator<(MemberId, T)> for Topology<T> {
    fn from_iter<I: IntoIterator<Item = (MemberId, T)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<T> Topology<T> {
    pub fn new(members: BTreeMap<MemberId, T>) -> Self {
        Self { members }
    }

    /// An empty topology.
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn members(&self) -> &BTreeMap<MemberId, T> {
        &self.members
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[inline]
    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains_key(member)
    }

    /// Looks up the metadata of a member.
    pub fn find(&self, member: &MemberId) -> Option<&T> {
        self.members.get(member)
    }
}

impl<T> Topology<T>
where
    T: Clone + Eq,
{
    /// Computes the changes required to go from `self` to `other`.
    ///
    /// A member appears in `added` if it only exists in `other` and in `removed`
    /// if it only exists in `self`. Members present in both never appear in either
    /// set; if their metadata changed they are reported in `updated`.
    pub fn difference(&self, other: &Topology<T>) -> TopologyDifference<T> {
        let added = other
            .members
            .iter()
            .filter(|(member, _)| !self.members.contains_key(member))
            .map(|(member, info)| Difference::new(*member, info.clone()))
            .collect();

        let removed = self
            .members
            .iter()
            .filter(|(member, _)| !other.members.contains_key(member))
            .map(|(member, info)| Difference::new(*member, info.clone()))
            .collect();

        let updated = other
            .members
            .iter()
            .filter_map(|(member, info)| {
                let previous = self.members.get(member)?;
                (previous != info).then(|| Difference::new(*member, info.clone()))
            })
            .collect();

        TopologyDifference {
            added,
            removed,
            updated,
        }
    }
}

impl<T> Topology<T>
where
    T: DiscoveryInfo + Clone,
{
    /// Restricts the topology to the members serving the given database.
    pub fn filter_by_database(&self, database: &str) -> Topology<T> {
        self.members
            .iter()
            .filter(|(_, info)| info.database_name() == database)
            .map(|(member, info)| (*member, info.clone()))
            .collect()
    }

    /// Restricts the topology to the members belonging to any of the given groups.
    pub fn filter_by_groups<'a>(
        &self,
        groups: impl IntoIterator<Item = &'a str> + Clone,
    ) -> Topology<T> {
        self.members
            .iter()
            .filter(|(_, info)| {
                groups
                    .clone()
                    .into_iter()
                    .any(|group| info.groups().contains(group))
            })
            .map(|(member, info)| (*member, info.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// A single member entry of a [TopologyDifference].
pub struct Difference<T> {
    pub member: MemberId,
    pub info: T,
}

impl<T> Difference<T> {
    pub fn new(member: MemberId, info: T) -> Self {
        Self { member, info }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// The changes between two topology snapshots.
pub struct TopologyDifference<T> {
    pub added: Vec<Difference<T>>,
    pub removed: Vec<Difference<T>>,
    pub updated: Vec<Difference<T>>,
}

impl<T> TopologyDifference<T> {
    /// Returns if the two snapshots had any differences.
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }
}

/// Holds the current topology and publishes every replacement to readers.
///
/// Only the membership executor applies new snapshots, any number of readers
/// can observe them and always see a complete snapshot.
pub struct TopologyStore<T> {
    tx: watch::Sender<Arc<Topology<T>>>,
    rx: watch::Receiver<Arc<Topology<T>>>,
}

impl<T> Default for TopologyStore<T> {
    fn default() -> Self {
        let (tx, rx) = watch::channel(Arc::new(Topology::empty()));
        Self { tx, rx }
    }
}

impl<T> TopologyStore<T>
where
    T: Clone + Eq + Send + Sync + 'static,
{
    /// Replaces the current topology, returning the difference to the prior one.
    ///
    /// An empty snapshot is valid and reports every prior member as removed.
    pub fn apply(&self, snapshot: Topology<T>) -> TopologyDifference<T> {
        let snapshot = Arc::new(snapshot);
        let previous = self.tx.send_replace(snapshot.clone());
        previous.difference(&snapshot)
    }

    /// The currently published topology.
    pub fn current(&self) -> Arc<Topology<T>> {
        self.rx.borrow().clone()
    }

    /// Looks up a member within the current topology.
    pub fn find(&self, member: &MemberId) -> Option<T> {
        self.rx.borrow().find(member).cloned()
    }

    /// Returns a handle which observes every published topology.
    pub fn watcher(&self) -> watch::Receiver<Arc<Topology<T>>> {
        self.rx.clone()
    }

    /// Returns a stream of published topologies.
    pub fn changes(&self) -> WatchStream<Arc<Topology<T>>> {
        WatchStream::new(self.rx.clone())
    }
}

impl<T> TopologyStore<T>
where
    T: DiscoveryInfo + Clone + Eq + Send + Sync + 'static,
{
    /// Restricts the current topology to the members serving the given database.
    pub fn filter_by_database(&self, database: &str) -> Topology<T> {
        self.rx.borrow().filter_by_database(database)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::MemberInfo;

    fn info(port: u16, db: &str) -> MemberInfo {
        MemberInfo::new(([127, 0, 0, 1], port).into(), db)
    }

    fn topology(entries: &[(u64, u16, &str)]) -> Topology<MemberInfo> {
        entries
            .iter()
            .map(|(id, port, db)| (MemberId::new(*id), info(*port, db)))
            .collect()
    }

    #[test]
    fn test_difference() {
        let old = topology(&[(1, 1, "neo"), (2, 2, "neo"), (3, 3, "neo")]);
        let new = topology(&[(2, 2, "neo"), (3, 3, "neo"), (4, 4, "neo")]);

        let diff = old.difference(&new);
        assert_eq!(diff.added, vec![Difference::new(MemberId::new(4), info(4, "neo"))]);
        assert_eq!(diff.removed, vec![Difference::new(MemberId::new(1), info(1, "neo"))]);
        assert!(diff.updated.is_empty());

        let added = diff.added.iter().map(|d| d.member).collect::<HashSet<_>>();
        let removed = diff.removed.iter().map(|d| d.member).collect::<HashSet<_>>();
        assert!(added.is_disjoint(&removed));
    }

    #[test]
    fn test_difference_of_identical_snapshots() {
        let old = topology(&[(1, 1, "neo"), (2, 2, "neo")]);
        let new = old.clone();

        let diff = old.difference(&new);
        assert!(!diff.has_changes());
        assert_eq!(old, new);
    }

    #[test]
    fn test_difference_reports_metadata_changes_as_updates() {
        let old = topology(&[(1, 1, "neo")]);
        let new = topology(&[(1, 10, "neo")]);

        let diff = old.difference(&new);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.updated, vec![Difference::new(MemberId::new(1), info(10, "neo"))]);
    }

    #[test]
    fn test_find_and_filter() {
        let topology = Topology::from_iter([
            (MemberId::new(1), info(1, "neo").with_groups(["eu"])),
            (MemberId::new(2), info(2, "graph").with_groups(["us"])),
            (MemberId::new(3), info(3, "neo").with_groups(["us", "eu"])),
        ]);

        assert_eq!(topology.find(&MemberId::new(2)).map(|i| i.address.port()), Some(2));
        assert!(topology.find(&MemberId::new(9)).is_none());

        let neo = topology.filter_by_database("neo");
        assert_eq!(
            neo.members().keys().copied().collect::<Vec<_>>(),
            vec![MemberId::new(1), MemberId::new(3)]
        );
        assert!(topology.filter_by_database("missing").is_empty());

        let us = topology.filter_by_groups(["us"]);
        assert_eq!(
            us.members().keys().copied().collect::<Vec<_>>(),
            vec![MemberId::new(2), MemberId::new(3)]
        );
    }

    #[test]
    fn test_store_apply() {
        let store = TopologyStore::default();

        let diff = store.apply(topology(&[(1, 1, "neo"), (2, 2, "neo")]));
        assert_eq!(diff.added.len(), 2);
        assert!(diff.removed.is_empty());
        assert_eq!(store.current().len(), 2);
        assert_eq!(store.find(&MemberId::new(1)), Some(info(1, "neo")));

        let watcher = store.watcher();

        // An empty snapshot is not an error, everything is removed.
        let diff = store.apply(Topology::empty());
        assert!(diff.added.is_empty());
        assert_eq!(
            diff.removed.iter().map(|d| d.member).collect::<Vec<_>>(),
            vec![MemberId::new(1), MemberId::new(2)]
        );
        assert!(store.current().is_empty());
        assert!(watcher.borrow().is_empty());
        assert!(store.filter_by_database("neo").is_empty());
    }
}
