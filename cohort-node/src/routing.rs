use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::membership::ClusterConfiguration;
use crate::topology::Topology;
use crate::{MemberId, MemberInfo, LEADER_ROLE};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
/// The kind of work a client wants to route.
pub enum RolePreference {
    /// Writes, only served by the leader.
    Write,
    /// Reads, served by the followers.
    Read,
    /// Fetching a fresh routing table, served by every member.
    Route,
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// The addresses serving each kind of client work for a limited time.
pub struct RoutingTable {
    writers: Vec<SocketAddr>,
    readers: Vec<SocketAddr>,
    routers: Vec<SocketAddr>,
    ttl: Duration,
}

impl RoutingTable {
    /// Builds the routing table for the given configuration.
    ///
    /// Writes go to the leader, if one is elected. Reads go to every other
    /// member, or to the leader alone if it is the only member.
    pub fn build(config: &ClusterConfiguration, ttl: Duration) -> Self {
        let leader = config.role_holder(LEADER_ROLE);

        let writers = leader
            .and_then(|leader| config.address_of(leader))
            .into_iter()
            .collect::<Vec<_>>();

        let routers = config
            .members()
            .values()
            .map(|info| info.address)
            .collect::<Vec<_>>();

        let mut readers = config
            .members()
            .iter()
            .filter(|(member, _)| Some(**member) != leader)
            .map(|(_, info)| info.address)
            .collect::<Vec<_>>();
        if readers.is_empty() {
            readers = routers.clone();
        }

        Self {
            writers,
            readers,
            routers,
            ttl,
        }
    }

    /// The addresses serving the given kind of work.
    pub fn endpoints(&self, preference: RolePreference) -> &[SocketAddr] {
        match preference {
            RolePreference::Write => &self.writers,
            RolePreference::Read => &self.readers,
            RolePreference::Route => &self.routers,
        }
    }

    #[inline]
    /// How long a client may use the table before fetching a new one.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Selects the member a read replica should pull updates from.
pub trait UpstreamStrategy: Send + Sync {
    /// A name used in logs.
    fn name(&self) -> &str;

    /// Selects an upstream other than `me`, if any is suitable.
    fn upstream(&self, me: MemberId, topology: &Topology<MemberInfo>) -> Option<MemberId>;
}

#[derive(Debug, Clone)]
/// Connects to a random member of the configured server groups.
///
/// Without any configured groups no upstream is selected, so another
/// strategy can take over.
pub struct ConnectRandomlyToServerGroup {
    groups: BTreeSet<String>,
}

impl ConnectRandomlyToServerGroup {
    pub fn new(groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

impl UpstreamStrategy for ConnectRandomlyToServerGroup {
    fn name(&self) -> &str {
        "connect-randomly-to-server-group"
    }

    fn upstream(&self, me: MemberId, topology: &Topology<MemberInfo>) -> Option<MemberId> {
        if self.groups.is_empty() {
            return None;
        }

        let in_groups = topology.filter_by_groups(self.groups.iter().map(String::as_str));
        choose_other(me, &in_groups)
    }
}

#[derive(Debug, Copy, Clone, Default)]
/// Connects to any random member.
pub struct ConnectToRandomMember;

impl UpstreamStrategy for ConnectToRandomMember {
    fn name(&self) -> &str {
        "connect-to-random-member"
    }

    fn upstream(&self, me: MemberId, topology: &Topology<MemberInfo>) -> Option<MemberId> {
        choose_other(me, topology)
    }
}

fn choose_other(me: MemberId, topology: &Topology<MemberInfo>) -> Option<MemberId> {
    let candidates = topology
        .members()
        .keys()
        .copied()
        .filter(|member| *member != me)
        .collect::<Vec<_>>();

    candidates.choose(&mut rand::thread_rng()).copied()
}
