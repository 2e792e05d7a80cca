use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::str::FromStr;

use crate::topology::DiscoveryInfo;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
/// The unique identity of a cluster participant.
///
/// Ids are compared by value and totally ordered, the ordering is what
/// elections use to break ties.
pub struct MemberId(u64);

impl MemberId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Derives an id from a stable name, e.g. a host name.
    pub fn from_name(name: &str) -> Self {
        Self(crc32fast::hash(name.as_bytes()) as u64)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for MemberId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// The metadata a member advertises to the rest of the cluster.
pub struct MemberInfo {
    /// The address other members and clients reach the member on.
    pub address: SocketAddr,
    /// The database the member serves.
    pub database: String,
    /// The server groups the member belongs to.
    ///
    /// Groups are used by upstream selection strategies to keep traffic
    /// within a set of servers, e.g. an availability zone.
    pub groups: BTreeSet<String>,
}

impl MemberInfo {
    pub fn new(address: SocketAddr, database: impl Into<String>) -> Self {
        Self {
            address,
            database: database.into(),
            groups: BTreeSet::new(),
        }
    }

    /// Adds the member to the given server groups.
    pub fn with_groups(
        mut self,
        groups: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }
}

impl DiscoveryInfo for MemberInfo {
    fn database_name(&self) -> &str {
        &self.database
    }

    fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    fn address(&self) -> SocketAddr {
        self.address
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
/// The membership state of a participant as seen by a member.
pub enum MemberStatus {
    /// Not (yet) admitted to the cluster.
    Joining,
    /// An agreed member which is considered alive.
    Member,
    /// An agreed member the local failure detector believes may be down.
    Suspected,
    /// A member the cluster agreed has failed and removed.
    Failed,
    /// A member which voluntarily left the cluster.
    Left,
}

impl Display for MemberStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Joining => write!(f, "joining"),
            MemberStatus::Member => write!(f, "member"),
            MemberStatus::Suspected => write!(f, "suspected"),
            MemberStatus::Failed => write!(f, "failed"),
            MemberStatus::Left => write!(f, "left"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_ordering_and_parse() {
        let ids = [MemberId::new(3), MemberId::new(1), MemberId::new(2)];
        assert_eq!(ids.iter().min(), Some(&MemberId::new(1)));

        assert_eq!(" 42 ".parse::<MemberId>().expect("Parse id"), MemberId::new(42));
        assert!("forty-two".parse::<MemberId>().is_err());
        assert_eq!(MemberId::new(7).to_string(), "7");
    }

    #[test]
    fn test_member_id_from_name_is_stable() {
        assert_eq!(MemberId::from_name("server1"), MemberId::from_name("server1"));
        assert_ne!(MemberId::from_name("server1"), MemberId::from_name("server2"));
    }
}
