use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::membership::{ClusterEvent, ClusterOp};
use crate::topology::Topology;
use crate::{MemberId, MemberInfo};

#[derive(Debug, Clone, Eq, PartialEq)]
/// The agreed set of members and role holders of a cluster.
///
/// A configuration is only ever changed by applying an agreed [ClusterOp],
/// each one bumping the version by one.
pub struct ClusterConfiguration {
    name: String,
    version: u64,
    members: BTreeMap<MemberId, MemberInfo>,
    roles: BTreeMap<String, MemberId>,
    failed: BTreeMap<MemberId, MemberInfo>,
}

impl ClusterConfiguration {
    /// Creates an empty configuration at version `0`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            members: BTreeMap::new(),
            roles: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    #[inline]
    /// The name of the cluster.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    /// The number of operations applied to the configuration.
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn members(&self) -> &BTreeMap<MemberId, MemberInfo> {
        &self.members
    }

    #[inline]
    /// The role holders, `role -> member`.
    pub fn roles(&self) -> &BTreeMap<String, MemberId> {
        &self.roles
    }

    #[inline]
    /// Members removed because the cluster agreed they failed.
    ///
    /// An entry is dropped again once a process rejoins with the same id.
    pub fn failed(&self) -> &BTreeMap<MemberId, MemberInfo> {
        &self.failed
    }

    #[inline]
    pub fn contains(&self, member: MemberId) -> bool {
        self.members.contains_key(&member)
    }

    #[inline]
    pub fn member(&self, member: MemberId) -> Option<&MemberInfo> {
        self.members.get(&member)
    }

    #[inline]
    pub fn address_of(&self, member: MemberId) -> Option<SocketAddr> {
        self.members.get(&member).map(|info| info.address)
    }

    #[inline]
    pub fn is_failed(&self, member: MemberId) -> bool {
        self.failed.contains_key(&member)
    }

    /// The member holding the given role.
    pub fn role_holder(&self, role: &str) -> Option<MemberId> {
        self.roles.get(role).copied()
    }

    /// The roles held by the given member.
    pub fn roles_of(&self, member: MemberId) -> Vec<&str> {
        self.roles
            .iter()
            .filter(|(_, holder)| **holder == member)
            .map(|(role, _)| role.as_str())
            .collect()
    }

    /// The configured members as a topology.
    pub fn topology(&self) -> Topology<MemberInfo> {
        Topology::new(self.members.clone())
    }

    /// Applies an agreed operation, returning the resulting notifications in order.
    pub fn apply(&mut self, op: &ClusterOp) -> Vec<ClusterEvent> {
        self.version += 1;

        let mut events = Vec::new();
        match op {
            ClusterOp::Join { member, info } => {
                self.failed.remove(member);

                // A restarted process holds none of its previous roles.
                if self.members.contains_key(member) {
                    self.vacate_roles(*member, &mut events);
                }

                self.members.insert(*member, info.clone());
                events.push(ClusterEvent::Joined {
                    member: *member,
                    addr: info.address,
                });
            },
            ClusterOp::Leave { member } => {
                if self.members.contains_key(member) {
                    self.vacate_roles(*member, &mut events);
                }

                if let Some(info) = self.members.remove(member) {
                    events.push(ClusterEvent::Left {
                        member: *member,
                        addr: info.address,
                    });
                }
            },
            ClusterOp::Fail { member } => {
                if self.members.contains_key(member) {
                    self.vacate_roles(*member, &mut events);
                }

                if let Some(info) = self.members.remove(member) {
                    events.push(ClusterEvent::Failed {
                        member: *member,
                        addr: info.address,
                    });
                    self.failed.insert(*member, info);
                }
            },
            ClusterOp::Elect { role, member } => {
                let addr = match self.address_of(*member) {
                    None => return events,
                    Some(addr) => addr,
                };

                let previous = self.roles.insert(role.clone(), *member);
                match previous {
                    Some(previous) if previous == *member => {},
                    Some(previous) => {
                        if let Some(prev_addr) = self.address_of(previous) {
                            events.push(ClusterEvent::Unelected {
                                role: role.clone(),
                                member: previous,
                                addr: prev_addr,
                            });
                        }
                        events.push(ClusterEvent::Elected {
                            role: role.clone(),
                            member: *member,
                            addr,
                        });
                    },
                    None => {
                        events.push(ClusterEvent::Elected {
                            role: role.clone(),
                            member: *member,
                            addr,
                        });
                    },
                }
            },
        }

        events
    }

    fn vacate_roles(&mut self, member: MemberId, events: &mut Vec<ClusterEvent>) {
        let addr = match self.address_of(member) {
            None => return,
            Some(addr) => addr,
        };

        let held = self
            .roles_of(member)
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        for role in held {
            self.roles.remove(&role);
            events.push(ClusterEvent::Unelected { role, member, addr });
        }
    }
}

/// Derives the notifications for going from `old` to `new` directly.
///
/// This is used when a member adopts a configuration several versions ahead
/// of its own and can no longer replay the individual operations.
pub fn diff_events(
    old: &ClusterConfiguration,
    new: &ClusterConfiguration,
) -> Vec<ClusterEvent> {
    let mut events = Vec::new();

    let replaced = |member: &MemberId, info: &MemberInfo| {
        new.member(*member)
            .map(|current| current.address != info.address)
            .unwrap_or(true)
    };

    for (role, holder) in old.roles.iter() {
        let still_held = new.roles.get(role) == Some(holder)
            && old.address_of(*holder) == new.address_of(*holder);

        if !still_held {
            if let Some(addr) = old.address_of(*holder) {
                events.push(ClusterEvent::Unelected {
                    role: role.clone(),
                    member: *holder,
                    addr,
                });
            }
        }
    }

    for (member, info) in old.members.iter() {
        if !replaced(member, info) {
            continue;
        }

        if new.is_failed(*member) || new.contains(*member) {
            events.push(ClusterEvent::Failed {
                member: *member,
                addr: info.address,
            });
        } else {
            events.push(ClusterEvent::Left {
                member: *member,
                addr: info.address,
            });
        }
    }

    for (member, info) in new.members.iter() {
        let is_new = old
            .member(*member)
            .map(|previous| previous.address != info.address)
            .unwrap_or(true);

        if is_new {
            events.push(ClusterEvent::Joined {
                member: *member,
                addr: info.address,
            });
        }
    }

    for (role, holder) in new.roles.iter() {
        let newly_held = old.roles.get(role) != Some(holder)
            || old.address_of(*holder) != new.address_of(*holder);

        if newly_held {
            if let Some(addr) = new.address_of(*holder) {
                events.push(ClusterEvent::Elected {
                    role: role.clone(),
                    member: *holder,
                    addr,
                });
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LEADER_ROLE;

    fn info(port: u16) -> MemberInfo {
        MemberInfo::new(([127, 0, 0, 1], port).into(), "neo4j")
    }

    fn join(id: u64, port: u16) -> ClusterOp {
        ClusterOp::Join {
            member: MemberId::new(id),
            info: info(port),
        }
    }

    fn elect(id: u64) -> ClusterOp {
        ClusterOp::Elect {
            role: LEADER_ROLE.to_string(),
            member: MemberId::new(id),
        }
    }

    #[test]
    fn test_distinct_joins_produce_members() {
        let mut config = ClusterConfiguration::new("test");
        config.apply(&join(1, 1));
        config.apply(&join(2, 2));
        config.apply(&join(3, 3));

        assert_eq!(config.version(), 3);
        assert_eq!(
            config.members().keys().copied().collect::<Vec<_>>(),
            vec![MemberId::new(1), MemberId::new(2), MemberId::new(3)]
        );
        assert!(config.roles().is_empty());
    }

    #[test]
    fn test_elect_notifies_once_per_change() {
        let mut config = ClusterConfiguration::new("test");
        config.apply(&join(1, 1));
        config.apply(&join(2, 2));

        let events = config.apply(&elect(1));
        assert_eq!(
            events,
            vec![ClusterEvent::Elected {
                role: LEADER_ROLE.to_string(),
                member: MemberId::new(1),
                addr: info(1).address,
            }]
        );

        // Re-electing the same holder is not a change.
        assert!(config.apply(&elect(1)).is_empty());

        let events = config.apply(&elect(2));
        assert_eq!(
            events,
            vec![
                ClusterEvent::Unelected {
                    role: LEADER_ROLE.to_string(),
                    member: MemberId::new(1),
                    addr: info(1).address,
                },
                ClusterEvent::Elected {
                    role: LEADER_ROLE.to_string(),
                    member: MemberId::new(2),
                    addr: info(2).address,
                },
            ]
        );

        // Electing a non-member changes nothing.
        assert!(config.apply(&elect(9)).is_empty());
        assert_eq!(config.role_holder(LEADER_ROLE), Some(MemberId::new(2)));
    }

    #[test]
    fn test_fail_vacates_roles_and_leaves_tombstone() {
        let mut config = ClusterConfiguration::new("test");
        config.apply(&join(1, 1));
        config.apply(&join(2, 2));
        config.apply(&elect(2));

        let events = config.apply(&ClusterOp::Fail {
            member: MemberId::new(2),
        });
        assert_eq!(
            events,
            vec![
                ClusterEvent::Unelected {
                    role: LEADER_ROLE.to_string(),
                    member: MemberId::new(2),
                    addr: info(2).address,
                },
                ClusterEvent::Failed {
                    member: MemberId::new(2),
                    addr: info(2).address,
                },
            ]
        );
        assert!(!config.contains(MemberId::new(2)));
        assert!(config.is_failed(MemberId::new(2)));
        assert_eq!(config.role_holder(LEADER_ROLE), None);
    }

    #[test]
    fn test_replacement_inherits_no_roles() {
        let mut config = ClusterConfiguration::new("test");
        config.apply(&join(1, 1));
        config.apply(&join(2, 2));
        config.apply(&elect(2));
        config.apply(&ClusterOp::Fail {
            member: MemberId::new(2),
        });

        let events = config.apply(&join(2, 20));
        assert_eq!(
            events,
            vec![ClusterEvent::Joined {
                member: MemberId::new(2),
                addr: info(20).address,
            }]
        );
        assert!(!config.is_failed(MemberId::new(2)));
        assert!(config.roles_of(MemberId::new(2)).is_empty());
        assert_eq!(config.role_holder(LEADER_ROLE), None);
    }

    #[test]
    fn test_leave() {
        let mut config = ClusterConfiguration::new("test");
        config.apply(&join(1, 1));
        config.apply(&elect(1));

        let events = config.apply(&ClusterOp::Leave {
            member: MemberId::new(1),
        });
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ClusterEvent::Unelected { .. }));
        assert!(matches!(events[1], ClusterEvent::Left { .. }));
        assert!(config.members().is_empty());
        assert!(config.failed().is_empty());
        assert_eq!(config.version(), 3);
    }

    #[test]
    fn test_diff_events_after_gap() {
        let mut old = ClusterConfiguration::new("test");
        old.apply(&join(1, 1));
        old.apply(&join(2, 2));
        old.apply(&elect(2));

        let mut new = old.clone();
        new.apply(&ClusterOp::Fail {
            member: MemberId::new(2),
        });
        new.apply(&join(3, 3));
        new.apply(&elect(1));

        let events = diff_events(&old, &new);
        assert_eq!(
            events,
            vec![
                ClusterEvent::Unelected {
                    role: LEADER_ROLE.to_string(),
                    member: MemberId::new(2),
                    addr: info(2).address,
                },
                ClusterEvent::Failed {
                    member: MemberId::new(2),
                    addr: info(2).address,
                },
                ClusterEvent::Joined {
                    member: MemberId::new(3),
                    addr: info(3).address,
                },
                ClusterEvent::Elected {
                    role: LEADER_ROLE.to_string(),
                    member: MemberId::new(1),
                    addr: info(1).address,
                },
            ]
        );

        assert!(diff_events(&new, &new).is_empty());
    }
}
