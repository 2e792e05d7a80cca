use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::membership::ClusterConfiguration;
use crate::{MemberId, MemberInfo};

#[derive(Debug, Clone, Eq, PartialEq)]
/// A change to the cluster configuration which must be agreed before it is applied.
pub enum ClusterOp {
    /// Admits a member, replacing any failed entry with the same id.
    Join { member: MemberId, info: MemberInfo },
    /// Removes a member which asked to leave.
    Leave { member: MemberId },
    /// Removes a member the cluster agreed has failed.
    Fail { member: MemberId },
    /// Assigns a role to a member.
    Elect { role: String, member: MemberId },
}

impl ClusterOp {
    /// The member the operation is about.
    pub fn member(&self) -> MemberId {
        match self {
            ClusterOp::Join { member, .. } => *member,
            ClusterOp::Leave { member } => *member,
            ClusterOp::Fail { member } => *member,
            ClusterOp::Elect { member, .. } => *member,
        }
    }
}

impl Display for ClusterOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterOp::Join { member, info } => {
                write!(f, "join({member}@{})", info.address)
            },
            ClusterOp::Leave { member } => write!(f, "leave({member})"),
            ClusterOp::Fail { member } => write!(f, "fail({member})"),
            ClusterOp::Elect { role, member } => write!(f, "elect({role}={member})"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// A request to agree on `op` as the operation producing configuration version `slot`.
pub struct Proposal {
    pub proposer: MemberId,
    pub slot: u64,
    pub round: u64,
    pub op: ClusterOp,
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// An acceptor's answer to a [Proposal].
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// Why an acceptor or coordinator refused an operation.
pub enum RejectReason {
    /// Another live member already holds the identity at a different address.
    DuplicateIdentity { existing: SocketAddr },
    /// The proposal is not for the next configuration version.
    StaleSlot { version: u64 },
    /// The acceptor has promised the slot to another round.
    Busy,
    /// The acceptor does not itself suspect the member being failed.
    NotSuspected,
    /// The operation targets a member which is not part of the configuration.
    NotAMember,
    /// The role is already held by another member.
    RoleOccupied { holder: MemberId },
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::DuplicateIdentity { existing } => {
                write!(f, "the identity is held by a live member at {existing}")
            },
            RejectReason::StaleSlot { version } => {
                write!(f, "the configuration is already at version {version}")
            },
            RejectReason::Busy => write!(f, "the slot is promised to another round"),
            RejectReason::NotSuspected => write!(f, "the member is not suspected"),
            RejectReason::NotAMember => write!(f, "the member is not part of the cluster"),
            RejectReason::RoleOccupied { holder } => {
                write!(f, "the role is held by member {holder}")
            },
        }
    }
}

#[derive(Debug, Clone)]
/// The messages exchanged between members by the membership protocol.
pub enum ClusterMessage {
    /// A process asks to be admitted to the cluster.
    JoinRequest { member: MemberId, info: MemberInfo },
    /// The join of the given member was refused.
    JoinDenied {
        member: MemberId,
        reason: RejectReason,
    },
    /// A member asks to be removed from the cluster.
    LeaveRequest { member: MemberId },
    /// The coordinator asks for votes on a proposal.
    Propose(Proposal),
    /// An acceptor's vote on a proposal.
    Vote {
        proposer: MemberId,
        slot: u64,
        round: u64,
        voter: MemberId,
        verdict: Verdict,
    },
    /// A proposal reached its quorum and produced the given configuration.
    Decided {
        configuration: Arc<ClusterConfiguration>,
        op: ClusterOp,
    },
    /// A liveness signal carrying the sender's configuration version.
    Heartbeat {
        member: MemberId,
        addr: SocketAddr,
        version: u64,
    },
    /// Asks for the current configuration if it is newer than `version`.
    SyncRequest { member: MemberId, version: u64 },
    /// A full copy of the sender's configuration.
    Sync {
        configuration: Arc<ClusterConfiguration>,
    },
    /// The sender of a heartbeat is not part of the receiver's configuration,
    /// which is attached.
    NotMember {
        configuration: Arc<ClusterConfiguration>,
    },
}

#[derive(Debug, Clone, PartialEq)]
/// A notification about the cluster delivered to subscribers.
///
/// Every member delivers the events of agreed changes in the order the
/// changes were agreed.
pub enum ClusterEvent {
    /// This member has been admitted to the cluster with the given configuration.
    EnteredCluster(Arc<ClusterConfiguration>),
    /// This member is no longer part of the cluster.
    LeftCluster,
    /// A member has been admitted.
    Joined { member: MemberId, addr: SocketAddr },
    /// A member has voluntarily left.
    Left { member: MemberId, addr: SocketAddr },
    /// The cluster agreed a member has failed and removed it.
    Failed { member: MemberId, addr: SocketAddr },
    /// A role has been assigned to a member.
    Elected {
        role: String,
        member: MemberId,
        addr: SocketAddr,
    },
    /// A member no longer holds a role.
    Unelected {
        role: String,
        member: MemberId,
        addr: SocketAddr,
    },
    /// The local failure detector suspects the member is down.
    Suspected { member: MemberId },
    /// A previously suspected member has sent a heartbeat again.
    Recovered { member: MemberId },
    /// The cluster refused to admit this member.
    JoinRejected { reason: RejectReason },
}
