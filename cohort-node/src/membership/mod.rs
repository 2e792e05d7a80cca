//! The agreed membership of the cluster.
//!
//! [Membership] is a pure state machine, it is driven by the node's executor
//! task which owns the transport and the timers.

mod configuration;
mod messages;
mod state_machine;

pub use configuration::{diff_events, ClusterConfiguration};
pub use messages::{
    ClusterEvent,
    ClusterMessage,
    ClusterOp,
    Proposal,
    RejectReason,
    Verdict,
};
pub use state_machine::{Membership, Output};
