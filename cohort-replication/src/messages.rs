use std::net::SocketAddr;

use cohort_context::{RequestContext, TxId};

use crate::storage::Transaction;

#[derive(Debug, Clone)]
/// A transaction forwarded to the leader along with its causal context.
pub struct CommitRequest {
    pub context: RequestContext,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Eq, PartialEq)]
/// The leader's answer to a [CommitRequest].
pub enum CommitReply {
    /// The transaction was applied.
    Applied { tx_id: TxId, checksum: u64 },
    /// The event was already applied, the original outcome is returned.
    Duplicate { tx_id: TxId, checksum: u64 },
    /// The session has moved past the context's view of it.
    Stale { observed: TxId, required: TxId },
    /// The event predates the session's latest event and was never applied.
    OutOfOrder { event: u64, latest_event: u64 },
    /// The member does not hold the leader role, the holder it knows of is included.
    NotLeader { leader: Option<SocketAddr> },
    /// The leader failed to apply the transaction.
    Failed { message: String },
}
