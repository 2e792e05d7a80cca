use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use cohort_context::TxId;
use thiserror::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// Why the leader refused a context.
pub enum Conflict {
    /// The session's own writes have advanced past what the caller observed.
    Stale { observed: TxId, required: TxId },
    /// The event is older than the session's latest event and was never applied.
    OutOfOrder { event: u64, latest_event: u64 },
}

impl Display for Conflict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stale { observed, required } => write!(
                f,
                "the context observed tx {observed} but the session has committed tx {required}"
            ),
            Self::OutOfOrder {
                event,
                latest_event,
            } => write!(
                f,
                "event {event} predates the session's latest event {latest_event}"
            ),
        }
    }
}

#[derive(Debug, Error)]
/// A failure to commit a transaction through the leader.
pub enum CommitError {
    #[error("Transient failure committing transaction: {0}")]
    /// The leader could not be reached or is no longer the leader.
    ///
    /// The request was not applied, or was applied and will be recognised
    /// as a duplicate, so it is safe to retry with the same context.
    Transient(String),

    #[error("Commit conflicts with the session's history: {0}")]
    /// The context was rejected, the caller must refresh its view and retry
    /// with a new context.
    Conflict(Conflict),

    #[error("{0}")]
    /// The leader failed to apply the transaction, the message is the leader's own.
    Fatal(String),
}

impl CommitError {
    /// Returns if the same request may be resubmitted as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns if the request must be resubmitted with a new context.
    pub fn requires_new_context(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Debug, Error)]
/// A failure to deliver a commit request to the leader.
pub enum NetworkError {
    #[error("No commit service is reachable at {0}.")]
    Unreachable(SocketAddr),

    #[error("The commit service at {0} dropped the request.")]
    Dropped(SocketAddr),
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("A commit service is already registered at {0}.")]
    /// Another node's commit service is registered under the same address.
    AddrInUse(SocketAddr),
}
