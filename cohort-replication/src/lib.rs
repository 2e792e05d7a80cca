//! # Cohort Replication
//!
//! Master-slave transaction replication on top of a cohort cluster.
//!
//! Every member forwards its writes, together with the session's causal
//! context, to the member holding the leader role. The leader serialises
//! the commits, recognises retries of writes it has already applied and
//! rejects writes built on an outdated view of their own session.
//!
//! ```rust,no_run
//! use cohort_node::{ChannelTransport, CohortNodeBuilder, ConnectionConfig, MemberId};
//! use cohort_replication::test_utils::MemTransactionLog;
//! use cohort_replication::{CommitNetwork, ReplicationExtension, Transaction};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let transport = ChannelTransport::default();
//! let addr = "127.0.0.1:7000".parse()?;
//! let node = CohortNodeBuilder::new(MemberId::new(1), ConnectionConfig::new(addr, addr, [addr]))
//!     .connect(&transport)
//!     .await?;
//!
//! let replication = node
//!     .add_extension(ReplicationExtension::new(
//!         MemTransactionLog::default(),
//!         CommitNetwork::default(),
//!     ))
//!     .await?;
//!
//! let session = replication.session(1);
//! let outcome = session.commit(Transaction::new(b"CREATE (n)".to_vec())).await?;
//! println!("Committed as tx {}", outcome.tx_id);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

mod coordinator;
mod error;
mod messages;
mod network;
mod service;
mod statistics;
mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cohort_context::{ContextTracker, TxId};
use cohort_node::{ClusterExtension, CohortHandle, CohortNode};
pub use coordinator::{CommitCoordinator, CommitOutcome, DEFAULT_COMMIT_TIMEOUT};
pub use error::{CommitError, Conflict, NetworkError, ReplicationError};
pub use messages::{CommitReply, CommitRequest};
pub use network::{CommitNetwork, CommitNetworkInner, LeaderClient, DEFAULT_QUEUE_CAPACITY};
pub use service::LeaderCommitService;
pub use statistics::ReplicationStatistics;
pub use storage::{AppliedTransaction, Transaction, TransactionLog};

/// Installs the commit path on a node.
pub struct ReplicationExtension<L> {
    log: L,
    network: CommitNetwork,
    commit_timeout: Duration,
}

impl<L> ReplicationExtension<L>
where
    L: TransactionLog,
{
    /// Creates a new extension applying leader commits to the given log.
    pub fn new(log: L, network: CommitNetwork) -> Self {
        Self {
            log,
            network,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }

    /// Set a custom time sessions wait for the leader's answer.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }
}

#[async_trait]
impl<L> ClusterExtension for ReplicationExtension<L>
where
    L: TransactionLog,
{
    type Output = Replication<L>;
    type Error = ReplicationError;

    async fn init_extension(
        self,
        node: &CohortNode,
    ) -> Result<Self::Output, Self::Error> {
        let statistics = ReplicationStatistics::default();
        let service = Arc::new(LeaderCommitService::new(
            node.me(),
            node.configuration_watcher(),
            Arc::new(self.log),
            statistics.clone(),
        ));

        self.network.register(node.public_addr(), service.clone())?;

        info!(
            member_id = %node.me(),
            public_addr = %node.public_addr(),
            "Replication commit service started."
        );

        Ok(Replication {
            node: node.handle(),
            service,
            network: self.network,
            commit_timeout: self.commit_timeout,
            statistics,
        })
    }
}

/// The commit path of a node.
///
/// Dropping it removes the node's commit service from the network.
pub struct Replication<L>
where
    L: TransactionLog,
{
    node: CohortHandle,
    service: Arc<LeaderCommitService<L>>,
    network: CommitNetwork,
    commit_timeout: Duration,
    statistics: ReplicationStatistics,
}

impl<L> Replication<L>
where
    L: TransactionLog,
{
    /// Opens a session which has not observed any transaction yet.
    pub fn session(&self, session_id: u64) -> CommitCoordinator<CommitNetwork> {
        self.session_from(session_id, 0, 0)
    }

    /// Opens a session which has already observed the given transaction.
    pub fn session_from(
        &self,
        session_id: u64,
        last_applied_tx_id: TxId,
        checksum: u64,
    ) -> CommitCoordinator<CommitNetwork> {
        let tracker = ContextTracker::starting_from(
            session_id,
            self.node.me().get(),
            last_applied_tx_id,
            checksum,
        );

        CommitCoordinator::new(
            tracker,
            self.node.configuration_watcher(),
            self.network.clone(),
            self.statistics.clone(),
        )
        .with_timeout(self.commit_timeout)
    }

    #[inline]
    /// The node's leader-side commit service.
    pub fn service(&self) -> &Arc<LeaderCommitService<L>> {
        &self.service
    }

    #[inline]
    /// Gets the live replication statistics.
    pub fn statistics(&self) -> &ReplicationStatistics {
        &self.statistics
    }
}

impl<L> Drop for Replication<L>
where
    L: TransactionLog,
{
    fn drop(&mut self) {
        self.network.unregister(self.node.public_addr());
    }
}
