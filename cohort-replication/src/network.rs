use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::error::{NetworkError, ReplicationError};
use crate::messages::{CommitReply, CommitRequest};
use crate::service::LeaderCommitService;
use crate::storage::TransactionLog;

/// The capacity of each registered service's request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

type PendingCommit = (CommitRequest, oneshot::Sender<CommitReply>);

#[async_trait]
/// Carries commit requests to the member currently holding the leader role.
pub trait LeaderClient: Send + Sync + 'static {
    /// Sends the request to the commit service at `leader` and waits for its reply.
    async fn forward(
        &self,
        leader: SocketAddr,
        request: CommitRequest,
    ) -> Result<CommitReply, NetworkError>;
}

#[derive(Clone, Default)]
/// An in-memory network of commit services keyed by their node's public address.
pub struct CommitNetwork(Arc<CommitNetworkInner>);

impl Deref for CommitNetwork {
    type Target = CommitNetworkInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Default)]
pub struct CommitNetworkInner {
    services: RwLock<HashMap<SocketAddr, flume::Sender<PendingCommit>>>,
}

impl CommitNetworkInner {
    /// Registers a commit service, spawning the task serving its requests.
    pub fn register<L>(
        &self,
        addr: SocketAddr,
        service: Arc<LeaderCommitService<L>>,
    ) -> Result<(), ReplicationError>
    where
        L: TransactionLog,
    {
        let mut services = self.services.write();
        if let Some(existing) = services.get(&addr) {
            if !existing.is_disconnected() {
                return Err(ReplicationError::AddrInUse(addr));
            }
        }

        let (tx, rx) = flume::bounded(DEFAULT_QUEUE_CAPACITY);
        tokio::spawn(serve_commits(addr, service, rx));
        services.insert(addr, tx);

        debug!(addr = %addr, "Registered commit service.");

        Ok(())
    }

    /// Removes the commit service at the given address.
    ///
    /// Requests already queued are still answered.
    pub fn unregister(&self, addr: SocketAddr) {
        if self.services.write().remove(&addr).is_some() {
            debug!(addr = %addr, "Unregistered commit service.");
        }
    }

    pub fn is_registered(&self, addr: SocketAddr) -> bool {
        self.services.read().contains_key(&addr)
    }
}

#[async_trait]
impl LeaderClient for CommitNetwork {
    async fn forward(
        &self,
        leader: SocketAddr,
        request: CommitRequest,
    ) -> Result<CommitReply, NetworkError> {
        let tx = self
            .services
            .read()
            .get(&leader)
            .cloned()
            .ok_or(NetworkError::Unreachable(leader))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send_async((request, reply_tx))
            .await
            .map_err(|_| NetworkError::Unreachable(leader))?;

        reply_rx.await.map_err(|_| NetworkError::Dropped(leader))
    }
}

async fn serve_commits<L>(
    addr: SocketAddr,
    service: Arc<LeaderCommitService<L>>,
    requests: flume::Receiver<PendingCommit>,
) where
    L: TransactionLog,
{
    while let Ok((request, reply_tx)) = requests.recv_async().await {
        let reply = service.handle(request).await;
        let _ = reply_tx.send(reply);
    }

    debug!(addr = %addr, "Commit service has stopped.");
}

#[cfg(test)]
mod tests {
    use cohort_context::RequestContext;
    use cohort_node::MemberId;
    use tokio::sync::watch;

    use super::*;
    use crate::statistics::ReplicationStatistics;
    use crate::test_utils::{configuration_with_leader, MemTransactionLog};
    use crate::Transaction;

    fn service(addr: SocketAddr) -> Arc<LeaderCommitService<MemTransactionLog>> {
        let me = MemberId::new(1);
        let (_, rx) = watch::channel(configuration_with_leader(&[(me, addr)], Some(me)));
        Arc::new(LeaderCommitService::new(
            me,
            rx,
            Arc::new(MemTransactionLog::default()),
            ReplicationStatistics::default(),
        ))
    }

    #[tokio::test]
    async fn test_forward_to_registered_service() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let addr = test_helper::get_unused_addr();
        let network = CommitNetwork::default();
        let service = service(addr);
        network.register(addr, service.clone())?;
        assert!(network.is_registered(addr));

        let request = CommitRequest {
            context: RequestContext::new(1, 1, 1, 0, 0),
            transaction: Transaction::new(b"tx".to_vec()),
        };
        let reply = network.forward(addr, request).await?;
        assert!(matches!(reply, CommitReply::Applied { tx_id: 1, .. }));
        assert_eq!(service.log().len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_register_twice_is_rejected() -> anyhow::Result<()> {
        let addr = test_helper::get_unused_addr();
        let network = CommitNetwork::default();
        network.register(addr, service(addr))?;

        let err = network
            .register(addr, service(addr))
            .expect_err("Address should already be in use.");
        assert!(matches!(err, ReplicationError::AddrInUse(a) if a == addr));

        network.unregister(addr);
        assert!(!network.is_registered(addr));
        network.register(addr, service(addr))?;

        Ok(())
    }

    #[tokio::test]
    async fn test_forward_to_unknown_address() {
        let addr = test_helper::get_unused_addr();
        let network = CommitNetwork::default();

        let request = CommitRequest {
            context: RequestContext::new(1, 1, 1, 0, 0),
            transaction: Transaction::new(b"tx".to_vec()),
        };
        let err = network
            .forward(addr, request)
            .await
            .expect_err("Nothing is registered at the address.");
        assert!(matches!(err, NetworkError::Unreachable(a) if a == addr));
    }
}
