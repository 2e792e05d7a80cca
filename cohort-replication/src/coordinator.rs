use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cohort_context::{ContextTracker, RequestContext, TxId};
use cohort_node::{ClusterConfiguration, LEADER_ROLE};
use tokio::sync::watch;

use crate::error::{CommitError, Conflict};
use crate::messages::{CommitReply, CommitRequest};
use crate::network::LeaderClient;
use crate::statistics::{ReplicationStatistics, ReplicationStatisticsInner};
use crate::storage::Transaction;

/// The default time to wait for the leader to answer a commit.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = if cfg!(test) {
    Duration::from_secs(2)
} else {
    Duration::from_secs(10)
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// A transaction the leader has committed.
pub struct CommitOutcome {
    /// The id the leader's log assigned to the transaction.
    pub tx_id: TxId,
    /// The checksum of the leader's log at the transaction.
    pub checksum: u64,
    /// The context the transaction was committed with.
    pub context: RequestContext,
    /// If the leader had already applied the event before this request.
    pub duplicate: bool,
}

/// Commits the transactions of a single session through the current leader.
///
/// Transactions are never applied locally, even when the node itself holds
/// the leader role the request takes the same path as from any other member.
/// Failures are reported to the caller which decides whether to retry.
pub struct CommitCoordinator<C> {
    tracker: ContextTracker,
    configuration: watch::Receiver<Arc<ClusterConfiguration>>,
    client: C,
    timeout: Duration,
    statistics: ReplicationStatistics,
}

impl<C> CommitCoordinator<C>
where
    C: LeaderClient,
{
    pub fn new(
        tracker: ContextTracker,
        configuration: watch::Receiver<Arc<ClusterConfiguration>>,
        client: C,
        statistics: ReplicationStatistics,
    ) -> Self {
        Self {
            tracker,
            configuration,
            client,
            timeout: DEFAULT_COMMIT_TIMEOUT,
            statistics,
        }
    }

    /// Set a custom time to wait for the leader's answer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    /// The tracker allocating this session's contexts.
    pub fn tracker(&self) -> &ContextTracker {
        &self.tracker
    }

    /// The address of the member currently holding the leader role.
    pub fn leader_addr(&self) -> Option<SocketAddr> {
        let config = self.configuration.borrow();
        config
            .role_holder(LEADER_ROLE)
            .and_then(|leader| config.address_of(leader))
    }

    /// Commits the transaction with a newly allocated context.
    pub async fn commit(
        &self,
        transaction: Transaction,
    ) -> Result<CommitOutcome, CommitError> {
        let context = self.tracker.new_context();
        self.commit_with_context(context, transaction).await
    }

    /// Commits the transaction with an explicit context.
    ///
    /// Resubmitting the context of a commit which failed with a transient
    /// error lets the leader recognise the retry if it had applied the
    /// original request.
    pub async fn commit_with_context(
        &self,
        context: RequestContext,
        transaction: Transaction,
    ) -> Result<CommitOutcome, CommitError> {
        let result = self.forward(context, transaction).await;

        let stats = &self.statistics;
        match &result {
            Ok(_) => {},
            Err(CommitError::Transient(_)) => {
                ReplicationStatisticsInner::incr(&stats.num_transient_failures)
            },
            Err(CommitError::Conflict(_)) => {
                ReplicationStatisticsInner::incr(&stats.num_conflicts)
            },
            Err(CommitError::Fatal(_)) => {
                ReplicationStatisticsInner::incr(&stats.num_fatal_failures)
            },
        }

        if let Err(e) = &result {
            warn!(
                context = %context,
                retryable = e.is_retryable(),
                error = %e,
                "Failed to commit transaction."
            );
        }

        result
    }

    async fn forward(
        &self,
        context: RequestContext,
        transaction: Transaction,
    ) -> Result<CommitOutcome, CommitError> {
        let leader = self.leader_addr().ok_or_else(|| {
            CommitError::Transient("no member holds the leader role".to_string())
        })?;

        let request = CommitRequest {
            context,
            transaction,
        };

        ReplicationStatisticsInner::incr(&self.statistics.num_forwarded);
        let reply =
            match tokio::time::timeout(self.timeout, self.client.forward(leader, request))
                .await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => return Err(CommitError::Transient(e.to_string())),
                Err(_) => {
                    return Err(CommitError::Transient(format!(
                        "the leader at {leader} did not answer within {:?}",
                        self.timeout
                    )))
                },
            };

        match reply {
            CommitReply::Applied { tx_id, checksum } => {
                self.tracker.observe(tx_id, checksum);
                Ok(CommitOutcome {
                    tx_id,
                    checksum,
                    context,
                    duplicate: false,
                })
            },
            CommitReply::Duplicate { tx_id, checksum } => {
                self.tracker.observe(tx_id, checksum);
                Ok(CommitOutcome {
                    tx_id,
                    checksum,
                    context,
                    duplicate: true,
                })
            },
            CommitReply::Stale { observed, required } => {
                Err(CommitError::Conflict(Conflict::Stale { observed, required }))
            },
            CommitReply::OutOfOrder {
                event,
                latest_event,
            } => Err(CommitError::Conflict(Conflict::OutOfOrder {
                event,
                latest_event,
            })),
            CommitReply::NotLeader { leader: current } => {
                Err(CommitError::Transient(match current {
                    Some(current) => format!(
                        "the member at {leader} is no longer the leader, the leader is at {current}"
                    ),
                    None => format!("the member at {leader} is no longer the leader"),
                }))
            },
            CommitReply::Failed { message } => Err(CommitError::Fatal(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cohort_node::MemberId;

    use super::*;
    use crate::error::NetworkError;
    use crate::service::LeaderCommitService;
    use crate::test_utils::{configuration_with_leader, MemTransactionLog};
    use crate::CommitNetwork;

    const LEADER: MemberId = MemberId::new(1);

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn configuration(
        leader: Option<MemberId>,
    ) -> (
        watch::Sender<Arc<ClusterConfiguration>>,
        watch::Receiver<Arc<ClusterConfiguration>>,
    ) {
        watch::channel(configuration_with_leader(&[(LEADER, addr(7001))], leader))
    }

    /// Hands requests straight to a local service.
    struct Direct(Arc<LeaderCommitService<MemTransactionLog>>);

    #[async_trait]
    impl LeaderClient for Direct {
        async fn forward(
            &self,
            _leader: SocketAddr,
            request: CommitRequest,
        ) -> Result<CommitReply, NetworkError> {
            Ok(self.0.handle(request).await)
        }
    }

    /// Never answers.
    struct Unresponsive;

    #[async_trait]
    impl LeaderClient for Unresponsive {
        async fn forward(
            &self,
            leader: SocketAddr,
            _request: CommitRequest,
        ) -> Result<CommitReply, NetworkError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(NetworkError::Dropped(leader))
        }
    }

    fn coordinator(
        session_id: u64,
        log: MemTransactionLog,
    ) -> (
        CommitCoordinator<Direct>,
        Arc<LeaderCommitService<MemTransactionLog>>,
    ) {
        // Receivers keep the last configuration once the sender is gone.
        let (_, config_rx) = configuration(Some(LEADER));

        let statistics = ReplicationStatistics::default();
        let service = Arc::new(LeaderCommitService::new(
            LEADER,
            config_rx.clone(),
            Arc::new(log),
            statistics.clone(),
        ));
        let coordinator = CommitCoordinator::new(
            ContextTracker::new(session_id, 2),
            config_rx,
            Direct(service.clone()),
            statistics,
        );
        (coordinator, service)
    }

    #[tokio::test]
    async fn test_commit_observes_applied_tx() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let (coordinator, service) = coordinator(1, MemTransactionLog::default());

        let first = coordinator.commit(Transaction::new(b"tx-1".to_vec())).await?;
        assert_eq!(first.tx_id, 1);
        assert!(!first.duplicate);
        assert_eq!(first.context.event_identifier(), 1);
        assert_eq!(coordinator.tracker().last_observed(), 1);

        let second = coordinator.commit(Transaction::new(b"tx-2".to_vec())).await?;
        assert_eq!(second.tx_id, 2);
        assert_eq!(second.context.last_applied_tx_id(), 1);
        assert_eq!(second.context.checksum(), first.checksum);
        assert_eq!(service.log().len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_retry_with_same_context_is_duplicate() -> anyhow::Result<()> {
        let (coordinator, service) = coordinator(1, MemTransactionLog::default());

        let context = coordinator.tracker().new_context();
        let applied = coordinator
            .commit_with_context(context, Transaction::new(b"tx".to_vec()))
            .await?;
        let retried = coordinator
            .commit_with_context(context, Transaction::new(b"tx".to_vec()))
            .await?;

        assert!(retried.duplicate);
        assert_eq!(retried.tx_id, applied.tx_id);
        assert_eq!(service.log().len(), 1);
        assert_eq!(coordinator.statistics.num_duplicates(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_stale_context_is_conflict() -> anyhow::Result<()> {
        let (coordinator, _service) = coordinator(1, MemTransactionLog::default());

        let outdated = coordinator.tracker().new_context();
        coordinator.commit(Transaction::new(b"tx-1".to_vec())).await?;

        // The first context was never used, but it predates the session's last commit.
        let err = coordinator
            .commit_with_context(outdated, Transaction::new(b"tx-2".to_vec()))
            .await
            .expect_err("Outdated context should be rejected.");
        assert!(err.requires_new_context());
        assert!(!err.is_retryable());
        assert!(matches!(
            err,
            CommitError::Conflict(Conflict::OutOfOrder {
                event: 1,
                latest_event: 2
            })
        ));

        let stale = RequestContext::new(1, 2, 10, 0, 0);
        let err = coordinator
            .commit_with_context(stale, Transaction::new(b"tx-2".to_vec()))
            .await
            .expect_err("Stale context should be rejected.");
        assert!(matches!(
            err,
            CommitError::Conflict(Conflict::Stale {
                observed: 0,
                required: 1
            })
        ));
        assert_eq!(coordinator.statistics.num_conflicts(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn test_application_error_is_fatal_and_verbatim() {
        let (coordinator, service) = coordinator(1, MemTransactionLog::default());
        service.log().fail_next("disk full");

        let err = coordinator
            .commit(Transaction::new(b"tx".to_vec()))
            .await
            .expect_err("Commit should fail.");
        assert!(matches!(&err, CommitError::Fatal(message) if message == "disk full"));
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_no_leader_is_transient() {
        let (_config, config_rx) = configuration(None);
        let coordinator = CommitCoordinator::new(
            ContextTracker::new(1, 2),
            config_rx,
            CommitNetwork::default(),
            ReplicationStatistics::default(),
        );

        assert_eq!(coordinator.leader_addr(), None);
        let err = coordinator
            .commit(Transaction::new(b"tx".to_vec()))
            .await
            .expect_err("Commit should fail without a leader.");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_leader_is_transient() {
        let (_config, config_rx) = configuration(Some(LEADER));
        let coordinator = CommitCoordinator::new(
            ContextTracker::new(1, 2),
            config_rx,
            CommitNetwork::default(),
            ReplicationStatistics::default(),
        );

        let err = coordinator
            .commit(Transaction::new(b"tx".to_vec()))
            .await
            .expect_err("Commit should fail when the leader is unreachable.");
        assert!(err.is_retryable(), "{err:?}");
        assert_eq!(coordinator.statistics.num_transient_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient() {
        let (_config, config_rx) = configuration(Some(LEADER));
        let coordinator = CommitCoordinator::new(
            ContextTracker::new(1, 2),
            config_rx,
            Unresponsive,
            ReplicationStatistics::default(),
        )
        .with_timeout(Duration::from_millis(500));

        let err = coordinator
            .commit(Transaction::new(b"tx".to_vec()))
            .await
            .expect_err("Commit should time out.");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("did not answer"), "{err}");
    }

    #[tokio::test]
    async fn test_not_leader_is_transient() {
        let (_config, config_rx) = configuration(Some(LEADER));
        let service = Arc::new(LeaderCommitService::new(
            MemberId::new(2),
            config_rx.clone(),
            Arc::new(MemTransactionLog::default()),
            ReplicationStatistics::default(),
        ));
        let coordinator = CommitCoordinator::new(
            ContextTracker::new(1, 2),
            config_rx,
            Direct(service.clone()),
            ReplicationStatistics::default(),
        );

        let err = coordinator
            .commit(Transaction::new(b"tx".to_vec()))
            .await
            .expect_err("A follower must not apply commits.");
        assert!(err.is_retryable());
        assert!(service.log().is_empty());
    }
}
