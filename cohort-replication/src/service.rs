use std::sync::Arc;

use cohort_context::{Admission, RequestContext, SessionRegistry, DEFAULT_OUTCOME_WINDOW};
use cohort_node::{ClusterConfiguration, MemberId, LEADER_ROLE};
use tokio::sync::{watch, Mutex};

use crate::messages::{CommitReply, CommitRequest};
use crate::statistics::{ReplicationStatistics, ReplicationStatisticsInner};
use crate::storage::TransactionLog;

/// Applies forwarded transactions while the node holds the leader role.
///
/// Commits are serialised, the session registry stays locked from admitting
/// a request until its outcome is recorded.
pub struct LeaderCommitService<L> {
    me: MemberId,
    configuration: watch::Receiver<Arc<ClusterConfiguration>>,
    log: Arc<L>,
    sessions: Mutex<SessionRegistry>,
    statistics: ReplicationStatistics,
}

impl<L> LeaderCommitService<L>
where
    L: TransactionLog,
{
    pub fn new(
        me: MemberId,
        configuration: watch::Receiver<Arc<ClusterConfiguration>>,
        log: Arc<L>,
        statistics: ReplicationStatistics,
    ) -> Self {
        Self {
            me,
            configuration,
            log,
            sessions: Mutex::new(SessionRegistry::default()),
            statistics,
        }
    }

    /// Bounds the number of sessions the leader remembers.
    pub fn with_session_limit(mut self, max_sessions: usize) -> Self {
        self.sessions = Mutex::new(SessionRegistry::with_limits(
            DEFAULT_OUTCOME_WINDOW,
            max_sessions,
        ));
        self
    }

    #[inline]
    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    /// Returns if the node currently holds the leader role.
    pub fn is_leader(&self) -> bool {
        self.configuration.borrow().role_holder(LEADER_ROLE) == Some(self.me)
    }

    /// The last transaction the leader applied on behalf of the context's session.
    pub async fn last_committed(&self, context: &RequestContext) -> Option<u64> {
        self.sessions
            .lock()
            .await
            .last_committed(&context.session_key())
    }

    /// The number of sessions the leader currently remembers.
    pub async fn num_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Handles a forwarded commit.
    pub async fn handle(&self, request: CommitRequest) -> CommitReply {
        let CommitRequest {
            context,
            transaction,
        } = request;

        let mut sessions = self.sessions.lock().await;

        if !self.is_leader() {
            let leader = {
                let config = self.configuration.borrow();
                config
                    .role_holder(LEADER_ROLE)
                    .and_then(|leader| config.address_of(leader))
            };
            debug!(
                member_id = %self.me,
                leader = ?leader,
                "Refusing commit while not the leader."
            );
            return CommitReply::NotLeader { leader };
        }

        match sessions.admit(&context) {
            Admission::Fresh => {},
            Admission::Duplicate { tx_id, checksum } => {
                debug!(
                    member_id = %self.me,
                    context = %context,
                    tx_id = tx_id,
                    "Commit is a retry of an applied event."
                );
                ReplicationStatisticsInner::incr(&self.statistics.num_duplicates);
                return CommitReply::Duplicate { tx_id, checksum };
            },
            Admission::Stale { observed, required } => {
                debug!(
                    member_id = %self.me,
                    context = %context,
                    observed = observed,
                    required = required,
                    "Rejecting stale commit context."
                );
                return CommitReply::Stale { observed, required };
            },
            Admission::OutOfOrder {
                event,
                latest_event,
            } => {
                debug!(
                    member_id = %self.me,
                    context = %context,
                    latest_event = latest_event,
                    "Rejecting out of order commit context."
                );
                return CommitReply::OutOfOrder {
                    event,
                    latest_event,
                };
            },
        }

        if let Err(message) = self.verify_history(&context).await {
            warn!(
                member_id = %self.me,
                context = %context,
                error = %message,
                "Commit context does not match the leader's log."
            );
            return CommitReply::Failed { message };
        }

        match self.log.apply_transaction(&transaction).await {
            Ok(applied) => {
                if let Some(evicted) = sessions.record(&context, applied.tx_id, applied.checksum) {
                    debug!(
                        member_id = %self.me,
                        session_id = evicted.session_id,
                        machine_id = evicted.machine_id,
                        "Evicted least recently used session."
                    );
                }
                ReplicationStatisticsInner::incr(&self.statistics.num_applied);

                trace!(
                    member_id = %self.me,
                    context = %context,
                    tx_id = applied.tx_id,
                    "Applied transaction."
                );

                CommitReply::Applied {
                    tx_id: applied.tx_id,
                    checksum: applied.checksum,
                }
            },
            Err(e) => {
                error!(
                    member_id = %self.me,
                    context = %context,
                    error = ?e,
                    "Failed to apply transaction."
                );
                CommitReply::Failed {
                    message: e.to_string(),
                }
            },
        }
    }

    /// Checks the context was built from the same history as the leader's log.
    async fn verify_history(&self, context: &RequestContext) -> Result<(), String> {
        let observed = context.last_applied_tx_id();

        let last_applied = self.log.last_applied().await.map_err(|e| e.to_string())?;
        if observed > last_applied {
            return Err(format!(
                "the context observed tx {observed} but the leader's log ends at tx {last_applied}"
            ));
        }

        match self.log.checksum_of(observed).await.map_err(|e| e.to_string())? {
            Some(checksum) if checksum != context.checksum() => Err(format!(
                "checksum mismatch at tx {observed}, expected {checksum:x} got {:x}",
                context.checksum()
            )),
            _ => Ok(()),
        }
    }
}
