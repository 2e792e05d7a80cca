use std::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use cohort_context::TxId;

#[derive(Debug, Clone, Eq, PartialEq)]
/// A transaction to be replicated.
///
/// The payload is opaque to the replication layer, it is handed to the
/// [TransactionLog] of the leader as is.
pub struct Transaction {
    payload: Bytes,
}

impl Transaction {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The position a transaction was applied at.
pub struct AppliedTransaction {
    /// The id the log assigned to the transaction.
    pub tx_id: TxId,
    /// The checksum of the log up to and including the transaction.
    pub checksum: u64,
}

#[async_trait]
/// The transaction log of a member.
///
/// Only the leader applies transactions through the replication layer,
/// tx ids must increase with every applied transaction.
pub trait TransactionLog: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    /// The id of the last transaction applied to the log, `0` if it is empty.
    async fn last_applied(&self) -> Result<TxId, Self::Error>;

    /// The checksum of the log at the given transaction.
    ///
    /// `None` is returned if the log does not know the transaction, either
    /// because it has not been applied yet or because it has been pruned.
    async fn checksum_of(&self, tx_id: TxId) -> Result<Option<u64>, Self::Error>;

    /// Appends the transaction to the log.
    async fn apply_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<AppliedTransaction, Self::Error>;
}
