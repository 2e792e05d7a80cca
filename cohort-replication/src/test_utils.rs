use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cohort_context::TxId;
use cohort_node::membership::ClusterOp;
use cohort_node::{ClusterConfiguration, MemberId, MemberInfo, LEADER_ROLE};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::storage::{AppliedTransaction, Transaction, TransactionLog};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct MemLogError(pub String);

#[derive(Debug)]
struct Entry {
    transaction: Transaction,
    checksum: u64,
}

#[derive(Debug, Default)]
/// A transaction log held in memory.
///
/// The checksum of each transaction chains the previous checksum with the
/// transaction's payload.
pub struct MemTransactionLog {
    entries: RwLock<Vec<Entry>>,
    failure: Mutex<Option<String>>,
}

impl MemTransactionLog {
    /// Creates a log which already holds `n` transactions.
    pub fn with_transactions(n: u64) -> Self {
        let log = Self::default();
        {
            let mut entries = log.entries.write();
            for tx_id in 1..=n {
                append(&mut entries, Transaction::new(tx_id.to_le_bytes().to_vec()));
            }
        }
        log
    }

    /// Makes the next application fail with the given message.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.failure.lock() = Some(message.into());
    }

    /// The number of transactions in the log.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The checksum at the given transaction.
    pub fn checksum_at(&self, tx_id: TxId) -> Option<u64> {
        if tx_id == 0 {
            return Some(0);
        }

        self.entries
            .read()
            .get(tx_id as usize - 1)
            .map(|entry| entry.checksum)
    }

    /// The transaction with the given id.
    pub fn get(&self, tx_id: TxId) -> Option<Transaction> {
        if tx_id == 0 {
            return None;
        }

        self.entries
            .read()
            .get(tx_id as usize - 1)
            .map(|entry| entry.transaction.clone())
    }
}

fn append(entries: &mut Vec<Entry>, transaction: Transaction) -> AppliedTransaction {
    let previous = entries.last().map(|entry| entry.checksum).unwrap_or(0);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&previous.to_le_bytes());
    hasher.update(transaction.payload());
    let checksum = hasher.finalize() as u64;

    entries.push(Entry {
        transaction,
        checksum,
    });

    AppliedTransaction {
        tx_id: entries.len() as TxId,
        checksum,
    }
}

#[async_trait]
impl TransactionLog for MemTransactionLog {
    type Error = MemLogError;

    async fn last_applied(&self) -> Result<TxId, Self::Error> {
        Ok(self.entries.read().len() as TxId)
    }

    async fn checksum_of(&self, tx_id: TxId) -> Result<Option<u64>, Self::Error> {
        Ok(self.checksum_at(tx_id))
    }

    async fn apply_transaction(
        &self,
        transaction: &Transaction,
    ) -> Result<AppliedTransaction, Self::Error> {
        if let Some(message) = self.failure.lock().take() {
            return Err(MemLogError(message));
        }

        Ok(append(&mut self.entries.write(), transaction.clone()))
    }
}

/// Builds a configuration of the given members with `leader` holding the leader role.
pub fn configuration_with_leader(
    members: &[(MemberId, SocketAddr)],
    leader: Option<MemberId>,
) -> Arc<ClusterConfiguration> {
    let mut config = ClusterConfiguration::new("test-cluster");
    for (member, addr) in members {
        config.apply(&ClusterOp::Join {
            member: *member,
            info: MemberInfo::new(*addr, "default"),
        });
    }

    if let Some(leader) = leader {
        config.apply(&ClusterOp::Elect {
            role: LEADER_ROLE.to_string(),
            member: leader,
        });
    }

    Arc::new(config)
}
