//! Persistent store contract and in-memory implementation
//!
//! Every mutation path, sweep-driven or request-driven, goes through the same
//! commit methods. A commit carries the version the caller loaded; if the
//! stored record has moved on, the commit fails with a Conflict and the
//! caller re-reads instead of corrupting state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::models::{Dispute, DisputeStatus, Transaction, TransactionStatus, User};
use crate::EscrowResult;

/// Storage contract consumed by the engines.
///
/// The persistence technology is a collaborator choice; the engines only
/// rely on these semantics: point reads, status-scoped scans, and
/// version-checked commits that serialize concurrent read-modify-write on a
/// single record.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn insert_transaction(&self, tx: Transaction) -> EscrowResult<()>;
    async fn transaction(&self, id: Uuid) -> EscrowResult<Option<Transaction>>;
    /// Commit a modified transaction. Fails with Conflict unless the stored
    /// version still matches `tx.version`; bumps the version on success.
    async fn commit_transaction(&self, tx: Transaction) -> EscrowResult<Transaction>;
    /// Payment-pending transactions created after `cutoff` (lookback window)
    async fn transactions_pending_payment(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EscrowResult<Vec<Transaction>>;
    /// In-escrow transactions whose payment arrived before `cutoff`
    async fn transactions_due_for_release(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EscrowResult<Vec<Transaction>>;
    async fn all_transactions(&self) -> EscrowResult<Vec<Transaction>>;

    /// Insert a dispute; fails if the transaction already has one
    async fn insert_dispute(&self, dispute: Dispute) -> EscrowResult<()>;
    async fn dispute(&self, id: Uuid) -> EscrowResult<Option<Dispute>>;
    async fn dispute_for_transaction(&self, transaction_id: Uuid) -> EscrowResult<Option<Dispute>>;
    /// Commit a modified dispute with the same version-check semantics as
    /// [`EscrowStore::commit_transaction`]
    async fn commit_dispute(&self, dispute: Dispute) -> EscrowResult<Dispute>;
    /// Open disputes created before `cutoff` (auto-resolution candidates)
    async fn open_disputes_before(&self, cutoff: DateTime<Utc>) -> EscrowResult<Vec<Dispute>>;
    async fn all_disputes(&self) -> EscrowResult<Vec<Dispute>>;
    /// Remove a dispute again; rollback path for a lost create race
    async fn remove_dispute(&self, id: Uuid) -> EscrowResult<()>;

    async fn user(&self, id: Uuid) -> EscrowResult<Option<User>>;
    async fn upsert_user(&self, user: User) -> EscrowResult<()>;
}

/// In-memory store used by tests and single-process deployments
#[derive(Default)]
pub struct MemoryStore {
    transactions: Arc<RwLock<HashMap<Uuid, Transaction>>>,
    disputes: Arc<RwLock<HashMap<Uuid, Dispute>>>,
    users: Arc<RwLock<HashMap<Uuid, User>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn insert_transaction(&self, tx: Transaction) -> EscrowResult<()> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.id) {
            return Err(EscrowError::conflict(format!(
                "transaction {} already exists",
                tx.id
            )));
        }
        transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn transaction(&self, id: Uuid) -> EscrowResult<Option<Transaction>> {
        Ok(self.transactions.read().await.get(&id).cloned())
    }

    async fn commit_transaction(&self, mut tx: Transaction) -> EscrowResult<Transaction> {
        let mut transactions = self.transactions.write().await;
        let stored = transactions.get(&tx.id).ok_or_else(|| {
            EscrowError::not_found(format!("transaction {} not found", tx.id))
        })?;
        if stored.version != tx.version {
            return Err(EscrowError::conflict(format!(
                "transaction {} was modified concurrently",
                tx.id
            )));
        }
        tx.version += 1;
        transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn transactions_pending_payment(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EscrowResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| tx.status == TransactionStatus::PaymentPending && tx.created_at > cutoff)
            .cloned()
            .collect())
    }

    async fn transactions_due_for_release(
        &self,
        cutoff: DateTime<Utc>,
    ) -> EscrowResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| {
                tx.status == TransactionStatus::InEscrow
                    && tx.payment_received_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn all_transactions(&self) -> EscrowResult<Vec<Transaction>> {
        Ok(self.transactions.read().await.values().cloned().collect())
    }

    async fn insert_dispute(&self, dispute: Dispute) -> EscrowResult<()> {
        let mut disputes = self.disputes.write().await;
        if disputes
            .values()
            .any(|d| d.transaction_id == dispute.transaction_id)
        {
            return Err(EscrowError::validation(
                "Dispute already exists for this transaction",
            ));
        }
        disputes.insert(dispute.id, dispute);
        Ok(())
    }

    async fn dispute(&self, id: Uuid) -> EscrowResult<Option<Dispute>> {
        Ok(self.disputes.read().await.get(&id).cloned())
    }

    async fn dispute_for_transaction(&self, transaction_id: Uuid) -> EscrowResult<Option<Dispute>> {
        Ok(self
            .disputes
            .read()
            .await
            .values()
            .find(|d| d.transaction_id == transaction_id)
            .cloned())
    }

    async fn commit_dispute(&self, mut dispute: Dispute) -> EscrowResult<Dispute> {
        let mut disputes = self.disputes.write().await;
        let stored = disputes.get(&dispute.id).ok_or_else(|| {
            EscrowError::not_found(format!("dispute {} not found", dispute.id))
        })?;
        if stored.version != dispute.version {
            return Err(EscrowError::conflict(format!(
                "dispute {} was modified concurrently",
                dispute.id
            )));
        }
        dispute.version += 1;
        disputes.insert(dispute.id, dispute.clone());
        Ok(dispute)
    }

    async fn open_disputes_before(&self, cutoff: DateTime<Utc>) -> EscrowResult<Vec<Dispute>> {
        Ok(self
            .disputes
            .read()
            .await
            .values()
            .filter(|d| d.status == DisputeStatus::Open && d.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn all_disputes(&self) -> EscrowResult<Vec<Dispute>> {
        Ok(self.disputes.read().await.values().cloned().collect())
    }

    async fn remove_dispute(&self, id: Uuid) -> EscrowResult<()> {
        self.disputes.write().await.remove(&id);
        Ok(())
    }

    async fn user(&self, id: Uuid) -> EscrowResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn upsert_user(&self, user: User) -> EscrowResult<()> {
        self.users.write().await.insert(user.id, user);
        Ok(())
    }
}
