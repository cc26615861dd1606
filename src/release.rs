//! Escrow release and refund engine
//!
//! Performs the terminal money movements of a trade: releasing custodied
//! funds to the seller or marking a refund to the buyer. Reputation updates
//! and notifications happen after the state commit and never block it.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::gateway::CryptoGateway;
use crate::models::{NotificationKind, Transaction, TransactionStatus, User};
use crate::notify::NotificationSink;
use crate::secrets::SecretStore;
use crate::store::EscrowStore;
use crate::validation::format_currency;
use crate::EscrowResult;

/// Reputation bonus awarded to the seller on a completed trade
const SELLER_COMPLETION_BONUS: f64 = 0.1;
/// Reputation bonus awarded to the buyer on a completed trade
const BUYER_COMPLETION_BONUS: f64 = 0.05;

/// Engine performing escrow release and refund
pub struct ReleaseEngine {
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn CryptoGateway>,
    secrets: Arc<dyn SecretStore>,
    sink: Arc<dyn NotificationSink>,
}

impl ReleaseEngine {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn CryptoGateway>,
        secrets: Arc<dyn SecretStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            gateway,
            secrets,
            sink,
        }
    }

    /// Release custodied funds to the seller.
    ///
    /// Preconditions: the transaction is in escrow and carries a seller
    /// payout address. A failed gateway send leaves the record untouched so
    /// the next sweep or manual invocation can retry.
    pub async fn release(
        &self,
        transaction_id: Uuid,
        admin_override: bool,
        auto_release: bool,
    ) -> EscrowResult<Transaction> {
        let mut tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        if tx.status != TransactionStatus::InEscrow {
            return Err(EscrowError::validation("not in escrow status"));
        }

        let seller_address = tx
            .seller_payout_address
            .clone()
            .ok_or_else(|| EscrowError::validation("No seller payout address on file"))?;

        // Decrypt failure is fatal for this attempt; surface it loudly and
        // never substitute a default key.
        let private_key = match self.secrets.decrypt(&tx.escrow_key_ciphertext).await {
            Ok(key) => key,
            Err(err) => {
                error!(%transaction_id, %err, "escrow key decrypt failed, operator attention required");
                return Err(err);
            }
        };

        // Seller receives the trade amount; commission stays behind.
        let tx_hash = self
            .gateway
            .send_payment(
                &tx.escrow_address,
                &private_key,
                &seller_address,
                tx.amount,
                tx.currency,
            )
            .await?;
        drop(private_key);

        let Some(tx_hash) = tx_hash else {
            warn!(%transaction_id, "payment send returned no hash, leaving transaction for retry");
            return Err(EscrowError::gateway("payment send failed"));
        };

        tx.transition(TransactionStatus::Completed)?;
        tx.completed_at = Some(Utc::now());
        tx.blockchain_tx_hash = Some(tx_hash.clone());

        let committed = match self.store.commit_transaction(tx).await {
            Ok(committed) => committed,
            Err(EscrowError::Conflict(_)) => {
                // Lost the race against a concurrent release/refund. The
                // payment already went out; reconciliation is an operator
                // task, the state itself stays consistent.
                warn!(%transaction_id, "release lost a concurrent commit, payment requires reconciliation");
                return Err(EscrowError::validation("not in escrow status"));
            }
            Err(err) => return Err(err),
        };

        info!(%transaction_id, %tx_hash, auto_release, admin_override, "escrow released");

        self.award_completion(&committed).await;
        self.notify_completion(&committed, auto_release).await;

        Ok(committed)
    }

    /// Mark a refund of the custodied funds to the buyer.
    ///
    /// The refund amount excludes commission. No on-chain transfer-back is
    /// performed here; settlement to the buyer's address is handled
    /// out-of-band.
    pub async fn refund(&self, transaction_id: Uuid, reason: &str) -> EscrowResult<Transaction> {
        let mut tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        if !matches!(
            tx.status,
            TransactionStatus::InEscrow | TransactionStatus::Disputed
        ) {
            return Err(EscrowError::validation(
                "Transaction cannot be refunded in current state",
            ));
        }
        if tx.buyer_id.is_none() {
            return Err(EscrowError::validation("Transaction has no buyer to refund"));
        }

        tx.transition(TransactionStatus::Refunded)?;
        tx.completed_at = Some(Utc::now());

        let committed = match self.store.commit_transaction(tx).await {
            Ok(committed) => committed,
            Err(EscrowError::Conflict(_)) => {
                warn!(%transaction_id, "refund lost a concurrent commit");
                return Err(EscrowError::validation(
                    "Transaction cannot be refunded in current state",
                ));
            }
            Err(err) => return Err(err),
        };

        info!(%transaction_id, reason, "escrow refunded");
        self.notify_refund(&committed, reason).await;

        Ok(committed)
    }

    /// Update trade counters and reputation for both parties.
    ///
    /// Runs after the commit; failures are logged, never propagated.
    async fn award_completion(&self, tx: &Transaction) {
        if let Err(err) = self
            .bump_user(tx.seller_id, SELLER_COMPLETION_BONUS)
            .await
        {
            warn!(user_id = %tx.seller_id, %err, "failed to update seller stats");
        }
        if let Some(buyer_id) = tx.buyer_id {
            if let Err(err) = self.bump_user(buyer_id, BUYER_COMPLETION_BONUS).await {
                warn!(user_id = %buyer_id, %err, "failed to update buyer stats");
            }
        }
    }

    async fn bump_user(&self, user_id: Uuid, bonus: f64) -> EscrowResult<()> {
        let mut user = self
            .store
            .user(user_id)
            .await?
            .unwrap_or_else(|| User::new(user_id));
        user.record_successful_trade(bonus);
        self.store.upsert_user(user).await
    }

    async fn notify_completion(&self, tx: &Transaction, auto_release: bool) {
        let how = if auto_release { "automatically" } else { "manually" };
        let seller_message = format!(
            "Trade #{} completed {how}. Amount received: {}. Commission: {}. Chain tx: {}",
            tx.trade_hash,
            format_currency(tx.amount, tx.currency),
            format_currency(tx.commission_amount, tx.currency),
            tx.blockchain_tx_hash.as_deref().unwrap_or("n/a"),
        );
        self.enqueue(tx.seller_id, tx, seller_message, NotificationKind::TradeCompleted)
            .await;

        if let Some(buyer_id) = tx.buyer_id {
            let buyer_message = format!(
                "Trade #{} completed. Thank you for using the escrow service.",
                tx.trade_hash
            );
            self.enqueue(buyer_id, tx, buyer_message, NotificationKind::TradeCompleted)
                .await;
        }
    }

    async fn notify_refund(&self, tx: &Transaction, reason: &str) {
        if let Some(buyer_id) = tx.buyer_id {
            let buyer_message = format!(
                "Refund issued for trade #{}. Amount: {}. Reason: {reason}",
                tx.trade_hash,
                format_currency(tx.amount, tx.currency),
            );
            self.enqueue(buyer_id, tx, buyer_message, NotificationKind::RefundIssued)
                .await;
        }
        let seller_message = format!(
            "Trade #{} has been refunded. Amount: {}. Reason: {reason}",
            tx.trade_hash,
            format_currency(tx.amount, tx.currency),
        );
        self.enqueue(tx.seller_id, tx, seller_message, NotificationKind::RefundIssued)
            .await;
    }

    async fn enqueue(&self, user_id: Uuid, tx: &Transaction, message: String, kind: NotificationKind) {
        if let Err(err) = self.sink.enqueue(user_id, Some(tx.id), message, kind).await {
            warn!(%user_id, transaction_id = %tx.id, %err, "notification enqueue failed");
        }
    }
}
