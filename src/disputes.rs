//! Dispute creation, tiered auto-resolution, and admin override
//!
//! Disputes freeze a trade in the `Disputed` state until an admin or the
//! auto-resolution sweep settles them. Auto-resolution is tiered by trade
//! amount: small disputes favor the seller, medium ones are split, large
//! ones always wait for manual review.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::models::{Dispute, DisputeStatus, NotificationKind, TransactionStatus};
use crate::notify::NotificationSink;
use crate::store::EscrowStore;
use crate::EscrowResult;

/// Configuration for the dispute engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeConfig {
    /// Transactions above this amount cannot be disputed at all
    pub max_dispute_amount: Decimal,
    /// Open disputes older than this many days are swept for auto-resolution
    pub auto_resolve_days: i64,
    /// Base interval between auto-resolution sweeps in seconds
    pub sweep_interval_secs: u64,
    /// Uniform random jitter added to each interval, in seconds
    pub jitter_secs: u64,
    /// Below this amount, auto-resolution releases to the seller
    pub small_amount_ceiling: Decimal,
    /// Below this amount (and at or above the small ceiling), funds are
    /// split; at or above it, the dispute is left for manual review
    pub split_amount_ceiling: Decimal,
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            max_dispute_amount: dec!(10000),
            auto_resolve_days: 14,
            sweep_interval_secs: 3600,
            jitter_secs: 120,
            small_amount_ceiling: dec!(50),
            split_amount_ceiling: dec!(200),
        }
    }
}

/// Admin resolution action for a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionAction {
    /// Complete the trade in the seller's favor
    Release,
    /// Refund the trade in the buyer's favor
    Refund,
}

/// Dispute statistics for the admin dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisputeStatistics {
    pub total_disputes: usize,
    pub open_disputes: usize,
    pub resolved_disputes: usize,
    /// resolved / max(total, 1) * 100
    pub resolution_rate: f64,
    /// Average hours from creation to resolution, 0.0 when nothing resolved
    pub avg_resolution_hours: f64,
}

/// Engine managing the dispute lifecycle
pub struct DisputeEngine {
    config: DisputeConfig,
    store: Arc<dyn EscrowStore>,
    sink: Arc<dyn NotificationSink>,
}

impl DisputeEngine {
    pub fn new(
        config: DisputeConfig,
        store: Arc<dyn EscrowStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            config,
            store,
            sink,
        }
    }

    /// Open a dispute on an escrowed trade.
    ///
    /// The dispute insert and the transaction's move to `Disputed` succeed
    /// or fail together; a lost transition race rolls the insert back.
    pub async fn create_dispute(
        &self,
        transaction_id: Uuid,
        user_id: Uuid,
        reason: String,
        description: String,
    ) -> EscrowResult<Dispute> {
        let mut tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        if !tx.status.can_dispute() {
            return Err(EscrowError::validation(
                "Transaction cannot be disputed in current state",
            ));
        }
        if !tx.is_party(user_id) {
            return Err(EscrowError::validation(
                "You are not authorized to dispute this transaction",
            ));
        }
        if self
            .store
            .dispute_for_transaction(transaction_id)
            .await?
            .is_some()
        {
            return Err(EscrowError::validation(
                "Dispute already exists for this transaction",
            ));
        }
        if tx.amount > self.config.max_dispute_amount {
            return Err(EscrowError::validation(format!(
                "Transaction amount exceeds dispute limit of {}",
                self.config.max_dispute_amount
            )));
        }

        let dispute = Dispute::new(transaction_id, user_id, reason, description);
        self.store.insert_dispute(dispute.clone()).await?;

        tx.transition(TransactionStatus::Disputed)?;
        if let Err(err) = self.store.commit_transaction(tx).await {
            // The insert must not survive a lost transition race.
            self.store.remove_dispute(dispute.id).await?;
            return Err(err);
        }

        info!(%transaction_id, dispute_id = %dispute.id, %user_id, "dispute created");
        self.notify_parties(
            &dispute,
            NotificationKind::DisputeOpened,
            format!("A dispute was opened on trade {transaction_id}"),
        )
        .await;

        Ok(dispute)
    }

    /// Run auto-resolution sweeps until the shutdown channel fires or closes
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sweep_interval_secs,
            "dispute auto-resolution sweeper started"
        );
        loop {
            let jitter = if self.config.jitter_secs > 0 {
                rand::thread_rng().gen_range(0..=self.config.jitter_secs)
            } else {
                0
            };
            let delay = Duration::from_secs(self.config.sweep_interval_secs + jitter);

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("dispute sweeper stopping");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    match self.auto_resolve_once().await {
                        Ok(resolved) if resolved > 0 => {
                            info!(resolved, "auto-resolved disputes");
                        }
                        Ok(_) => {}
                        Err(err) => error!(%err, "dispute sweep failed"),
                    }
                }
            }
        }
    }

    /// Sweep open disputes past the auto-resolution window once.
    ///
    /// Returns the number of disputes resolved.
    pub async fn auto_resolve_once(&self) -> EscrowResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.auto_resolve_days);
        let candidates = self.store.open_disputes_before(cutoff).await?;

        let mut resolved = 0;
        for dispute in candidates {
            match self.auto_resolve_single(dispute).await {
                Ok(true) => resolved += 1,
                Ok(false) => {}
                Err(err) => warn!(%err, "auto-resolution skipped a dispute"),
            }
        }
        Ok(resolved)
    }

    /// Apply the tiered policy to one dispute.
    ///
    /// Returns false when the dispute is left open for manual review.
    async fn auto_resolve_single(&self, mut dispute: Dispute) -> EscrowResult<bool> {
        let tx = self
            .store
            .transaction(dispute.transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        let notes = if tx.amount < self.config.small_amount_ceiling {
            "Auto-resolved: small-amount dispute - funds released to seller".to_string()
        } else if tx.amount < self.config.split_amount_ceiling {
            "Auto-resolved: medium-amount dispute - funds split between parties \
             (50/50 split - contact admin for details)"
                .to_string()
        } else {
            // Large amounts always wait for a human.
            return Ok(false);
        };

        let target = TransactionStatus::Completed;
        if tx.status != target && !tx.status.can_transition_to(target) {
            warn!(dispute_id = %dispute.id, status = %tx.status, "dispute transaction is unsettleable, leaving for admin");
            return Ok(false);
        }

        // The dispute's Resolved write lands first: it is what keeps later
        // sweeps from re-selecting this dispute, so a half-applied pair can
        // only be a resolved dispute awaiting its transaction settlement.
        dispute.resolve(true, notes.clone());
        let dispute = match self.store.commit_dispute(dispute).await {
            Ok(dispute) => dispute,
            Err(EscrowError::Conflict(_)) => {
                // A concurrent admin resolution won the dispute record.
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        // Both tiers complete the trade; the split itself is settled
        // out-of-band per the resolution notes.
        if let Err(err) = self.settle_transaction(dispute.transaction_id, target).await {
            warn!(dispute_id = %dispute.id, %err, "dispute resolved but transaction settlement needs attention");
        }

        info!(dispute_id = %dispute.id, "dispute auto-resolved");
        self.notify_parties(&dispute, NotificationKind::DisputeResolved, notes)
            .await;
        Ok(true)
    }

    /// Bring the disputed transaction to its resolution status.
    ///
    /// Idempotent: a transaction already at `target` is left alone, and a
    /// lost version race is retried once against the re-read record.
    async fn settle_transaction(
        &self,
        transaction_id: Uuid,
        target: TransactionStatus,
    ) -> EscrowResult<()> {
        for _ in 0..2 {
            let mut tx = self
                .store
                .transaction(transaction_id)
                .await?
                .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;
            if tx.status == target {
                return Ok(());
            }
            tx.transition(target)?;
            tx.completed_at = Some(Utc::now());
            match self.store.commit_transaction(tx).await {
                Ok(_) => return Ok(()),
                Err(EscrowError::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(EscrowError::conflict(
            "transaction kept moving during dispute settlement",
        ))
    }

    /// Admin-initiated resolution, mirroring release/refund status effects
    pub async fn admin_resolve(
        &self,
        dispute_id: Uuid,
        action: ResolutionAction,
        notes: String,
    ) -> EscrowResult<Dispute> {
        let mut dispute = self
            .store
            .dispute(dispute_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Dispute not found"))?;

        if !dispute.status.is_active() {
            return Err(EscrowError::validation("Dispute is already resolved"));
        }

        let tx = self
            .store
            .transaction(dispute.transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        let target = match action {
            ResolutionAction::Release => TransactionStatus::Completed,
            ResolutionAction::Refund => TransactionStatus::Refunded,
        };
        // Validate the settlement edge before anything is written; a
        // transaction already at the target (a lingering dispute on a
        // settled trade) is acceptable.
        if tx.status != target && !tx.status.can_transition_to(target) {
            return Err(EscrowError::state_transition(tx.status, target));
        }

        dispute.resolve(true, notes.clone());
        let dispute = match self.store.commit_dispute(dispute).await {
            Ok(dispute) => dispute,
            Err(EscrowError::Conflict(_)) => {
                // The sweep or another admin resolved it first.
                return Err(EscrowError::validation("Dispute is already resolved"));
            }
            Err(err) => return Err(err),
        };
        self.settle_transaction(dispute.transaction_id, target).await?;

        info!(%dispute_id, ?action, "dispute resolved by admin");
        self.notify_parties(&dispute, NotificationKind::DisputeResolved, notes)
            .await;

        Ok(dispute)
    }

    /// Aggregate dispute statistics
    pub async fn statistics(&self) -> EscrowResult<DisputeStatistics> {
        let disputes = self.store.all_disputes().await?;
        let total = disputes.len();
        let open = disputes
            .iter()
            .filter(|d| d.status == DisputeStatus::Open)
            .count();
        let resolved = disputes
            .iter()
            .filter(|d| d.status == DisputeStatus::Resolved)
            .count();

        let latencies: Vec<f64> = disputes
            .iter()
            .filter_map(|d| {
                d.resolved_at
                    .map(|at| (at - d.created_at).num_seconds() as f64 / 3600.0)
            })
            .collect();
        let avg_hours = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        Ok(DisputeStatistics {
            total_disputes: total,
            open_disputes: open,
            resolved_disputes: resolved,
            resolution_rate: resolved as f64 / total.max(1) as f64 * 100.0,
            avg_resolution_hours: (avg_hours * 10.0).round() / 10.0,
        })
    }

    /// Notify both trade parties about a dispute event, best-effort
    async fn notify_parties(&self, dispute: &Dispute, kind: NotificationKind, message: String) {
        let tx = match self.store.transaction(dispute.transaction_id).await {
            Ok(Some(tx)) => tx,
            _ => return,
        };
        let mut recipients = vec![tx.seller_id];
        if let Some(buyer_id) = tx.buyer_id {
            recipients.push(buyer_id);
        }
        for user_id in recipients {
            if let Err(err) = self
                .sink
                .enqueue(user_id, Some(tx.id), message.clone(), kind)
                .await
            {
                warn!(%user_id, %err, "dispute notification failed");
            }
        }
    }
}
