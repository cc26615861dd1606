//! Payment monitor sweeps
//!
//! Periodically scans pending and aging transactions, confirms escrow
//! deposits through the gateway, and triggers auto-release of stale escrows.
//! Sweeps re-evaluate live state rather than queued jobs, so a failed
//! gateway call simply leaves the record for the next pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::EscrowError;
use crate::gateway::CryptoGateway;
use crate::models::{NotificationKind, Transaction, TransactionStatus};
use crate::notify::NotificationSink;
use crate::release::ReleaseEngine;
use crate::store::EscrowStore;
use crate::validation::format_currency;
use crate::EscrowResult;

/// Configuration for the payment monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Base interval between sweeps in seconds
    pub sweep_interval_secs: u64,
    /// Uniform random jitter added to each interval, in seconds
    pub jitter_secs: u64,
    /// Only check payment-pending transactions created within this window
    pub payment_lookback_hours: i64,
    /// Auto-release escrows whose payment is older than this
    pub auto_release_days: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            jitter_secs: 15,
            payment_lookback_hours: 2,
            auto_release_days: 7,
        }
    }
}

/// Outcome of a single sweep, for logging and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub payments_confirmed: usize,
    pub auto_released: usize,
}

/// Periodic payment and auto-release sweeper
pub struct PaymentMonitor {
    config: MonitorConfig,
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn CryptoGateway>,
    sink: Arc<dyn NotificationSink>,
    release_engine: Arc<ReleaseEngine>,
}

impl PaymentMonitor {
    pub fn new(
        config: MonitorConfig,
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn CryptoGateway>,
        sink: Arc<dyn NotificationSink>,
        release_engine: Arc<ReleaseEngine>,
    ) -> Self {
        Self {
            config,
            store,
            gateway,
            sink,
            release_engine,
        }
    }

    /// Run sweeps until the shutdown channel fires or closes
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sweep_interval_secs,
            jitter_secs = self.config.jitter_secs,
            "payment monitor started"
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
                    info!("payment monitor stopping");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(err) = self.sweep_once().await {
                        error!(%err, "payment sweep failed");
                    }
                }
            }
        }
    }

    /// One full sweep: confirm pending deposits, then auto-release stale
    /// escrows.
    pub async fn sweep_once(&self) -> EscrowResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let lookback = now - chrono::Duration::hours(self.config.payment_lookback_hours);
        for tx in self.store.transactions_pending_payment(lookback).await? {
            match self.confirm_payment(tx).await {
                Ok(true) => report.payments_confirmed += 1,
                Ok(false) => {}
                Err(err) => warn!(%err, "payment check failed, will retry next sweep"),
            }
        }

        let release_cutoff = now - chrono::Duration::days(self.config.auto_release_days);
        for tx in self.store.transactions_due_for_release(release_cutoff).await? {
            let id = tx.id;
            match self.release_engine.release(id, false, true).await {
                Ok(_) => {
                    info!(transaction_id = %id, "auto-released after escrow window elapsed");
                    report.auto_released += 1;
                }
                Err(err) if err.is_retryable() => {
                    warn!(transaction_id = %id, %err, "auto-release deferred")
                }
                Err(err) => warn!(transaction_id = %id, %err, "auto-release rejected"),
            }
        }

        Ok(report)
    }

    /// Check one pending transaction for a confirmed deposit.
    ///
    /// Returns true when the transaction moved into escrow.
    async fn confirm_payment(&self, mut tx: Transaction) -> EscrowResult<bool> {
        let expected = tx.expected_deposit();
        let received = self
            .gateway
            .check_payment(&tx.escrow_address, expected, tx.currency)
            .await?;
        if !received {
            return Ok(false);
        }

        // Commission is fixed exactly once, here, at confirmation time.
        tx.transition(TransactionStatus::InEscrow)?;
        tx.payment_received_at = Some(Utc::now());
        tx.commission_amount = tx.commission();

        let committed = match self.store.commit_transaction(tx).await {
            Ok(committed) => committed,
            Err(EscrowError::Conflict(_)) => {
                // Another writer advanced the record; the next sweep sees
                // the live state.
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        info!(transaction_id = %committed.id, "payment confirmed, funds in escrow");
        self.notify_payment_confirmed(&committed).await;
        Ok(true)
    }

    async fn notify_payment_confirmed(&self, tx: &Transaction) {
        let seller_message = format!(
            "Payment confirmed for trade #{}. Amount: {}. Please deliver your product or service.",
            tx.trade_hash,
            format_currency(tx.amount, tx.currency),
        );
        if let Err(err) = self
            .sink
            .enqueue(
                tx.seller_id,
                Some(tx.id),
                seller_message,
                NotificationKind::PaymentConfirmed,
            )
            .await
        {
            warn!(%err, "seller payment notification failed");
        }

        if let Some(buyer_id) = tx.buyer_id {
            let buyer_message = format!(
                "Your payment for trade #{} is confirmed. Funds are now in escrow; wait for delivery.",
                tx.trade_hash,
            );
            if let Err(err) = self
                .sink
                .enqueue(
                    buyer_id,
                    Some(tx.id),
                    buyer_message,
                    NotificationKind::PaymentConfirmed,
                )
                .await
            {
                warn!(%err, "buyer payment notification failed");
            }
        }
    }
}
