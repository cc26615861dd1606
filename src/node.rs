//! Top-level escrow node
//!
//! Wires the store, gateway, secret store, and notification sink into the
//! engines and exposes the request-driven operations behind a uniform
//! response envelope. Presentation layers (bots, HTTP handlers, CLIs) talk
//! to [`EscrowNode`] and never to the engines directly.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::disputes::{DisputeConfig, DisputeEngine, ResolutionAction};
use crate::error::EscrowError;
use crate::gateway::CryptoGateway;
use crate::models::{Currency, EscrowWallet, Transaction, TransactionStatus};
use crate::monitor::{MonitorConfig, PaymentMonitor};
use crate::notify::NotificationSink;
use crate::release::ReleaseEngine;
use crate::secrets::SecretStore;
use crate::store::EscrowStore;
use crate::validation;
use crate::EscrowResult;

/// Node-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Platform commission rate applied to new trades
    pub commission_rate: Decimal,
    /// Smallest trade amount accepted, in currency units
    pub min_trade_amount: Decimal,
    /// Largest trade amount accepted, in currency units
    pub max_trade_amount: Decimal,
    /// Hours before an unfunded trade expires
    pub trade_expiry_hours: i64,
    pub monitor: MonitorConfig,
    pub disputes: DisputeConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            commission_rate: dec!(0.02),
            min_trade_amount: dec!(0.0001),
            max_trade_amount: dec!(1000000),
            trade_expiry_hours: 24,
            monitor: MonitorConfig::default(),
            disputes: DisputeConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from `custodia.toml` (optional) and `ESCROW_*`
    /// environment variables, layered over the defaults.
    ///
    /// Nested keys use `__` in the environment, e.g.
    /// `ESCROW_MONITOR__SWEEP_INTERVAL_SECS=30`.
    pub fn load() -> EscrowResult<Self> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|err| EscrowError::internal(format!("config defaults: {err}")))?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name("custodia").required(false))
            .add_source(config::Environment::with_prefix("ESCROW").separator("__"))
            .build()
            .map_err(|err| EscrowError::internal(format!("config load: {err}")))?;
        settings
            .try_deserialize()
            .map_err(|err| EscrowError::internal(format!("config parse: {err}")))
    }
}

/// Uniform response envelope for node operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl EngineResponse {
    pub fn ok<S: Into<String>>(message: S) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with<S: Into<String>, T: Serialize>(message: S, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                success: true,
                message: message.into(),
                data: Some(value),
            },
            Err(err) => Self::fail(EscrowError::from(err)),
        }
    }

    /// Convert an engine error into a failure envelope.
    ///
    /// Internal and serialization failures are logged with detail but
    /// surfaced to the caller as a generic message.
    pub fn fail(err: EscrowError) -> Self {
        let message = match &err {
            EscrowError::Internal(_) | EscrowError::Serialization(_) => {
                error!(%err, "internal error surfaced to caller");
                "An internal error occurred. Please try again later.".to_string()
            }
            other => other.to_string(),
        };
        Self {
            success: false,
            message,
            data: None,
        }
    }
}

/// Aggregate transaction statistics for the admin dashboard
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionSummary {
    pub total_transactions: usize,
    pub completed: usize,
    pub pending: usize,
    pub disputed: usize,
    /// completed / max(total, 1) * 100
    pub success_rate: f64,
    /// Completed trade volume keyed by currency code
    pub volume_by_currency: std::collections::HashMap<String, Decimal>,
}

/// The assembled escrow node
pub struct EscrowNode {
    config: NodeConfig,
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn CryptoGateway>,
    secrets: Arc<dyn SecretStore>,
    release_engine: Arc<ReleaseEngine>,
    dispute_engine: Arc<DisputeEngine>,
    payment_monitor: Arc<PaymentMonitor>,
}

impl EscrowNode {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn CryptoGateway>,
        secrets: Arc<dyn SecretStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let release_engine = Arc::new(ReleaseEngine::new(
            store.clone(),
            gateway.clone(),
            secrets.clone(),
            sink.clone(),
        ));
        let dispute_engine = Arc::new(DisputeEngine::new(
            config.disputes.clone(),
            store.clone(),
            sink.clone(),
        ));
        let payment_monitor = Arc::new(PaymentMonitor::new(
            config.monitor.clone(),
            store.clone(),
            gateway.clone(),
            sink.clone(),
            release_engine.clone(),
        ));
        Self {
            config,
            store,
            gateway,
            secrets,
            release_engine,
            dispute_engine,
            payment_monitor,
        }
    }

    /// Background payment sweeper, to be spawned by the host process
    pub fn payment_monitor(&self) -> Arc<PaymentMonitor> {
        self.payment_monitor.clone()
    }

    /// Background dispute sweeper, to be spawned by the host process
    pub fn dispute_engine(&self) -> Arc<DisputeEngine> {
        self.dispute_engine.clone()
    }

    /// Create a new trade offer with a freshly generated escrow wallet
    pub async fn create_trade(
        &self,
        seller_id: Uuid,
        title: String,
        description: Option<String>,
        amount: Decimal,
        currency: Currency,
    ) -> EngineResponse {
        match self
            .try_create_trade(seller_id, title, description, amount, currency)
            .await
        {
            Ok(tx) => EngineResponse::ok_with(
                format!("Trade #{} created", tx.trade_hash),
                &tx,
            ),
            Err(err) => EngineResponse::fail(err),
        }
    }

    async fn try_create_trade(
        &self,
        seller_id: Uuid,
        title: String,
        description: Option<String>,
        amount: Decimal,
        currency: Currency,
    ) -> EscrowResult<Transaction> {
        validation::validate_trade_text(&title, description.as_deref())?;
        validation::validate_amount(
            amount,
            self.config.min_trade_amount,
            self.config.max_trade_amount,
        )?;

        let wallet = self.gateway.generate_wallet(currency).await?;
        // The plaintext key goes straight into the vault and nowhere else.
        let key_ciphertext = self.secrets.encrypt(&wallet.private_key).await?;

        let mut tx = Transaction::new(
            seller_id,
            title,
            description,
            amount,
            currency,
            EscrowWallet {
                address: wallet.address,
                key_ciphertext,
            },
            self.config.commission_rate,
        );
        tx.expires_at = Some(Utc::now() + chrono::Duration::hours(self.config.trade_expiry_hours));
        self.store.insert_transaction(tx.clone()).await?;

        info!(transaction_id = %tx.id, %seller_id, %currency, "trade created");
        Ok(tx)
    }

    /// Match a buyer to an open trade, moving it to payment-pending
    pub async fn join_trade(&self, transaction_id: Uuid, buyer_id: Uuid) -> EngineResponse {
        match self.try_join_trade(transaction_id, buyer_id).await {
            Ok(tx) => EngineResponse::ok_with(
                format!(
                    "Joined trade #{}. Send {} to the escrow address.",
                    tx.trade_hash,
                    validation::format_currency(tx.expected_deposit(), tx.currency),
                ),
                &json!({
                    "escrow_address": tx.escrow_address,
                    "expected_deposit": tx.expected_deposit(),
                    "currency": tx.currency,
                }),
            ),
            Err(err) => EngineResponse::fail(err),
        }
    }

    async fn try_join_trade(
        &self,
        transaction_id: Uuid,
        buyer_id: Uuid,
    ) -> EscrowResult<Transaction> {
        let mut tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        if tx.status != TransactionStatus::Created {
            return Err(EscrowError::validation("Trade is no longer open"));
        }
        if tx.seller_id == buyer_id {
            return Err(EscrowError::validation("You cannot buy your own trade"));
        }

        tx.buyer_id = Some(buyer_id);
        tx.transition(TransactionStatus::PaymentPending)?;
        let tx = self.store.commit_transaction(tx).await?;

        info!(%transaction_id, %buyer_id, "buyer joined trade");
        Ok(tx)
    }

    /// Record the seller's payout address for release
    pub async fn set_seller_payout_address(
        &self,
        transaction_id: Uuid,
        seller_id: Uuid,
        address: String,
    ) -> EngineResponse {
        match self
            .try_set_payout_address(transaction_id, seller_id, address)
            .await
        {
            Ok(_) => EngineResponse::ok("Payout address saved"),
            Err(err) => EngineResponse::fail(err),
        }
    }

    async fn try_set_payout_address(
        &self,
        transaction_id: Uuid,
        seller_id: Uuid,
        address: String,
    ) -> EscrowResult<Transaction> {
        let mut tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        if tx.seller_id != seller_id {
            return Err(EscrowError::validation(
                "Only the seller can set the payout address",
            ));
        }
        if tx.status.is_terminal() {
            return Err(EscrowError::validation("Trade is already settled"));
        }
        if !validation::validate_wallet_address(&address, tx.currency) {
            return Err(EscrowError::validation(format!(
                "Invalid {} address format",
                tx.currency
            )));
        }

        tx.seller_payout_address = Some(address);
        self.store.commit_transaction(tx).await
    }

    /// Cancel a trade before any payment arrived
    pub async fn cancel_trade(&self, transaction_id: Uuid, user_id: Uuid) -> EngineResponse {
        match self.try_cancel_trade(transaction_id, user_id).await {
            Ok(tx) => EngineResponse::ok(format!("Trade #{} cancelled", tx.trade_hash)),
            Err(err) => EngineResponse::fail(err),
        }
    }

    async fn try_cancel_trade(
        &self,
        transaction_id: Uuid,
        user_id: Uuid,
    ) -> EscrowResult<Transaction> {
        let mut tx = self
            .store
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EscrowError::not_found("Transaction not found"))?;

        if !tx.is_party(user_id) {
            return Err(EscrowError::validation(
                "You are not authorized to cancel this transaction",
            ));
        }
        tx.transition(TransactionStatus::Cancelled).map_err(|_| {
            EscrowError::validation("Trade cannot be cancelled after payment was received")
        })?;
        let tx = self.store.commit_transaction(tx).await?;

        info!(%transaction_id, %user_id, "trade cancelled");
        Ok(tx)
    }

    /// Release custodied funds to the seller
    pub async fn release(&self, transaction_id: Uuid, admin_override: bool) -> EngineResponse {
        match self
            .release_engine
            .release(transaction_id, admin_override, false)
            .await
        {
            Ok(tx) => EngineResponse::ok_with(
                format!("Trade #{} completed", tx.trade_hash),
                &json!({
                    "blockchain_tx_hash": tx.blockchain_tx_hash,
                    "status": tx.status,
                }),
            ),
            Err(err) => EngineResponse::fail(err),
        }
    }

    /// Mark a refund of the custodied funds to the buyer
    pub async fn refund(&self, transaction_id: Uuid, reason: &str) -> EngineResponse {
        match self.release_engine.refund(transaction_id, reason).await {
            Ok(tx) => EngineResponse::ok(format!("Trade #{} refunded", tx.trade_hash)),
            Err(err) => EngineResponse::fail(err),
        }
    }

    /// Open a dispute on an escrowed trade
    pub async fn create_dispute(
        &self,
        transaction_id: Uuid,
        user_id: Uuid,
        reason: String,
        description: String,
    ) -> EngineResponse {
        match self
            .dispute_engine
            .create_dispute(transaction_id, user_id, reason, description)
            .await
        {
            Ok(dispute) => EngineResponse::ok_with(
                "Dispute opened. An admin will review it shortly.",
                &json!({ "dispute_id": dispute.id }),
            ),
            Err(err) => EngineResponse::fail(err),
        }
    }

    /// Admin-initiated dispute resolution
    pub async fn resolve_dispute(
        &self,
        dispute_id: Uuid,
        action: ResolutionAction,
        notes: String,
    ) -> EngineResponse {
        match self
            .dispute_engine
            .admin_resolve(dispute_id, action, notes)
            .await
        {
            Ok(dispute) => EngineResponse::ok_with("Dispute resolved", &dispute),
            Err(err) => EngineResponse::fail(err),
        }
    }

    /// Point read of a transaction
    pub async fn transaction(&self, transaction_id: Uuid) -> EngineResponse {
        match self.store.transaction(transaction_id).await {
            Ok(Some(tx)) => EngineResponse::ok_with(format!("Trade #{}", tx.trade_hash), &tx),
            Ok(None) => EngineResponse::fail(EscrowError::not_found("Transaction not found")),
            Err(err) => EngineResponse::fail(err),
        }
    }

    /// Aggregate transaction statistics
    pub async fn transaction_summary(&self) -> EngineResponse {
        match self.try_transaction_summary().await {
            Ok(summary) => EngineResponse::ok_with("Transaction summary", &summary),
            Err(err) => EngineResponse::fail(err),
        }
    }

    async fn try_transaction_summary(&self) -> EscrowResult<TransactionSummary> {
        let transactions = self.store.all_transactions().await?;
        let mut summary = TransactionSummary {
            total_transactions: transactions.len(),
            ..Default::default()
        };
        for tx in &transactions {
            match tx.status {
                TransactionStatus::Completed => {
                    summary.completed += 1;
                    *summary
                        .volume_by_currency
                        .entry(tx.currency.as_str().to_string())
                        .or_insert(Decimal::ZERO) += tx.amount;
                }
                TransactionStatus::Disputed => summary.disputed += 1,
                TransactionStatus::Created
                | TransactionStatus::PaymentPending
                | TransactionStatus::PaymentReceived
                | TransactionStatus::InEscrow => summary.pending += 1,
                TransactionStatus::Cancelled | TransactionStatus::Refunded => {}
            }
        }
        summary.success_rate =
            summary.completed as f64 / summary.total_transactions.max(1) as f64 * 100.0;
        Ok(summary)
    }

    /// Aggregate dispute statistics
    pub async fn dispute_statistics(&self) -> EngineResponse {
        match self.dispute_engine.statistics().await {
            Ok(stats) => EngineResponse::ok_with("Dispute statistics", &stats),
            Err(err) => EngineResponse::fail(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimulatedGateway;
    use crate::notify::MemorySink;
    use crate::secrets::MemoryVault;
    use crate::store::MemoryStore;

    fn node() -> (EscrowNode, Arc<MemoryStore>, Arc<SimulatedGateway>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(SimulatedGateway::new());
        let node = EscrowNode::new(
            NodeConfig::default(),
            store.clone(),
            gateway.clone(),
            Arc::new(MemoryVault::new()),
            Arc::new(MemorySink::new()),
        );
        (node, store, gateway)
    }

    fn data_id(response: &EngineResponse, key: &str) -> Uuid {
        response.data.as_ref().unwrap()[key]
            .as_str()
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn create_trade_generates_wallet_and_expiry() {
        let (node, store, _) = node();
        let response = node
            .create_trade(
                Uuid::new_v4(),
                "Steam gift card".into(),
                Some("50 USD card, code delivered by chat".into()),
                dec!(40),
                Currency::Usdt,
            )
            .await;
        assert!(response.success, "{}", response.message);

        let id = data_id(&response, "id");
        let tx = store.transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Created);
        assert!(tx.escrow_address.starts_with("0x"));
        assert!(tx.escrow_key_ciphertext.starts_with("vault:"));
        assert!(tx.expires_at.is_some());
        assert_eq!(tx.commission_rate, dec!(0.02));
    }

    #[tokio::test]
    async fn create_trade_rejects_bad_input() {
        let (node, _, _) = node();
        let seller = Uuid::new_v4();

        let response = node
            .create_trade(seller, "ab".into(), None, dec!(40), Currency::Usdt)
            .await;
        assert!(!response.success);
        assert!(response.message.contains("Title"));

        let response = node
            .create_trade(seller, "Valid title".into(), None, dec!(0), Currency::Usdt)
            .await;
        assert!(!response.success);
        assert!(response.message.contains("greater than zero"));
    }

    #[tokio::test]
    async fn join_trade_moves_to_payment_pending() {
        let (node, store, _) = node();
        let seller = Uuid::new_v4();
        let created = node
            .create_trade(
                seller,
                "Domain name".into(),
                Some("example.com, transfer via registrar".into()),
                dec!(100),
                Currency::Ethereum,
            )
            .await;
        let id = data_id(&created, "id");

        // Seller cannot buy their own trade
        let response = node.join_trade(id, seller).await;
        assert!(!response.success);

        let response = node.join_trade(id, Uuid::new_v4()).await;
        assert!(response.success, "{}", response.message);
        let tx = store.transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::PaymentPending);

        // Already matched
        let response = node.join_trade(id, Uuid::new_v4()).await;
        assert!(!response.success);
        assert!(response.message.contains("no longer open"));
    }

    #[tokio::test]
    async fn payout_address_is_validated_per_currency() {
        let (node, _, _) = node();
        let seller = Uuid::new_v4();
        let created = node
            .create_trade(
                seller,
                "BTC trade".into(),
                Some("Bitcoin payout validation test".into()),
                dec!(0.5),
                Currency::Bitcoin,
            )
            .await;
        let id = data_id(&created, "id");

        let response = node
            .set_seller_payout_address(id, seller, "0x52908400098527886E0F7030069857D2E4169EE7".into())
            .await;
        assert!(!response.success);
        assert!(response.message.contains("Invalid bitcoin address"));

        let response = node
            .set_seller_payout_address(
                id,
                seller,
                "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".into(),
            )
            .await;
        assert!(response.success, "{}", response.message);

        // Only the seller can set it
        let response = node
            .set_seller_payout_address(id, Uuid::new_v4(), "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into())
            .await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn cancel_only_before_payment() {
        let (node, store, _) = node();
        let seller = Uuid::new_v4();
        let created = node
            .create_trade(
                seller,
                "Cancellable".into(),
                Some("Trade cancelled before funding".into()),
                dec!(10),
                Currency::Usdt,
            )
            .await;
        let id = data_id(&created, "id");

        let response = node.cancel_trade(id, Uuid::new_v4()).await;
        assert!(!response.success, "outsider cancelled a trade");

        let response = node.cancel_trade(id, seller).await;
        assert!(response.success, "{}", response.message);
        let tx = store.transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Cancelled);

        // Cancelling again fails: the state is terminal
        let response = node.cancel_trade(id, seller).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn summary_counts_by_status() {
        let (node, store, _) = node();
        let created = node
            .create_trade(
                Uuid::new_v4(),
                "Pending one".into(),
                Some("Still waiting for a buyer".into()),
                dec!(10),
                Currency::Usdt,
            )
            .await;
        let id = data_id(&created, "id");

        let mut tx = store.transaction(id).await.unwrap().unwrap();
        tx.status = TransactionStatus::Completed;
        store.commit_transaction(tx).await.unwrap();

        let response = node.transaction_summary().await;
        assert!(response.success, "{}", response.message);
        let summary: TransactionSummary =
            serde_json::from_value(response.data.unwrap()).unwrap();
        assert_eq!(summary.total_transactions, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.success_rate, 100.0);
        assert_eq!(summary.volume_by_currency["usdt"], dec!(10));
    }

    #[tokio::test]
    async fn summary_is_wrapped_in_the_response_envelope() {
        let (node, _, _) = node();
        let response = node.transaction_summary().await;
        assert!(response.success);
        assert!(response.data.is_some());
        let summary: TransactionSummary =
            serde_json::from_value(response.data.unwrap()).unwrap();
        assert_eq!(summary.total_transactions, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[test]
    fn default_config_is_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.commission_rate, dec!(0.02));
        assert!(config.min_trade_amount < config.max_trade_amount);
        assert_eq!(config.monitor.auto_release_days, 7);
        assert_eq!(config.disputes.split_amount_ceiling, dec!(200));
    }
}
