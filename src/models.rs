//! Core data models for the escrow engine
//!
//! This module contains the transaction and dispute records, the transaction
//! state machine, and the user/notification types shared by every engine.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EscrowError;
use crate::validation;
use crate::EscrowResult;

/// Supported escrow currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Bitcoin,
    Ethereum,
    Usdt,
}

impl Currency {
    /// Confirmations required before a deposit counts as received
    pub fn required_confirmations(&self) -> u32 {
        match self {
            Self::Bitcoin => 1,
            Self::Ethereum => 3,
            Self::Usdt => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bitcoin => "bitcoin",
            Self::Ethereum => "ethereum",
            Self::Usdt => "usdt",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Trade created by the seller, no buyer matched yet
    Created,
    /// Buyer matched, escrow wallet awaiting deposit
    PaymentPending,
    /// Deposit detected but not yet custodied
    PaymentReceived,
    /// Funds held in the escrow wallet
    InEscrow,
    /// Funds released to the seller
    Completed,
    /// Under dispute resolution
    Disputed,
    /// Cancelled before any payment arrived
    Cancelled,
    /// Funds returned to the buyer
    Refunded,
}

impl TransactionStatus {
    /// Check whether the directed edge `self -> to` is in the legal graph
    pub fn can_transition_to(self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, to),
            (Created, PaymentPending)
                | (PaymentPending, PaymentReceived)
                | (PaymentPending, InEscrow)
                | (PaymentReceived, Completed)
                | (PaymentReceived, Disputed)
                | (PaymentReceived, Refunded)
                | (InEscrow, Completed)
                | (InEscrow, Disputed)
                | (InEscrow, Refunded)
                | (Disputed, Completed)
                | (Disputed, Refunded)
                // Cancellation is only legal before payment is received
                | (Created, Cancelled)
                | (PaymentPending, Cancelled)
        )
    }

    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded)
    }

    /// Check if this state allows opening a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::InEscrow | Self::PaymentReceived)
    }

    /// Check if the buyer may still be absent in this state
    pub fn allows_missing_buyer(&self) -> bool {
        matches!(self, Self::Created | Self::PaymentPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PaymentPending => "payment_pending",
            Self::PaymentReceived => "payment_received",
            Self::InEscrow => "in_escrow",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction-scoped escrow wallet reference
///
/// The private key is never carried in plaintext; `key_ciphertext` is the
/// opaque handle issued by the [`crate::secrets::SecretStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowWallet {
    pub address: String,
    pub key_ciphertext: String,
}

/// Escrowed trade between a seller and an optional buyer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    /// Unique short hash shown to users (16 uppercase hex chars)
    pub trade_hash: String,

    // Parties
    pub seller_id: Uuid,
    pub buyer_id: Option<Uuid>,

    // Trade details
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: TransactionStatus,

    // Wallet information
    pub escrow_address: String,
    pub escrow_key_ciphertext: String,
    pub seller_payout_address: Option<String>,

    // Commission and fees
    pub commission_rate: Decimal,
    /// Set exactly once, at payment confirmation, as amount x commission_rate
    pub commission_amount: Decimal,
    pub network_fee: Decimal,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub payment_received_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    // Chain settlement details
    pub blockchain_tx_hash: Option<String>,
    pub confirmation_count: u32,

    /// Optimistic concurrency token, bumped by the store on every commit
    pub version: u64,
}

impl Transaction {
    /// Create a new trade in the `Created` state
    pub fn new(
        seller_id: Uuid,
        title: String,
        description: Option<String>,
        amount: Decimal,
        currency: Currency,
        wallet: EscrowWallet,
        commission_rate: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            trade_hash: validation::generate_trade_hash(),
            seller_id,
            buyer_id: None,
            title,
            description,
            amount,
            currency,
            status: TransactionStatus::Created,
            escrow_address: wallet.address,
            escrow_key_ciphertext: wallet.key_ciphertext,
            seller_payout_address: None,
            commission_rate,
            commission_amount: Decimal::ZERO,
            network_fee: validation::network_fee(currency, amount),
            created_at: Utc::now(),
            payment_received_at: None,
            completed_at: None,
            expires_at: None,
            blockchain_tx_hash: None,
            confirmation_count: 0,
            version: 0,
        }
    }

    /// Move to `to` if the edge is legal, failing with no mutation otherwise.
    ///
    /// This is the single gate through which every engine changes a
    /// transaction's status.
    pub fn transition(&mut self, to: TransactionStatus) -> EscrowResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(EscrowError::state_transition(self.status, to));
        }
        self.status = to;
        Ok(())
    }

    /// Platform commission for this trade
    pub fn commission(&self) -> Decimal {
        self.amount * self.commission_rate
    }

    /// Amount the buyer must deposit: trade amount plus commission
    pub fn expected_deposit(&self) -> Decimal {
        self.amount + self.commission()
    }

    /// Whether `user_id` is the seller or the matched buyer
    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.seller_id == user_id || self.buyer_id == Some(user_id)
    }
}

/// Dispute state machine enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Investigating,
    Resolved,
    Closed,
}

impl DisputeStatus {
    /// Check if the dispute can still be resolved
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::Investigating)
    }
}

/// Dispute raised by a trade party against an escrowed transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispute {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub initiated_by: Uuid,

    pub reason: String,
    pub description: String,
    pub status: DisputeStatus,

    // Resolution
    pub resolved_by_admin: bool,
    pub resolution_notes: Option<String>,

    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, bumped by the store on every commit
    pub version: u64,
}

impl Dispute {
    /// Create a new open dispute
    pub fn new(transaction_id: Uuid, initiated_by: Uuid, reason: String, description: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            initiated_by,
            reason,
            description,
            status: DisputeStatus::Open,
            resolved_by_admin: false,
            resolution_notes: None,
            created_at: Utc::now(),
            resolved_at: None,
            version: 0,
        }
    }

    /// Mark the dispute resolved with the given notes
    pub fn resolve(&mut self, by_admin: bool, notes: String) {
        self.status = DisputeStatus::Resolved;
        self.resolved_by_admin = by_admin;
        self.resolution_notes = Some(notes);
        self.resolved_at = Some(Utc::now());
    }
}

/// Maximum reputation score a user can reach
pub const MAX_REPUTATION: f64 = 5.0;

/// Trading user with reputation tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// 0.0 - 5.0, monotonically non-decreasing on successful completions
    pub reputation_score: f64,
    pub total_trades: u32,
    pub successful_trades: u32,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl User {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            reputation_score: 0.0,
            total_trades: 0,
            successful_trades: 0,
            created_at: Utc::now(),
            last_active: Utc::now(),
        }
    }

    /// Record a successful trade completion and award the reputation bonus
    pub fn record_successful_trade(&mut self, bonus: f64) {
        self.total_trades += 1;
        self.successful_trades += 1;
        self.reputation_score = (self.reputation_score + bonus).min(MAX_REPUTATION);
        self.last_active = Utc::now();
    }
}

/// Notification category, drives presentation-layer formatting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentConfirmed,
    TradeCompleted,
    RefundIssued,
    DisputeOpened,
    DisputeResolved,
}

/// Append-only user-facing message record
///
/// Emitted best-effort after the state commit; never part of the
/// transaction's atomic boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub message: String,
    pub kind: NotificationKind,
    pub sent_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: Uuid,
        transaction_id: Option<Uuid>,
        message: String,
        kind: NotificationKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            transaction_id,
            message,
            kind,
            sent_at: Utc::now(),
        }
    }
}

/// Default platform commission rate (2%)
pub const DEFAULT_COMMISSION_RATE: Decimal = dec!(0.02);
