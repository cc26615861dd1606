//! Error types for the escrow engine
//!
//! Every failure an engine can report is one of these kinds. Validation,
//! NotFound and StateTransition errors guarantee that no mutation happened;
//! Gateway errors leave the record untouched and retry-eligible; Conflict
//! means a concurrent writer won the race and the caller saw a clean abort.

use thiserror::Error;

use crate::models::TransactionStatus;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Bad input or failed precondition, no mutation performed
    #[error("{0}")]
    Validation(String),

    /// Missing entity, no mutation performed
    #[error("{0}")]
    NotFound(String),

    /// External chain call failed or timed out, record left untouched
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Lost a concurrent read-modify-write race on the same record
    #[error("conflict: {0}")]
    Conflict(String),

    /// Escrow key decrypt failure, fatal for the current release attempt
    #[error("crypto integrity error: {0}")]
    CryptoIntegrity(String),

    /// Attempted an edge outside the legal transition graph
    #[error("invalid state transition: {from} -> {to}")]
    StateTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a gateway error
    pub fn gateway<S: Into<String>>(msg: S) -> Self {
        Self::Gateway(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a crypto integrity error
    pub fn crypto_integrity<S: Into<String>>(msg: S) -> Self {
        Self::CryptoIntegrity(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition(from: TransactionStatus, to: TransactionStatus) -> Self {
        Self::StateTransition { from, to }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failed operation is safe to retry as-is on a later sweep
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway(_) | Self::Conflict(_))
    }
}
