//! Custodia: a crypto escrow transaction-lifecycle engine
//!
//! Custodia holds buyer funds in transaction-scoped escrow wallets while a
//! trade settles, then releases to the seller, refunds the buyer, or routes
//! the trade through dispute resolution. The crate is the engine only:
//! presentation layers plug in through [`node::EscrowNode`], and the chain,
//! persistence, secret storage, and notification boundaries are traits with
//! in-process implementations for tests and single-node deployments.
//!
//! The building blocks:
//! - [`models`]: transaction/dispute records and the status state machine
//! - [`store`]: version-checked persistence contract
//! - [`gateway`]: per-currency chain access
//! - [`secrets`]: escrow key encryption boundary
//! - [`monitor`]: payment confirmation and auto-release sweeps
//! - [`release`]: release and refund settlement
//! - [`disputes`]: dispute lifecycle and tiered auto-resolution
//! - [`node`]: the assembled engine facade

pub mod disputes;
pub mod error;
pub mod gateway;
pub mod models;
pub mod monitor;
pub mod node;
pub mod notify;
pub mod release;
pub mod secrets;
pub mod store;
pub mod validation;

pub use error::EscrowError;

/// Result type used throughout the escrow engine
pub type EscrowResult<T> = Result<T, EscrowError>;

/// Initialize tracing for binaries and examples.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .try_init();
}
