//! Crypto gateway contract and simulated implementation
//!
//! The gateway abstracts balance checks and fund transfers per currency.
//! Calls are blocking I/O from the engine's perspective and all-or-nothing:
//! a failed call commits nothing and the record stays retry-eligible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::Currency;
use crate::validation::hex_token;
use crate::EscrowResult;

/// Freshly generated escrow wallet.
///
/// `private_key` is plaintext at this point; callers must hand it to the
/// [`crate::secrets::SecretStore`] immediately and drop this value.
#[derive(Debug, Clone)]
pub struct WalletHandle {
    pub address: String,
    pub private_key: String,
}

/// Per-currency chain access consumed by the engines
#[async_trait]
pub trait CryptoGateway: Send + Sync {
    /// Generate a transaction-scoped escrow wallet
    async fn generate_wallet(&self, currency: Currency) -> EscrowResult<WalletHandle>;

    /// Check whether `address` holds at least `expected_amount`
    async fn check_payment(
        &self,
        address: &str,
        expected_amount: Decimal,
        currency: Currency,
    ) -> EscrowResult<bool>;

    /// Send `amount` from the escrow wallet to `to_address`.
    ///
    /// Returns the chain transaction hash, or `None` when the transfer was
    /// rejected without an error (insufficient fee, mempool refusal).
    async fn send_payment(
        &self,
        from_address: &str,
        from_key: &str,
        to_address: &str,
        amount: Decimal,
        currency: Currency,
    ) -> EscrowResult<Option<String>>;
}

/// Deterministic in-process gateway for tests and local runs.
///
/// Balances are credited explicitly with [`SimulatedGateway::fund`]; sends
/// succeed unless failure injection is switched on.
#[derive(Default)]
pub struct SimulatedGateway {
    balances: RwLock<HashMap<String, Decimal>>,
    fail_sends: AtomicBool,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a simulated deposit to an address
    pub async fn fund(&self, address: &str, amount: Decimal) {
        let mut balances = self.balances.write().await;
        let balance = balances.entry(address.to_string()).or_insert(Decimal::ZERO);
        *balance += amount;
    }

    /// Make subsequent `send_payment` calls return no transaction hash
    pub fn set_send_failure(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CryptoGateway for SimulatedGateway {
    async fn generate_wallet(&self, currency: Currency) -> EscrowResult<WalletHandle> {
        let address = match currency {
            Currency::Bitcoin => format!("bc1q{}", hex_token(19)),
            Currency::Ethereum | Currency::Usdt => format!("0x{}", hex_token(20)),
        };
        Ok(WalletHandle {
            address,
            private_key: hex_token(32),
        })
    }

    async fn check_payment(
        &self,
        address: &str,
        expected_amount: Decimal,
        _currency: Currency,
    ) -> EscrowResult<bool> {
        let balances = self.balances.read().await;
        let balance = balances.get(address).copied().unwrap_or(Decimal::ZERO);
        Ok(balance >= expected_amount)
    }

    async fn send_payment(
        &self,
        from_address: &str,
        _from_key: &str,
        to_address: &str,
        amount: Decimal,
        currency: Currency,
    ) -> EscrowResult<Option<String>> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut balances = self.balances.write().await;
        if let Some(balance) = balances.get_mut(from_address) {
            *balance = (*balance - amount).max(Decimal::ZERO);
        }

        let tx_hash = format!("0x{}", hex_token(32));
        debug!(%from_address, %to_address, %amount, %currency, %tx_hash, "simulated send");
        Ok(Some(tx_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_wallet_address;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn generated_addresses_pass_validation() {
        let gateway = SimulatedGateway::new();
        for currency in [Currency::Bitcoin, Currency::Ethereum, Currency::Usdt] {
            let wallet = gateway.generate_wallet(currency).await.unwrap();
            assert!(
                validate_wallet_address(&wallet.address, currency),
                "bad {currency} address: {}",
                wallet.address
            );
        }
    }

    #[tokio::test]
    async fn payment_check_tracks_funding() {
        let gateway = SimulatedGateway::new();
        let wallet = gateway.generate_wallet(Currency::Usdt).await.unwrap();

        assert!(!gateway
            .check_payment(&wallet.address, dec!(102), Currency::Usdt)
            .await
            .unwrap());

        gateway.fund(&wallet.address, dec!(102)).await;
        assert!(gateway
            .check_payment(&wallet.address, dec!(102), Currency::Usdt)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn send_failure_injection() {
        let gateway = SimulatedGateway::new();
        gateway.set_send_failure(true);
        let result = gateway
            .send_payment("bc1qfrom", "key", "bc1qto", dec!(1), Currency::Bitcoin)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
