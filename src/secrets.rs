//! Secret store boundary for escrow private keys
//!
//! The escrow wallet key is encrypted the moment a wallet is generated and
//! only decrypted inside a single release attempt. A decrypt failure is
//! fatal for that attempt and is never papered over with a default key.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EscrowError;
use crate::EscrowResult;

const HANDLE_PREFIX: &str = "vault:";

/// Encrypts and decrypts escrow private keys
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Encrypt a plaintext key, returning an opaque ciphertext handle
    async fn encrypt(&self, plaintext: &str) -> EscrowResult<String>;

    /// Decrypt a ciphertext handle back into the plaintext key.
    ///
    /// Fails with [`EscrowError::CryptoIntegrity`] on malformed or unknown
    /// input.
    async fn decrypt(&self, ciphertext: &str) -> EscrowResult<String>;
}

/// Process-local vault keeping key material out of the persisted records.
///
/// Handles look like `vault:<uuid>`; the plaintext never leaves this module
/// except through `decrypt`.
#[derive(Default)]
pub struct MemoryVault {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemoryVault {
    async fn encrypt(&self, plaintext: &str) -> EscrowResult<String> {
        let handle = format!("{HANDLE_PREFIX}{}", Uuid::new_v4());
        self.secrets
            .write()
            .await
            .insert(handle.clone(), plaintext.to_string());
        Ok(handle)
    }

    async fn decrypt(&self, ciphertext: &str) -> EscrowResult<String> {
        if !ciphertext.starts_with(HANDLE_PREFIX) {
            return Err(EscrowError::crypto_integrity("malformed ciphertext handle"));
        }
        self.secrets
            .read()
            .await
            .get(ciphertext)
            .cloned()
            .ok_or_else(|| EscrowError::crypto_integrity("unknown ciphertext handle"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let vault = MemoryVault::new();
        let handle = vault.encrypt("super-secret-key").await.unwrap();
        assert!(handle.starts_with(HANDLE_PREFIX));
        assert_ne!(handle, "super-secret-key");
        assert_eq!(vault.decrypt(&handle).await.unwrap(), "super-secret-key");
    }

    #[tokio::test]
    async fn malformed_handle_is_integrity_error() {
        let vault = MemoryVault::new();
        let err = vault.decrypt("not-a-handle").await.unwrap_err();
        assert!(matches!(err, EscrowError::CryptoIntegrity(_)));

        let err = vault
            .decrypt(&format!("{HANDLE_PREFIX}{}", Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::CryptoIntegrity(_)));
    }
}
