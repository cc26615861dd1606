//! Notification sink boundary
//!
//! Delivery is fire-and-forget and decoupled from the state commit: a crash
//! between commit and notify loses the message, never the transition.

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Notification, NotificationKind};
use crate::EscrowResult;

/// Durable-ish delivery of user-facing messages
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn enqueue(
        &self,
        user_id: Uuid,
        transaction_id: Option<Uuid>,
        message: String,
        kind: NotificationKind,
    ) -> EscrowResult<()>;
}

/// In-memory sink capturing notifications for tests and local runs
#[derive(Default)]
pub struct MemorySink {
    sent: RwLock<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything enqueued so far
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    pub async fn sent_to(&self, user_id: Uuid) -> Vec<Notification> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn enqueue(
        &self,
        user_id: Uuid,
        transaction_id: Option<Uuid>,
        message: String,
        kind: NotificationKind,
    ) -> EscrowResult<()> {
        self.sent
            .write()
            .await
            .push(Notification::new(user_id, transaction_id, message, kind));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_per_user() {
        let sink = MemorySink::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        sink.enqueue(alice, None, "hello".into(), NotificationKind::PaymentConfirmed)
            .await
            .unwrap();
        sink.enqueue(bob, None, "other".into(), NotificationKind::TradeCompleted)
            .await
            .unwrap();

        assert_eq!(sink.sent().await.len(), 2);
        let for_alice = sink.sent_to(alice).await;
        assert_eq!(for_alice.len(), 1);
        assert_eq!(for_alice[0].message, "hello");
    }
}
