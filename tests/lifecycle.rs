//! End-to-end lifecycle tests driving the assembled escrow node

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use custodia::disputes::ResolutionAction;
use custodia::gateway::SimulatedGateway;
use custodia::models::{Currency, DisputeStatus, TransactionStatus};
use custodia::node::{EngineResponse, EscrowNode, NodeConfig, TransactionSummary};
use custodia::notify::MemorySink;
use custodia::secrets::MemoryVault;
use custodia::store::{EscrowStore, MemoryStore};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

struct Harness {
    node: Arc<EscrowNode>,
    store: Arc<MemoryStore>,
    gateway: Arc<SimulatedGateway>,
    sink: Arc<MemorySink>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(SimulatedGateway::new());
    let sink = Arc::new(MemorySink::new());
    let node = Arc::new(EscrowNode::new(
        NodeConfig::default(),
        store.clone(),
        gateway.clone(),
        Arc::new(MemoryVault::new()),
        sink.clone(),
    ));
    Harness {
        node,
        store,
        gateway,
        sink,
    }
}

fn tx_id(response: &EngineResponse) -> Uuid {
    response.data.as_ref().unwrap()["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap()
}

/// Drive a trade from creation into escrow: create, join, set payout
/// address, fund the escrow wallet, sweep.
async fn escrow_trade(h: &Harness, amount: Decimal) -> Result<(Uuid, Uuid, Uuid)> {
    let seller = Uuid::new_v4();
    let buyer = Uuid::new_v4();

    let created = h
        .node
        .create_trade(
            seller,
            "Software license key".into(),
            Some("Single-seat perpetual license, delivered by chat".into()),
            amount,
            Currency::Usdt,
        )
        .await;
    assert!(created.success, "{}", created.message);
    let id = tx_id(&created);

    let joined = h.node.join_trade(id, buyer).await;
    assert!(joined.success, "{}", joined.message);

    let payout = h
        .node
        .set_seller_payout_address(id, seller, format!("0x{:0>40}", "beef"))
        .await;
    assert!(payout.success, "{}", payout.message);

    let tx = h.store.transaction(id).await?.unwrap();
    h.gateway.fund(&tx.escrow_address, tx.expected_deposit()).await;
    let report = h.node.payment_monitor().sweep_once().await?;
    assert_eq!(report.payments_confirmed, 1);

    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::InEscrow);
    Ok((id, seller, buyer))
}

async fn age_dispute(h: &Harness, dispute_id: Uuid, days: i64) -> Result<()> {
    let mut dispute = h.store.dispute(dispute_id).await?.unwrap();
    dispute.created_at = Utc::now() - chrono::Duration::days(days);
    h.store.commit_dispute(dispute).await?;
    Ok(())
}

#[tokio::test]
async fn full_happy_path() -> Result<()> {
    let h = harness();
    let (id, seller, buyer) = escrow_trade(&h, dec!(100)).await?;

    // Commission was fixed at confirmation: 2% of 100
    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.commission_amount, dec!(2.00));

    let released = h.node.release(id, false).await;
    assert!(released.success, "{}", released.message);

    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert!(tx.blockchain_tx_hash.is_some());
    assert!(tx.completed_at.is_some());

    // Reputation awarded to both parties
    let seller_user = h.store.user(seller).await?.unwrap();
    assert!((seller_user.reputation_score - 0.1).abs() < 1e-9);
    let buyer_user = h.store.user(buyer).await?.unwrap();
    assert!((buyer_user.reputation_score - 0.05).abs() < 1e-9);

    // Payment-confirmed and completion notifications for both parties
    assert!(h.sink.sent_to(seller).await.len() >= 2);
    assert!(h.sink.sent_to(buyer).await.len() >= 2);

    let response = h.node.transaction_summary().await;
    assert!(response.success, "{}", response.message);
    let summary: TransactionSummary = serde_json::from_value(response.data.unwrap())?;
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.volume_by_currency["usdt"], dec!(100));
    Ok(())
}

#[tokio::test]
async fn small_dispute_auto_resolves_to_completed() -> Result<()> {
    let h = harness();
    let (id, _, buyer) = escrow_trade(&h, dec!(30)).await?;

    let opened = h
        .node
        .create_dispute(id, buyer, "not delivered".into(), "Seller stopped responding".into())
        .await;
    assert!(opened.success, "{}", opened.message);
    let dispute_id: Uuid = opened.data.as_ref().unwrap()["dispute_id"]
        .as_str()
        .unwrap()
        .parse()?;

    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Disputed);

    age_dispute(&h, dispute_id, 15).await?;
    let resolved = h.node.dispute_engine().auto_resolve_once().await?;
    assert_eq!(resolved, 1);

    let dispute = h.store.dispute(dispute_id).await?.unwrap();
    assert_eq!(dispute.status, DisputeStatus::Resolved);
    assert!(dispute
        .resolution_notes
        .as_deref()
        .unwrap()
        .contains("small-amount"));

    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn large_dispute_waits_for_admin() -> Result<()> {
    let h = harness();
    let (id, _, buyer) = escrow_trade(&h, dec!(1000)).await?;

    let opened = h
        .node
        .create_dispute(id, buyer, "wrong item".into(), "Received the wrong product entirely".into())
        .await;
    assert!(opened.success, "{}", opened.message);
    let dispute_id: Uuid = opened.data.as_ref().unwrap()["dispute_id"]
        .as_str()
        .unwrap()
        .parse()?;

    age_dispute(&h, dispute_id, 30).await?;
    assert_eq!(h.node.dispute_engine().auto_resolve_once().await?, 0);

    let dispute = h.store.dispute(dispute_id).await?.unwrap();
    assert_eq!(dispute.status, DisputeStatus::Open);
    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Disputed);

    // An admin refund settles it in the buyer's favor
    let resolved = h
        .node
        .resolve_dispute(
            dispute_id,
            ResolutionAction::Refund,
            "Photos confirm the wrong item was shipped".into(),
        )
        .await;
    assert!(resolved.success, "{}", resolved.message);
    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Refunded);
    Ok(())
}

#[tokio::test]
async fn split_boundary_amount_stays_open() -> Result<()> {
    let h = harness();
    // Exactly 200.00 sits at the split ceiling and must not auto-resolve
    let (id, _, buyer) = escrow_trade(&h, dec!(200.00)).await?;

    let opened = h
        .node
        .create_dispute(id, buyer, "quality".into(), "Item arrived damaged in transit".into())
        .await;
    let dispute_id: Uuid = opened.data.as_ref().unwrap()["dispute_id"]
        .as_str()
        .unwrap()
        .parse()?;

    age_dispute(&h, dispute_id, 15).await?;
    assert_eq!(h.node.dispute_engine().auto_resolve_once().await?, 0);
    let dispute = h.store.dispute(dispute_id).await?.unwrap();
    assert_eq!(dispute.status, DisputeStatus::Open);
    Ok(())
}

#[tokio::test]
async fn concurrent_release_completes_exactly_once() -> Result<()> {
    let h = harness();
    let (id, _, _) = escrow_trade(&h, dec!(100)).await?;

    let a = tokio::spawn({
        let node = h.node.clone();
        async move { node.release(id, false).await }
    });
    let b = tokio::spawn({
        let node = h.node.clone();
        async move { node.release(id, false).await }
    });
    let (a, b) = (a.await?, b.await?);

    assert_ne!(a.success, b.success, "exactly one release must win");
    let loser = if a.success { &b } else { &a };
    assert!(loser.message.contains("not in escrow status"));

    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn refund_from_escrow_keeps_commission_out() -> Result<()> {
    let h = harness();
    let (id, _, buyer) = escrow_trade(&h, dec!(100)).await?;

    let refunded = h.node.refund(id, "buyer and seller agreed to cancel").await;
    assert!(refunded.success, "{}", refunded.message);

    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Refunded);

    // The refund message quotes the trade amount, not amount plus commission
    let messages = h.sink.sent_to(buyer).await;
    assert!(messages
        .iter()
        .any(|n| n.message.contains("USDT 100.00")));
    Ok(())
}

#[tokio::test]
async fn disputed_trade_cannot_be_released() -> Result<()> {
    let h = harness();
    let (id, _, buyer) = escrow_trade(&h, dec!(100)).await?;

    let opened = h
        .node
        .create_dispute(id, buyer, "not delivered".into(), "No delivery after a week".into())
        .await;
    assert!(opened.success, "{}", opened.message);

    let released = h.node.release(id, false).await;
    assert!(!released.success);
    assert!(released.message.contains("not in escrow status"));

    let tx = h.store.transaction(id).await?.unwrap();
    assert_eq!(tx.status, TransactionStatus::Disputed);
    Ok(())
}
