//! End-to-end scenario tests exercising the kernel facade the way an
//! embedder would: through `ck_kernel::KernelDispatcher` alone, never
//! reaching into a domain crate directly.

use ck_kernel::{
    fields, CollateralAssetType, KernelDispatcher, KernelError, KernelStorage, ReceiptFactory,
    VerificationPolicy,
};
use ck_storage::InMemoryKernelStorage;
use ck_types::{Agent, WalletTransactionKind};
use std::sync::Arc;

/// A test harness keeps its own handle on the storage backing a dispatcher:
/// the dispatcher's own field is private (an embedder reaches storage only
/// through dispatcher methods), so setup that needs to seed balances or
/// agents directly goes through a second `Arc` clone handed to `new`.
fn harness() -> (KernelDispatcher<InMemoryKernelStorage>, Arc<InMemoryKernelStorage>) {
    let storage = Arc::new(InMemoryKernelStorage::new());
    let (sk, pk) = ck_crypto::generate_keypair();
    let dispatcher = KernelDispatcher::new(storage.clone(), sk, pk, "wallet:treasury", "https://billing.example/topup");
    (dispatcher, storage)
}

async fn fund(storage: &InMemoryKernelStorage, wallet: &str, amount: i64) {
    storage
        .credit(wallet, amount, WalletTransactionKind::Credit, "topup", "seed")
        .await
        .unwrap();
}

async fn register(storage: &InMemoryKernelStorage, agent_id: &str) {
    storage
        .put_agent(Agent::new(agent_id, agent_id, "pubkey-stub"))
        .await
        .unwrap();
}

async fn seal(d: &KernelDispatcher<InMemoryKernelStorage>, target: &str) {
    d.issue_seal(target, "conformance-hash", target, &format!("req-seal-{target}"))
        .await
        .unwrap();
}

// S1: a replayed draw with the same request_hash returns the identical
// position and charges no second fee.
#[tokio::test]
async fn idempotent_draw() {
    let (d, storage) = harness();
    fund(&storage, "agent:borrower", 2_000 * ck_types::USD).await;
    seal(&d, "agent:borrower").await;

    let opened = d
        .line_open("agent:borrower", "agent:lender", 1_000 * ck_types::USD, None, None, None, "req-open-1")
        .await
        .unwrap();
    let credit_line_id = opened.receipt.payload["credit_line_id"].as_str().unwrap().to_string();

    let first = d
        .draw(&credit_line_id, "agent:borrower", 400 * ck_types::USD, "req-draw-1")
        .await
        .unwrap();
    assert_eq!(first.position.principal_micros, 400 * ck_types::USD);
    assert!(first.fee_charged_micros > 0);

    let replayed = d
        .draw(&credit_line_id, "agent:borrower", 400 * ck_types::USD, "req-draw-1")
        .await
        .unwrap();
    assert_eq!(replayed.position.principal_micros, 400 * ck_types::USD);
    assert_eq!(replayed.fee_charged_micros, 0);
    assert_eq!(replayed.receipt.receipt_hash, first.receipt.receipt_hash);
}

// S2: two offsetting settlement receipts net down to one obligation in the
// lesser direction, and the netting job is submitted into the index as an
// IAN leaf.
#[tokio::test]
async fn nets_two_offsetting_receipts() {
    let (d, storage) = harness();
    register(&storage, "agent:a").await;
    register(&storage, "agent:b").await;
    fund(&storage, "agent:a", 1_000 * ck_types::USD).await;

    let (sk, pk) = ck_crypto::generate_keypair();
    let receipts = ReceiptFactory::new(sk, pk);
    let r1 = receipts
        .seal("MSR", "msr-1", fields::msr("agent:a", "agent:b", 50 * ck_types::USD, None, None))
        .unwrap();
    let r2 = receipts
        .seal("MSR", "msr-2", fields::msr("agent:b", "agent:a", 20 * ck_types::USD, None, None))
        .unwrap();

    d.index_open_window().await.unwrap();

    let outcome = d
        .net("agent:a", vec![r1, r2], Some("net-1".to_string()), VerificationPolicy::Strict)
        .await
        .unwrap();

    let obligations = outcome.ian.payload["net_obligations"].as_array().unwrap();
    assert_eq!(obligations.len(), 1);
    assert_eq!(obligations[0]["debtor"], "agent:a");
    assert_eq!(obligations[0]["creditor"], "agent:b");
    assert_eq!(obligations[0]["amount_micros"], 30 * ck_types::USD);
    assert!(outcome.fee_charged_micros > 0);
}

// S3: a submitted leaf is provably included in its window's closed root,
// and tampering with the proof invalidates it.
#[tokio::test]
async fn merkle_inclusion() {
    let (d, _storage) = harness();
    d.index_open_window().await.unwrap();

    let ack_a = d.index_submit("MSR", "payload-hash-a").await.unwrap();
    let ack_b = d.index_submit("MSR", "payload-hash-b").await.unwrap();
    let ack_c = d.index_submit("MSR", "payload-hash-c").await.unwrap();

    let window = d.index_close_window().await.unwrap();
    let root_hash = window.root_hash.clone().unwrap();

    for ack in [&ack_a, &ack_b, &ack_c] {
        let proof = d.index_proof(&window.window_id, &ack.leaf_hash).await.unwrap().unwrap();
        assert!(d.index_verify_proof(&ack.leaf_hash, &proof, &root_hash));
    }

    let mut tampered = d.index_proof(&window.window_id, &ack_a.leaf_hash).await.unwrap().unwrap();
    if let Some(step) = tampered.path.first_mut() {
        step.sibling = "00".repeat(32);
    }
    assert!(!d.index_verify_proof(&ack_a.leaf_hash, &tampered, &root_hash));
}

// S4: an undercollateralized line runs fees, interest, and principal off
// in that order during liquidation and lands in the terminal state.
#[tokio::test]
async fn liquidation_waterfall() {
    let (d, storage) = harness();
    seal(&d, "agent:borrower").await;
    fund(&storage, "agent:borrower", 10_000 * ck_types::USD).await;

    let opened = d
        .line_open("agent:borrower", "agent:lender", 1_000 * ck_types::USD, None, None, None, "req-open-1")
        .await
        .unwrap();
    let credit_line_id = opened.receipt.payload["credit_line_id"].as_str().unwrap().to_string();

    d.draw(&credit_line_id, "agent:borrower", 100 * ck_types::USD, "req-draw-1")
        .await
        .unwrap();
    d.fee_apply(&credit_line_id, "origination", 5 * ck_types::USD, None, "req-fee-1")
        .await
        .unwrap();
    d.collateral_lock(&credit_line_id, "asset:1", CollateralAssetType::External, 80 * ck_types::USD, "req-lock-1")
        .await
        .unwrap();

    let call = d
        .margin_call(&credit_line_id, "call", None, Some(50 * ck_types::USD), Some(0), "req-margin-1")
        .await
        .unwrap();
    let margin_call_id = call.receipt.payload["margin_call_id"].as_str().unwrap().to_string();

    let liquidated = d.liquidate(&credit_line_id, &margin_call_id, "req-liq-1").await.unwrap();
    assert_eq!(liquidated.position.principal_micros, 0);
    assert_eq!(liquidated.receipt.receipt_type, "FC");
}

// S5: an underfunded agent calling a paid operation gets a structured
// CreditRequired hint, never a generic error, and the call leaves no trace.
#[tokio::test]
async fn paywall_rejects_insufficient_balance() {
    let (d, storage) = harness();
    seal(&d, "agent:borrower").await;
    fund(&storage, "agent:borrower", 2_000 * ck_types::USD).await;

    let opened = d
        .line_open("agent:borrower", "agent:lender", 1_000 * ck_types::USD, None, None, None, "req-open-1")
        .await
        .unwrap();
    let credit_line_id = opened.receipt.payload["credit_line_id"].as_str().unwrap().to_string();

    // drain the wallet to exactly 500_000 micros, below the 100M margin-call fee.
    let balance = d.credit_balance("agent:borrower").await.unwrap();
    storage
        .deduct("agent:borrower", balance - 500_000, "drain", "req-drain")
        .await
        .unwrap();
    assert_eq!(d.credit_balance("agent:borrower").await.unwrap(), 500_000);

    let err = d
        .margin_call(&credit_line_id, "call", None, Some(50 * ck_types::USD), Some(0), "req-margin-1")
        .await
        .unwrap_err();

    match err {
        KernelError::CreditRequired { required, current_balance, purchase_url } => {
            assert_eq!(required, 100_000_000);
            assert_eq!(current_balance, 500_000);
            assert!(purchase_url.contains("billing.example"));
        }
        other => panic!("expected CreditRequired, got {other:?}"),
    }

    // no state change: no margin call was persisted, wallet untouched.
    assert_eq!(d.credit_balance("agent:borrower").await.unwrap(), 500_000);
}

// S6: an unsealed agent cannot open a credit line; the gate fires before
// any wallet deduction or receipt is produced.
#[tokio::test]
async fn seal_gate_blocks_unsealed_agent() {
    let (d, storage) = harness();
    fund(&storage, "agent:borrower", 2_000 * ck_types::USD).await;
    let balance_before = d.credit_balance("agent:borrower").await.unwrap();

    let err = d
        .line_open("agent:borrower", "agent:lender", 1_000 * ck_types::USD, None, None, None, "req-open-1")
        .await
        .unwrap_err();

    assert!(matches!(err, KernelError::SealRequired { .. }));
    assert_eq!(d.credit_balance("agent:borrower").await.unwrap(), balance_before);
}
