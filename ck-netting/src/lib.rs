//! Multilateral netting engine (C7): collapses a set of signed settlement
//! receipts into one signed IAN via bilateral cancellation.
//!
//! Grounded in `ibank_core::aggregation::UnifiedLedgerAssembler`'s shape:
//! gather inputs, normalize and sort them deterministically, derive one
//! canonical output, stamp it, done. Here the "connectors" are the caller-
//! supplied receipts rather than external systems, so there is no async
//! fan-out — only the dedup/sort/fold pipeline survives from the teacher.

use ck_canon::{canonicalize, CanonicalValue};
use ck_index::{IndexEngine, IndexError};
use ck_receipts::{fields, ReceiptError, ReceiptFactory};
use ck_storage::{InsertOutcome, KernelStorage, ReceiptStore, StorageError};
use ck_types::{Micros, NettingJob, NettingJobStatus, ReceiptEnvelope};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Per spec.md's design note: signature verification during netting is an
/// explicit argument on each call, never a process-wide switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationPolicy {
    Strict,
    TrustedInputs,
}

#[derive(Debug, Error)]
pub enum NettingError {
    #[error("receipt {0} failed signature verification")]
    SignatureInvalid(String),
    #[error("receipt {0} is missing a required payer/payee/amount_micros field")]
    MalformedReceipt(String),
    #[error("insufficient funds: wallet {wallet_id} has {current_balance}, fee is {fee}")]
    InsufficientFunds {
        wallet_id: String,
        current_balance: Micros,
        fee: Micros,
    },
    #[error(transparent)]
    Receipt(#[from] ReceiptError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct NettingOutcome {
    pub ian: ReceiptEnvelope,
    pub netting_hash: String,
    pub fee_charged_micros: Micros,
}

pub const DEFAULT_NETTING_FEE_BPS: u32 = 5;

pub struct NettingEngine<S: KernelStorage> {
    storage: Arc<S>,
    receipts: ReceiptFactory,
    index: Arc<IndexEngine<S>>,
    fee_bps: u32,
}

impl<S: KernelStorage> NettingEngine<S> {
    pub fn new(storage: Arc<S>, receipts: ReceiptFactory, index: Arc<IndexEngine<S>>) -> Self {
        Self {
            storage,
            receipts,
            index,
            fee_bps: DEFAULT_NETTING_FEE_BPS,
        }
    }

    pub fn with_fee_bps(mut self, fee_bps: u32) -> Self {
        self.fee_bps = fee_bps;
        self
    }

    pub async fn net(
        &self,
        agent: &str,
        receipts: Vec<ReceiptEnvelope>,
        request_hash: Option<String>,
        policy: VerificationPolicy,
    ) -> Result<NettingOutcome, NettingError> {
        if policy == VerificationPolicy::Strict {
            for r in &receipts {
                if !ck_crypto::verify(&r.receipt_hash, &r.kernel_signature, &r.kernel_pubkey) {
                    return Err(NettingError::SignatureInvalid(r.receipt_hash.clone()));
                }
            }
        }

        // Dedup by payload_hash (== receipt_hash, already content-addressed
        // by C1/C3) and sort ascending so submission order never affects the
        // resulting netting_hash.
        let mut by_hash: BTreeMap<String, ReceiptEnvelope> = BTreeMap::new();
        for r in receipts {
            by_hash.entry(r.receipt_hash.clone()).or_insert(r);
        }
        let sorted_hashes: Vec<String> = by_hash.keys().cloned().collect();

        let input_hash = request_hash.unwrap_or_else(|| {
            let body = CanonicalValue::map()
                .field("agent", CanonicalValue::str(agent))
                .field(
                    "receipt_hashes",
                    CanonicalValue::seq(sorted_hashes.iter().cloned().map(CanonicalValue::Str)),
                )
                .build();
            ck_crypto::hash(&canonicalize(&body))
        });

        if let Some(existing) = ReceiptStore::get_by_request_hash(self.storage.as_ref(), &input_hash).await? {
            tracing::debug!(input_hash, "netting request replayed");
            return Ok(NettingOutcome {
                netting_hash: existing.receipt_hash.clone(),
                ian: existing,
                fee_charged_micros: 0,
            });
        }

        let wallet_id = agent;
        let total_notional: Micros = by_hash.values().try_fold(0i64, |acc, r| {
            amount_micros(r).map(|amount| acc + amount)
        })?;
        let fee = ck_types::bps_of(self.fee_bps, total_notional);

        if fee > 0 {
            match self.storage.deduct(wallet_id, fee, "netting_fee", &input_hash).await? {
                ck_storage::DeductOutcome::Applied { .. } => {}
                ck_storage::DeductOutcome::InsufficientFunds { current_balance } => {
                    return Err(NettingError::InsufficientFunds {
                        wallet_id: wallet_id.to_string(),
                        current_balance,
                        fee,
                    });
                }
            }
        }

        match self
            .net_after_fee(agent, &by_hash, &sorted_hashes, &input_hash, fee)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracing::warn!(input_hash, error = %err, "netting job failed downstream of fee deduction, refunding");
                if fee > 0 {
                    self.storage
                        .credit(wallet_id, fee, ck_types::WalletTransactionKind::Credit, "netting_fee_refund", &input_hash)
                        .await?;
                }
                self.storage
                    .insert_job(NettingJob {
                        job_id: input_hash.clone(),
                        agent: agent.to_string(),
                        input_hash: input_hash.clone(),
                        receipt_hashes: sorted_hashes,
                        status: NettingJobStatus::Failed,
                        ian_payload: None,
                        fee_charged_micros: 0,
                    })
                    .await?;
                Err(err)
            }
        }
    }

    async fn net_after_fee(
        &self,
        agent: &str,
        by_hash: &BTreeMap<String, ReceiptEnvelope>,
        sorted_hashes: &[String],
        input_hash: &str,
        fee: Micros,
    ) -> Result<NettingOutcome, NettingError> {
        let net_obligations = bilateral_cancel(by_hash)?;
        let net_obligations_json = serde_json::to_value(
            net_obligations
                .iter()
                .map(|o| serde_json::json!({"debtor": o.debtor, "creditor": o.creditor, "amount_micros": o.amount_micros}))
                .collect::<Vec<_>>(),
        )
        .expect("obligation list serializes");
        let net_obligations_canonical = CanonicalValue::seq(net_obligations.iter().map(|o| {
            CanonicalValue::map()
                .field("debtor", CanonicalValue::str(&o.debtor))
                .field("creditor", CanonicalValue::str(&o.creditor))
                .field("amount_micros", CanonicalValue::Int(o.amount_micros))
                .build()
        }));

        let ian = self.receipts.seal(
            "IAN",
            input_hash,
            fields::ian(agent, sorted_hashes, net_obligations_canonical, fee),
        )?;
        // A concurrent caller racing the same `input_hash` wins the insert;
        // take whichever row actually landed as the canonical IAN.
        let ian = self.storage.insert_receipt(ian).await?.into_inner();

        match self
            .storage
            .insert_job(NettingJob {
                job_id: input_hash.to_string(),
                agent: agent.to_string(),
                input_hash: input_hash.to_string(),
                receipt_hashes: sorted_hashes.to_vec(),
                status: NettingJobStatus::Completed,
                ian_payload: Some(net_obligations_json),
                fee_charged_micros: fee,
            })
            .await?
        {
            InsertOutcome::Inserted(_) | InsertOutcome::AlreadyExists(_) => {}
        }

        self.index.submit("IAN", &ian.receipt_hash).await?;

        Ok(NettingOutcome {
            netting_hash: ian.receipt_hash.clone(),
            ian,
            fee_charged_micros: fee,
        })
    }
}

struct NetObligation {
    debtor: String,
    creditor: String,
    amount_micros: Micros,
}

fn amount_micros(receipt: &ReceiptEnvelope) -> Result<Micros, NettingError> {
    receipt
        .payload
        .get("amount_micros")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| NettingError::MalformedReceipt(receipt.receipt_hash.clone()))
}

fn payer_payee(receipt: &ReceiptEnvelope) -> Result<(String, String), NettingError> {
    let payer = receipt
        .payload
        .get("payer")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NettingError::MalformedReceipt(receipt.receipt_hash.clone()))?;
    let payee = receipt
        .payload
        .get("payee")
        .and_then(|v| v.as_str())
        .ok_or_else(|| NettingError::MalformedReceipt(receipt.receipt_hash.clone()))?;
    Ok((payer.to_string(), payee.to_string()))
}

/// Bilateral cancellation: `(A→B: x, B→A: y) ↦ (A→B: x−y)` if `x ≥ y`, else
/// `(B→A: y−x)`. Generalizes to an arbitrary receipt set by folding every
/// receipt into its unordered-pair bucket before resolving direction.
fn bilateral_cancel(
    by_hash: &BTreeMap<String, ReceiptEnvelope>,
) -> Result<Vec<NetObligation>, NettingError> {
    let mut pairwise: BTreeMap<(String, String), Micros> = BTreeMap::new();
    for receipt in by_hash.values() {
        let (payer, payee) = payer_payee(receipt)?;
        let amount = amount_micros(receipt)?;
        let key = if payer <= payee {
            (payer.clone(), payee.clone())
        } else {
            (payee.clone(), payer.clone())
        };
        let signed = if payer <= payee { amount } else { -amount };
        *pairwise.entry(key).or_insert(0) += signed;
    }

    let mut obligations = Vec::new();
    for ((a, b), net) in pairwise {
        match net.cmp(&0) {
            std::cmp::Ordering::Greater => obligations.push(NetObligation {
                debtor: a,
                creditor: b,
                amount_micros: net,
            }),
            std::cmp::Ordering::Less => obligations.push(NetObligation {
                debtor: b,
                creditor: a,
                amount_micros: -net,
            }),
            std::cmp::Ordering::Equal => {}
        }
    }
    Ok(obligations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_storage::InMemoryKernelStorage;
    use ck_types::WalletTransactionKind;

    async fn harness() -> (NettingEngine<InMemoryKernelStorage>, ReceiptFactory, Arc<InMemoryKernelStorage>) {
        let storage = Arc::new(InMemoryKernelStorage::new());
        let (private, public) = ck_crypto::generate_keypair();
        let receipts = ReceiptFactory::new(private.clone(), public.clone());
        let index = Arc::new(IndexEngine::new(storage.clone(), private.clone(), public.clone()));
        index.open_window().await.unwrap();
        storage
            .credit("agent:a", 1_000_000_000, WalletTransactionKind::Credit, "seed", "seed-1")
            .await
            .unwrap();
        let engine = NettingEngine::new(storage.clone(), ReceiptFactory::new(private, public), index);
        (engine, receipts, storage)
    }

    fn msr(receipts: &ReceiptFactory, payer: &str, payee: &str, amount: Micros, request_hash: &str) -> ReceiptEnvelope {
        receipts
            .seal("MSR", request_hash, fields::msr(payer, payee, amount, None, None))
            .unwrap()
    }

    #[tokio::test]
    async fn two_offsetting_receipts_net_to_one_obligation() {
        let (engine, receipts, _storage) = harness().await;
        let r1 = msr(&receipts, "agent:a", "agent:b", 50, "msr-1");
        let r2 = msr(&receipts, "agent:b", "agent:a", 20, "msr-2");

        let outcome = engine
            .net("agent:a", vec![r1, r2], Some("net-1".to_string()), VerificationPolicy::Strict)
            .await
            .unwrap();

        let obligations = outcome.ian.payload.get("net_obligations").unwrap().as_array().unwrap();
        assert_eq!(obligations.len(), 1);
        assert_eq!(obligations[0]["debtor"], "agent:a");
        assert_eq!(obligations[0]["creditor"], "agent:b");
        assert_eq!(obligations[0]["amount_micros"], 30);
    }

    #[tokio::test]
    async fn reversed_submission_order_yields_same_netting_hash() {
        let (engine, receipts, _storage) = harness().await;
        let r1 = msr(&receipts, "agent:a", "agent:b", 50, "msr-1");
        let r2 = msr(&receipts, "agent:b", "agent:a", 20, "msr-2");

        let forward = engine
            .net("agent:a", vec![r1.clone(), r2.clone()], Some("net-a".to_string()), VerificationPolicy::Strict)
            .await
            .unwrap();
        let reversed = engine
            .net("agent:a", vec![r2, r1], Some("net-b".to_string()), VerificationPolicy::Strict)
            .await
            .unwrap();

        assert_eq!(
            forward.ian.payload["net_obligations"],
            reversed.ian.payload["net_obligations"]
        );
    }

    #[tokio::test]
    async fn replayed_request_hash_charges_no_fee() {
        let (engine, receipts, _storage) = harness().await;
        let r1 = msr(&receipts, "agent:a", "agent:b", 50, "msr-1");

        let first = engine
            .net("agent:a", vec![r1.clone()], Some("net-1".to_string()), VerificationPolicy::Strict)
            .await
            .unwrap();
        assert!(first.fee_charged_micros > 0);

        let replay = engine
            .net("agent:a", vec![r1], Some("net-1".to_string()), VerificationPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(replay.fee_charged_micros, 0);
        assert_eq!(replay.netting_hash, first.netting_hash);
    }

    #[tokio::test]
    async fn empty_receipt_list_yields_empty_obligations_and_zero_fee() {
        let (engine, _receipts, _storage) = harness().await;
        let outcome = engine
            .net("agent:a", vec![], Some("net-empty".to_string()), VerificationPolicy::Strict)
            .await
            .unwrap();
        assert_eq!(outcome.fee_charged_micros, 0);
        assert!(outcome.ian.payload["net_obligations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tampered_signature_rejected_under_strict_policy() {
        let (engine, receipts, _storage) = harness().await;
        let mut r1 = msr(&receipts, "agent:a", "agent:b", 50, "msr-1");
        r1.kernel_signature = "00".repeat(64);

        let err = engine
            .net("agent:a", vec![r1], Some("net-1".to_string()), VerificationPolicy::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, NettingError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn trusted_inputs_policy_skips_signature_check() {
        let (engine, receipts, _storage) = harness().await;
        let mut r1 = msr(&receipts, "agent:a", "agent:b", 50, "msr-1");
        r1.kernel_signature = "00".repeat(64);

        engine
            .net("agent:a", vec![r1], Some("net-1".to_string()), VerificationPolicy::TrustedInputs)
            .await
            .unwrap();
    }
}
