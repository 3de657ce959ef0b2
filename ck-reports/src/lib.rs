//! MBS/ALR statement derivation (C10): folds a caller-supplied set of
//! kernel-signed IAN receipts into a signed Merchant Balance Statement or
//! Agent Ledger Report for one agent. Grounded in
//! `ibank_core::aggregation::UnifiedLedgerAssembler`'s gather-normalize-
//! derive-stamp shape: every input receipt is independently verified before
//! it is folded in, the fold itself is a pure function of the sorted input,
//! and the one signed output is produced at the end — never incrementally
//! mutated and re-signed.

use ck_canon::CanonicalValue;
use ck_receipts::{fields, ReceiptError, ReceiptFactory};
use ck_storage::{KernelStorage, ReceiptStore, StorageError};
use ck_types::{Micros, ReceiptEnvelope};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportsError {
    #[error("no seal on file for agent {0}")]
    SealRequired(String),

    #[error("wallet {wallet_id} balance {current_balance} is below the pack_team threshold {required}")]
    BelowThreshold {
        wallet_id: String,
        current_balance: Micros,
        required: Micros,
    },

    #[error("receipt {0} is not a kernel-signed IAN receipt")]
    NotAnIan(String),

    #[error("receipt {0} signature does not verify under the kernel's own key")]
    SignatureInvalid(String),

    #[error("malformed IAN payload in receipt {0}: {1}")]
    MalformedReceipt(String, String),

    #[error("unsupported export format {0:?}, expected \"json\" or \"csv\"")]
    UnsupportedFormat(String),

    #[error("wallet {wallet_id} balance {current_balance} is below required fee {required}")]
    InsufficientFunds {
        wallet_id: String,
        current_balance: Micros,
        required: Micros,
    },

    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy)]
pub struct ReportsConfig {
    pub pack_team_threshold_micros: Micros,
    pub mbs_fee_micros: Micros,
    pub alr_fee_micros: Micros,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            pack_team_threshold_micros: 25_000 * ck_types::USD,
            mbs_fee_micros: 100 * ck_types::USD,
            alr_fee_micros: 100 * ck_types::USD,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Ledger {
    total_receivable_micros: Micros,
    total_payable_micros: Micros,
    /// Net position per counterparty: positive means the counterparty owes
    /// the agent, negative means the agent owes the counterparty.
    counterparty_positions: BTreeMap<String, i64>,
    line_items: Vec<LineItem>,
}

#[derive(Debug, Clone)]
struct LineItem {
    receipt_hash: String,
    timestamp_ms: i64,
    counterparty: String,
    amount_micros: Micros,
    direction: &'static str,
}

pub struct ReportsEngine<S: KernelStorage> {
    storage: Arc<S>,
    receipts: ReceiptFactory,
    config: ReportsConfig,
}

impl<S: KernelStorage> ReportsEngine<S> {
    pub fn new(storage: Arc<S>, receipts: ReceiptFactory) -> Self {
        Self {
            storage,
            receipts,
            config: ReportsConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ReportsConfig) -> Self {
        self.config = config;
        self
    }

    async fn check_preconditions(&self, agent: &str) -> Result<(), ReportsError> {
        if self.storage.get_seal(agent).await?.is_none() {
            return Err(ReportsError::SealRequired(agent.to_string()));
        }
        let balance = self.storage.get_balance(agent).await?;
        if balance < self.config.pack_team_threshold_micros {
            return Err(ReportsError::BelowThreshold {
                wallet_id: agent.to_string(),
                current_balance: balance,
                required: self.config.pack_team_threshold_micros,
            });
        }
        Ok(())
    }

    async fn charge_fee(&self, agent: &str, amount: Micros, reference_type: &str, request_hash: &str) -> Result<(), ReportsError> {
        match self.storage.deduct(agent, amount, reference_type, request_hash).await? {
            ck_storage::DeductOutcome::Applied { .. } => Ok(()),
            ck_storage::DeductOutcome::InsufficientFunds { current_balance } => Err(ReportsError::InsufficientFunds {
                wallet_id: agent.to_string(),
                current_balance,
                required: amount,
            }),
        }
    }

    /// Verifies `receipt` is a kernel-signed IAN, then folds it into `ledger`
    /// if an optional period window is supplied and the receipt falls inside
    /// it (ALR); MBS passes `period` as `None` to include everything.
    fn fold_ian(
        &self,
        agent: &str,
        receipt: &ReceiptEnvelope,
        period: Option<(i64, i64)>,
        ledger: &mut Ledger,
    ) -> Result<(), ReportsError> {
        if receipt.receipt_type != "IAN" {
            return Err(ReportsError::NotAnIan(receipt.receipt_hash.clone()));
        }
        if !ck_crypto::verify(&receipt.receipt_hash, &receipt.kernel_signature, self.receipts.kernel_pubkey_hex()) {
            return Err(ReportsError::SignatureInvalid(receipt.receipt_hash.clone()));
        }
        if let Some((start, end)) = period {
            if receipt.timestamp_ms < start || receipt.timestamp_ms > end {
                return Ok(());
            }
        }

        let obligations = receipt
            .payload
            .get("net_obligations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ReportsError::MalformedReceipt(receipt.receipt_hash.clone(), "missing net_obligations array".into()))?;

        for entry in obligations {
            let debtor = entry
                .get("debtor")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ReportsError::MalformedReceipt(receipt.receipt_hash.clone(), "obligation missing debtor".into()))?;
            let creditor = entry
                .get("creditor")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ReportsError::MalformedReceipt(receipt.receipt_hash.clone(), "obligation missing creditor".into()))?;
            let amount = entry
                .get("amount_micros")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| ReportsError::MalformedReceipt(receipt.receipt_hash.clone(), "obligation missing amount_micros".into()))?;

            if creditor == agent {
                ledger.total_receivable_micros += amount;
                *ledger.counterparty_positions.entry(debtor.to_string()).or_insert(0) += amount;
                ledger.line_items.push(LineItem {
                    receipt_hash: receipt.receipt_hash.clone(),
                    timestamp_ms: receipt.timestamp_ms,
                    counterparty: debtor.to_string(),
                    amount_micros: amount,
                    direction: "receivable",
                });
            } else if debtor == agent {
                ledger.total_payable_micros += amount;
                *ledger.counterparty_positions.entry(creditor.to_string()).or_insert(0) -= amount;
                ledger.line_items.push(LineItem {
                    receipt_hash: receipt.receipt_hash.clone(),
                    timestamp_ms: receipt.timestamp_ms,
                    counterparty: creditor.to_string(),
                    amount_micros: amount,
                    direction: "payable",
                });
            }
        }
        Ok(())
    }

    fn counterparty_positions_canonical(ledger: &Ledger) -> CanonicalValue {
        let mut builder = CanonicalValue::map();
        for (counterparty, delta) in &ledger.counterparty_positions {
            builder = builder.field(counterparty.clone(), CanonicalValue::Int(*delta));
        }
        builder.build()
    }

    /// Merchant Balance Statement: the whole of the supplied IAN set, no
    /// period filter. `pending_receipt_count` is caller-supplied context
    /// (non-audit receipts outstanding), folded into the signed output
    /// verbatim rather than derived here.
    pub async fn derive_mbs(
        &self,
        agent: &str,
        ian_receipts: &[ReceiptEnvelope],
        as_of_epoch_ms: i64,
        include_pending: bool,
        pending_receipt_count: u64,
        request_hash: &str,
    ) -> Result<ReceiptEnvelope, ReportsError> {
        if let Some(existing) = ReceiptStore::get_by_request_hash(self.storage.as_ref(), request_hash).await? {
            return Ok(existing);
        }

        self.check_preconditions(agent).await?;
        self.charge_fee(agent, self.config.mbs_fee_micros, "mbs_query", request_hash).await?;

        let mut ledger = Ledger::default();
        let mut sorted = ian_receipts.to_vec();
        sorted.sort_by(|a, b| a.receipt_hash.cmp(&b.receipt_hash));
        for receipt in &sorted {
            self.fold_ian(agent, receipt, None, &mut ledger)?;
        }

        let receipt = self.receipts.seal(
            "MBS",
            request_hash,
            fields::mbs(
                agent,
                ledger.total_receivable_micros,
                ledger.total_payable_micros,
                Self::counterparty_positions_canonical(&ledger),
                as_of_epoch_ms,
                include_pending,
                pending_receipt_count,
            ),
        )?;
        let receipt = self.storage.insert_receipt(receipt).await?.into_inner();
        tracing::debug!(agent, total_receivable = ledger.total_receivable_micros, total_payable = ledger.total_payable_micros, "MBS derived");
        Ok(receipt)
    }

    /// Agent Ledger Report: MBS plus period filtering, per-receipt line
    /// items, and a richer per-counterparty breakdown (receivable and
    /// payable tracked separately rather than netted).
    #[allow(clippy::too_many_arguments)]
    pub async fn derive_alr(
        &self,
        agent: &str,
        ian_receipts: &[ReceiptEnvelope],
        period_start_ms: i64,
        period_end_ms: i64,
        format: &str,
        request_hash: &str,
    ) -> Result<ReceiptEnvelope, ReportsError> {
        if let Some(existing) = ReceiptStore::get_by_request_hash(self.storage.as_ref(), request_hash).await? {
            return Ok(existing);
        }
        if format != "json" && format != "csv" {
            return Err(ReportsError::UnsupportedFormat(format.to_string()));
        }
        self.check_preconditions(agent).await?;
        self.charge_fee(agent, self.config.alr_fee_micros, "alr_generate", request_hash).await?;

        let mut ledger = Ledger::default();
        let mut sorted = ian_receipts.to_vec();
        sorted.sort_by(|a, b| a.receipt_hash.cmp(&b.receipt_hash));
        for receipt in &sorted {
            self.fold_ian(agent, receipt, Some((period_start_ms, period_end_ms)), &mut ledger)?;
        }

        let mut breakdown: BTreeMap<String, (Micros, Micros)> = BTreeMap::new();
        for item in &ledger.line_items {
            let entry = breakdown.entry(item.counterparty.clone()).or_insert((0, 0));
            match item.direction {
                "receivable" => entry.0 += item.amount_micros,
                "payable" => entry.1 += item.amount_micros,
                _ => unreachable!(),
            }
        }
        let mut breakdown_builder = CanonicalValue::map();
        for (counterparty, (receivable, payable)) in &breakdown {
            breakdown_builder = breakdown_builder.field(
                counterparty.clone(),
                CanonicalValue::map()
                    .field("receivable_micros", CanonicalValue::Int(*receivable))
                    .field("payable_micros", CanonicalValue::Int(*payable))
                    .build(),
            );
        }

        let line_items = CanonicalValue::seq(ledger.line_items.iter().map(|item| {
            CanonicalValue::map()
                .field("receipt_hash", CanonicalValue::str(&item.receipt_hash))
                .field("timestamp_ms", CanonicalValue::Int(item.timestamp_ms))
                .field("counterparty", CanonicalValue::str(&item.counterparty))
                .field("amount_micros", CanonicalValue::Int(item.amount_micros))
                .field("direction", CanonicalValue::str(item.direction))
                .build()
        }));

        let receipt = self.receipts.seal(
            "ALR",
            request_hash,
            fields::alr(
                agent,
                period_start_ms,
                period_end_ms,
                breakdown_builder.build(),
                line_items,
                format,
                ledger.total_receivable_micros,
                ledger.total_payable_micros,
            ),
        )?;
        let receipt = self.storage.insert_receipt(receipt).await?.into_inner();
        tracing::debug!(agent, period_start_ms, period_end_ms, format, "ALR derived");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_storage::InMemoryKernelStorage;
    use chrono::Utc;

    async fn seal_and_fund(storage: &InMemoryKernelStorage, agent: &str) {
        storage
            .issue_seal(ck_types::Seal {
                target: agent.to_string(),
                conformance_hash: ck_crypto::hash(b"conformance"),
                issued_at: Utc::now(),
                receipt_hash: ck_crypto::hash(b"seal-receipt"),
            })
            .await
            .unwrap();
        storage
            .credit(agent, 30_000 * ck_types::USD, ck_types::WalletTransactionKind::Credit, "topup", "seed")
            .await
            .unwrap();
    }

    fn ian_receipt(factory: &ReceiptFactory, agent: &str, counterparty: &str, amount: Micros, agent_is_creditor: bool) -> ReceiptEnvelope {
        let (debtor, creditor) = if agent_is_creditor {
            (counterparty, agent)
        } else {
            (agent, counterparty)
        };
        let net_obligations = CanonicalValue::seq(vec![CanonicalValue::map()
            .field("debtor", CanonicalValue::str(debtor))
            .field("creditor", CanonicalValue::str(creditor))
            .field("amount_micros", CanonicalValue::Int(amount))
            .build()]);
        factory
            .seal("IAN", &format!("req-ian-{debtor}-{creditor}-{amount}"), fields::ian(agent, &[], net_obligations, 0))
            .unwrap()
    }

    #[tokio::test]
    async fn mbs_nets_receivable_and_payable_across_two_ians() {
        let storage = Arc::new(InMemoryKernelStorage::new());
        seal_and_fund(&storage, "agent:a").await;
        let (sk, pk) = ck_crypto::generate_keypair();
        let minting_factory = ReceiptFactory::new(sk.clone(), pk.clone());
        let engine = ReportsEngine::new(storage, ReceiptFactory::new(sk, pk));

        let receipts = vec![
            ian_receipt(&minting_factory, "agent:a", "agent:b", 50 * ck_types::USD, true),
            ian_receipt(&minting_factory, "agent:a", "agent:c", 20 * ck_types::USD, false),
        ];

        let mbs = engine.derive_mbs("agent:a", &receipts, 0, false, 0, "req-mbs-1").await.unwrap();
        assert_eq!(mbs.payload["total_receivable_micros"], 50 * ck_types::USD);
        assert_eq!(mbs.payload["total_payable_micros"], 20 * ck_types::USD);
    }

    #[tokio::test]
    async fn mbs_replay_does_not_charge_a_second_fee() {
        let storage = Arc::new(InMemoryKernelStorage::new());
        seal_and_fund(&storage, "agent:a").await;
        let (sk, pk) = ck_crypto::generate_keypair();
        let engine = ReportsEngine::new(storage.clone(), ReceiptFactory::new(sk, pk));

        let first = engine.derive_mbs("agent:a", &[], 0, false, 0, "req-mbs-1").await.unwrap();
        let balance_after_first = storage.get_balance("agent:a").await.unwrap();

        let replayed = engine.derive_mbs("agent:a", &[], 0, false, 0, "req-mbs-1").await.unwrap();
        assert_eq!(replayed.receipt_hash, first.receipt_hash);
        assert_eq!(storage.get_balance("agent:a").await.unwrap(), balance_after_first);
    }

    #[tokio::test]
    async fn mbs_requires_seal() {
        let storage = Arc::new(InMemoryKernelStorage::new());
        let (sk, pk) = ck_crypto::generate_keypair();
        let engine = ReportsEngine::new(storage, ReceiptFactory::new(sk, pk));
        let err = engine.derive_mbs("agent:unsealed", &[], 0, false, 0, "req-mbs-1").await.unwrap_err();
        assert!(matches!(err, ReportsError::SealRequired(_)));
    }

    #[tokio::test]
    async fn alr_filters_by_period_and_rejects_bad_format() {
        let storage = Arc::new(InMemoryKernelStorage::new());
        seal_and_fund(&storage, "agent:a").await;
        let (sk, pk) = ck_crypto::generate_keypair();
        let minting_factory = ReceiptFactory::new(sk.clone(), pk.clone());
        let engine = ReportsEngine::new(storage, ReceiptFactory::new(sk, pk));

        let receipt = ian_receipt(&minting_factory, "agent:a", "agent:b", 10 * ck_types::USD, true);
        let ts = receipt.timestamp_ms;

        let err = engine
            .derive_alr("agent:a", &[receipt.clone()], 0, ts, "xml", "req-alr-bad")
            .await
            .unwrap_err();
        assert!(matches!(err, ReportsError::UnsupportedFormat(_)));

        let in_period = engine
            .derive_alr("agent:a", &[receipt.clone()], ts - 1, ts + 1, "json", "req-alr-1")
            .await
            .unwrap();
        assert_eq!(in_period.payload["total_receivable_micros"], 10 * ck_types::USD);

        let out_of_period = engine
            .derive_alr("agent:a", &[receipt], ts + 1000, ts + 2000, "json", "req-alr-2")
            .await
            .unwrap();
        assert_eq!(out_of_period.payload["total_receivable_micros"], 0);
    }

    #[tokio::test]
    async fn alr_replay_does_not_charge_a_second_fee() {
        let storage = Arc::new(InMemoryKernelStorage::new());
        seal_and_fund(&storage, "agent:a").await;
        let (sk, pk) = ck_crypto::generate_keypair();
        let engine = ReportsEngine::new(storage.clone(), ReceiptFactory::new(sk, pk));

        let first = engine.derive_alr("agent:a", &[], 0, 1_000, "json", "req-alr-replay").await.unwrap();
        let balance_after_first = storage.get_balance("agent:a").await.unwrap();

        let replayed = engine.derive_alr("agent:a", &[], 0, 1_000, "json", "req-alr-replay").await.unwrap();
        assert_eq!(replayed.receipt_hash, first.receipt_hash);
        assert_eq!(storage.get_balance("agent:a").await.unwrap(), balance_after_first);
    }
}
