//! Allocation and escrow lifecycle (C9): atomic three-wallet transfers with
//! a treasury-bound fee, and a buyer/seller escrow state machine gated on
//! caller identity for every transition. Grounded in
//! `ibank_core::commerce::AgenticCommerceAgent`'s order lifecycle — a status-
//! carrying record advanced only through named transitions, each checked
//! against who is allowed to trigger it, rather than ibank's direct field
//! writes. Escrow funds are "locked" purely by status here, matching the
//! source design note that no balance movement backs `create`.

use ck_receipts::{fields, ReceiptError, ReceiptFactory};
use ck_storage::{AllocationStore, KernelStorage, ReceiptStore, StorageError};
use ck_types::{Escrow, EscrowStatus, Micros, ReceiptEnvelope};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("escrow {0} not found")]
    EscrowNotFound(String),

    #[error("escrow {escrow_id} is {status:?}, expected {expected:?}")]
    WrongStatus {
        escrow_id: String,
        status: EscrowStatus,
        expected: EscrowStatus,
    },

    #[error("caller {caller} is not a party to escrow {escrow_id}")]
    NotAParty { escrow_id: String, caller: String },

    #[error("caller {caller} is not the buyer on escrow {escrow_id}")]
    NotBuyer { escrow_id: String, caller: String },

    #[error("unknown dispute resolution {0:?}, expected 'release' or 'refund'")]
    UnknownResolution(String),

    #[error("allocation {0} was recorded but its receipt is missing from storage")]
    MissingReceipt(String),

    #[error("wallet {wallet_id} balance {current_balance} is below required amount {required}")]
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
pub struct AllocationFeeSchedule {
    pub fee_bps: u32,
    pub fee_min_micros: Micros,
    pub dispute_resolve_flat_micros: Micros,
}

impl Default for AllocationFeeSchedule {
    fn default() -> Self {
        Self {
            fee_bps: 10,
            fee_min_micros: ck_types::USD / 10,
            dispute_resolve_flat_micros: 25_000 * ck_types::USD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub receipt: ReceiptEnvelope,
    pub fee_charged_micros: Micros,
}

#[derive(Debug, Clone)]
pub struct EscrowOutcome {
    pub escrow: Escrow,
    pub receipt: Option<ReceiptEnvelope>,
}

pub struct AllocationEngine<S: KernelStorage> {
    storage: Arc<S>,
    receipts: ReceiptFactory,
    fees: AllocationFeeSchedule,
    treasury_wallet: String,
}

impl<S: KernelStorage> AllocationEngine<S> {
    pub fn new(storage: Arc<S>, receipts: ReceiptFactory, treasury_wallet: impl Into<String>) -> Self {
        Self {
            storage,
            receipts,
            fees: AllocationFeeSchedule::default(),
            treasury_wallet: treasury_wallet.into(),
        }
    }

    pub fn with_fee_schedule(mut self, fees: AllocationFeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    fn derive_id(prefix: &str, request_hash: &str) -> String {
        let digest = ck_crypto::hash(request_hash.as_bytes());
        format!("{prefix}_{}", &digest[..16])
    }

    /// Moves `amount` from `from_wallet` to `to_wallet`, charging a fee to
    /// `from_wallet` routed to the treasury wallet, as one transaction via
    /// `WalletStore::transfer_with_fee` — a shortfall leaves every wallet
    /// untouched rather than landing mid-transfer.
    pub async fn allocate(
        &self,
        from_wallet: &str,
        to_wallet: &str,
        amount_micros: Micros,
        window_id: Option<&str>,
        request_hash: &str,
    ) -> Result<AllocationOutcome, AllocationError> {
        if let Some(existing) = AllocationStore::get_by_request_hash(self.storage.as_ref(), request_hash).await? {
            let receipt = self
                .storage
                .get_by_hash(&existing.receipt_hash)
                .await?
                .ok_or_else(|| AllocationError::MissingReceipt(existing.allocation_id.clone()))?;
            return Ok(AllocationOutcome {
                receipt,
                fee_charged_micros: existing.fee_micros,
            });
        }

        let fee = std::cmp::max(ck_types::bps_of(self.fees.fee_bps, amount_micros), self.fees.fee_min_micros);
        let total_debit = amount_micros + fee;

        match self
            .storage
            .transfer_with_fee(from_wallet, to_wallet, &self.treasury_wallet, amount_micros, fee, "allocation", request_hash)
            .await?
        {
            ck_storage::DeductOutcome::Applied { .. } => {}
            ck_storage::DeductOutcome::InsufficientFunds { current_balance } => {
                return Err(AllocationError::InsufficientFunds {
                    wallet_id: from_wallet.to_string(),
                    current_balance,
                    required: total_debit,
                });
            }
        }

        let allocation_id = Self::derive_id("alloc", request_hash);
        let receipt = self.receipts.seal(
            "ALLOC",
            request_hash,
            fields::alloc(&allocation_id, from_wallet, to_wallet, amount_micros, fee, self.fees.fee_bps, window_id),
        )?;
        let receipt = self.storage.insert_receipt(receipt).await?.into_inner();
        self.storage
            .insert_allocation(ck_types::AllocationRecord {
                allocation_id,
                from_wallet: from_wallet.to_string(),
                to_wallet: to_wallet.to_string(),
                amount_micros,
                fee_micros: fee,
                fee_bps: self.fees.fee_bps,
                window_id: window_id.map(str::to_string),
                request_hash: request_hash.to_string(),
                receipt_hash: receipt.receipt_hash.clone(),
            })
            .await?;

        tracing::debug!(from_wallet, to_wallet, amount_micros, fee, "allocation settled");
        Ok(AllocationOutcome {
            receipt,
            fee_charged_micros: fee,
        })
    }

    pub async fn create_escrow(
        &self,
        buyer: &str,
        seller: &str,
        amount_micros: Micros,
        description: &str,
        expires_at: DateTime<Utc>,
        request_hash: &str,
    ) -> Result<EscrowOutcome, AllocationError> {
        let escrow_id = Self::derive_id("escrow", request_hash);
        if let Some(escrow) = self.storage.get_escrow(&escrow_id).await? {
            return Ok(EscrowOutcome { escrow, receipt: None });
        }
        let escrow = Escrow {
            escrow_id: escrow_id.clone(),
            buyer: buyer.to_string(),
            seller: seller.to_string(),
            amount_micros,
            description: description.to_string(),
            expires_at,
            status: EscrowStatus::Locked,
        };
        self.storage.create_escrow(escrow.clone()).await?;
        tracing::debug!(escrow_id, buyer, seller, amount_micros, "escrow created");
        Ok(EscrowOutcome { escrow, receipt: None })
    }

    /// Release requires the caller to be the buyer. Emits an MSR between
    /// buyer and seller; per the source design, escrow funds were never
    /// moved through the wallet layer, so release carries no wallet effect
    /// of its own.
    pub async fn release(
        &self,
        escrow_id: &str,
        caller: &str,
        request_hash: &str,
    ) -> Result<EscrowOutcome, AllocationError> {
        if let Some(receipt) = ReceiptStore::get_by_request_hash(self.storage.as_ref(), request_hash).await? {
            let escrow = self
                .storage
                .get_escrow(escrow_id)
                .await?
                .ok_or_else(|| AllocationError::EscrowNotFound(escrow_id.to_string()))?;
            return Ok(EscrowOutcome {
                escrow,
                receipt: Some(receipt),
            });
        }

        let escrow = self.require_locked(escrow_id).await?;
        if caller != escrow.buyer {
            return Err(AllocationError::NotBuyer {
                escrow_id: escrow_id.to_string(),
                caller: caller.to_string(),
            });
        }
        self.storage.update_escrow_status(escrow_id, EscrowStatus::Released).await?;
        let receipt = self.receipts.seal(
            "MSR",
            request_hash,
            fields::msr(&escrow.buyer, &escrow.seller, escrow.amount_micros, Some(escrow_id), None),
        )?;
        let receipt = self.storage.insert_receipt(receipt).await?.into_inner();
        tracing::debug!(escrow_id, "escrow released");
        Ok(EscrowOutcome {
            escrow: Escrow {
                status: EscrowStatus::Released,
                ..escrow
            },
            receipt: Some(receipt),
        })
    }

    /// Dispute requires the caller to be a party to the escrow.
    pub async fn dispute(&self, escrow_id: &str, caller: &str) -> Result<EscrowOutcome, AllocationError> {
        let escrow = self.require_locked(escrow_id).await?;
        if caller != escrow.buyer && caller != escrow.seller {
            return Err(AllocationError::NotAParty {
                escrow_id: escrow_id.to_string(),
                caller: caller.to_string(),
            });
        }
        self.storage.update_escrow_status(escrow_id, EscrowStatus::Disputed).await?;
        tracing::debug!(escrow_id, caller, "escrow disputed");
        Ok(EscrowOutcome {
            escrow: Escrow {
                status: EscrowStatus::Disputed,
                ..escrow
            },
            receipt: None,
        })
    }

    /// The paid "default resolve" operation mentioned in the design note:
    /// resolves a disputed escrow to either `release` (emits the buyer/seller
    /// MSR, same as a normal release) or `refund` (transitions to `expired`,
    /// returning the notionally-held funds to the buyer by convention).
    pub async fn resolve_dispute(
        &self,
        escrow_id: &str,
        resolution: &str,
        payer_wallet: &str,
        request_hash: &str,
    ) -> Result<EscrowOutcome, AllocationError> {
        let escrow = self.storage.get_escrow(escrow_id).await?.ok_or_else(|| AllocationError::EscrowNotFound(escrow_id.to_string()))?;
        if escrow.status != EscrowStatus::Disputed {
            return Err(AllocationError::WrongStatus {
                escrow_id: escrow_id.to_string(),
                status: escrow.status,
                expected: EscrowStatus::Disputed,
            });
        }

        match self.storage.deduct(payer_wallet, self.fees.dispute_resolve_flat_micros, "escrow_dispute_resolve", request_hash).await? {
            ck_storage::DeductOutcome::Applied { .. } => {}
            ck_storage::DeductOutcome::InsufficientFunds { current_balance } => {
                return Err(AllocationError::InsufficientFunds {
                    wallet_id: payer_wallet.to_string(),
                    current_balance,
                    required: self.fees.dispute_resolve_flat_micros,
                });
            }
        }

        match resolution {
            "release" => {
                self.storage.update_escrow_status(escrow_id, EscrowStatus::Released).await?;
                let receipt = self.receipts.seal(
                    "MSR",
                    request_hash,
                    fields::msr(&escrow.buyer, &escrow.seller, escrow.amount_micros, Some(escrow_id), None),
                )?;
                Ok(EscrowOutcome {
                    escrow: Escrow { status: EscrowStatus::Released, ..escrow },
                    receipt: Some(receipt),
                })
            }
            "refund" => {
                self.storage.update_escrow_status(escrow_id, EscrowStatus::Expired).await?;
                Ok(EscrowOutcome {
                    escrow: Escrow { status: EscrowStatus::Expired, ..escrow },
                    receipt: None,
                })
            }
            other => Err(AllocationError::UnknownResolution(other.to_string())),
        }
    }

    pub async fn expire(&self, escrow_id: &str) -> Result<EscrowOutcome, AllocationError> {
        let escrow = self.require_locked(escrow_id).await?;
        self.storage.update_escrow_status(escrow_id, EscrowStatus::Expired).await?;
        tracing::debug!(escrow_id, "escrow expired");
        Ok(EscrowOutcome {
            escrow: Escrow { status: EscrowStatus::Expired, ..escrow },
            receipt: None,
        })
    }

    async fn require_locked(&self, escrow_id: &str) -> Result<Escrow, AllocationError> {
        let escrow = self.storage.get_escrow(escrow_id).await?.ok_or_else(|| AllocationError::EscrowNotFound(escrow_id.to_string()))?;
        if escrow.status != EscrowStatus::Locked {
            return Err(AllocationError::WrongStatus {
                escrow_id: escrow_id.to_string(),
                status: escrow.status,
                expected: EscrowStatus::Locked,
            });
        }
        Ok(escrow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_storage::InMemoryKernelStorage;

    fn engine() -> AllocationEngine<InMemoryKernelStorage> {
        let (sk, pk) = ck_crypto::generate_keypair();
        AllocationEngine::new(Arc::new(InMemoryKernelStorage::new()), ReceiptFactory::new(sk, pk), "wallet:treasury")
    }

    async fn fund(engine: &AllocationEngine<InMemoryKernelStorage>, wallet: &str, amount: Micros) {
        engine
            .storage
            .credit(wallet, amount, ck_types::WalletTransactionKind::Credit, "topup", "seed")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn allocate_moves_amount_and_routes_fee_to_treasury() {
        let engine = engine();
        fund(&engine, "wallet:a", 1_000 * ck_types::USD).await;

        engine.allocate("wallet:a", "wallet:b", 100 * ck_types::USD, None, "req-alloc-1").await.unwrap();

        assert_eq!(engine.storage.get_balance("wallet:b").await.unwrap(), 100 * ck_types::USD);
        assert!(engine.storage.get_balance("wallet:treasury").await.unwrap() > 0);
        assert!(engine.storage.get_balance("wallet:a").await.unwrap() < 900 * ck_types::USD);
    }

    #[tokio::test]
    async fn allocate_insufficient_funds_leaves_wallets_untouched() {
        let engine = engine();
        fund(&engine, "wallet:a", 10 * ck_types::USD).await;

        let err = engine.allocate("wallet:a", "wallet:b", 100 * ck_types::USD, None, "req-alloc-1").await.unwrap_err();
        assert!(matches!(err, AllocationError::InsufficientFunds { .. }));
        assert_eq!(engine.storage.get_balance("wallet:a").await.unwrap(), 10 * ck_types::USD);
        assert_eq!(engine.storage.get_balance("wallet:b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replayed_allocation_request_hash_does_not_double_move_funds() {
        let engine = engine();
        fund(&engine, "wallet:a", 1_000 * ck_types::USD).await;

        engine.allocate("wallet:a", "wallet:b", 100 * ck_types::USD, None, "req-alloc-1").await.unwrap();
        let balance_after_first = engine.storage.get_balance("wallet:b").await.unwrap();
        engine.allocate("wallet:a", "wallet:b", 100 * ck_types::USD, None, "req-alloc-1").await.unwrap();
        assert_eq!(engine.storage.get_balance("wallet:b").await.unwrap(), balance_after_first);
    }

    #[tokio::test]
    async fn release_requires_buyer() {
        let engine = engine();
        let created = engine
            .create_escrow("agent:buyer", "agent:seller", 500 * ck_types::USD, "widget", Utc::now(), "req-escrow-1")
            .await
            .unwrap();

        let err = engine.release(&created.escrow.escrow_id, "agent:seller", "req-release-1").await.unwrap_err();
        assert!(matches!(err, AllocationError::NotBuyer { .. }));

        let released = engine.release(&created.escrow.escrow_id, "agent:buyer", "req-release-1").await.unwrap();
        assert_eq!(released.escrow.status, EscrowStatus::Released);
        assert!(released.receipt.is_some());
    }

    #[tokio::test]
    async fn replayed_release_does_not_error_on_already_released_escrow() {
        let engine = engine();
        let created = engine
            .create_escrow("agent:buyer", "agent:seller", 500 * ck_types::USD, "widget", Utc::now(), "req-escrow-1")
            .await
            .unwrap();

        let first = engine.release(&created.escrow.escrow_id, "agent:buyer", "req-release-1").await.unwrap();
        let replayed = engine.release(&created.escrow.escrow_id, "agent:buyer", "req-release-1").await.unwrap();

        assert_eq!(replayed.escrow.status, EscrowStatus::Released);
        assert_eq!(replayed.receipt.unwrap().receipt_hash, first.receipt.unwrap().receipt_hash);
    }

    #[tokio::test]
    async fn dispute_rejects_non_party_callers() {
        let engine = engine();
        let created = engine
            .create_escrow("agent:buyer", "agent:seller", 500 * ck_types::USD, "widget", Utc::now(), "req-escrow-1")
            .await
            .unwrap();

        let err = engine.dispute(&created.escrow.escrow_id, "agent:stranger").await.unwrap_err();
        assert!(matches!(err, AllocationError::NotAParty { .. }));

        let disputed = engine.dispute(&created.escrow.escrow_id, "agent:seller").await.unwrap();
        assert_eq!(disputed.escrow.status, EscrowStatus::Disputed);
    }

    #[tokio::test]
    async fn expire_transitions_locked_to_expired() {
        let engine = engine();
        let created = engine
            .create_escrow("agent:buyer", "agent:seller", 500 * ck_types::USD, "widget", Utc::now(), "req-escrow-1")
            .await
            .unwrap();
        let expired = engine.expire(&created.escrow.escrow_id).await.unwrap();
        assert_eq!(expired.escrow.status, EscrowStatus::Expired);
    }
}
