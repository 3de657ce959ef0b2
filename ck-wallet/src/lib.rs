//! Wallet & paywall controller (C4): per-agent credit balance, atomic
//! credit/deduct with transaction log, and the `require_credit` gate that
//! turns an underfunded wallet into a structured, self-remediable error
//! instead of a bare failure. Grounded in
//! `aas_ledger::AccountabilityLedger`'s RwLock-guarded-map shape, here
//! delegated entirely to a `WalletStore` so the gate itself stays storage-
//! agnostic.

use ck_storage::{DeductOutcome, StorageError, WalletStore};
use ck_types::{Micros, WalletTransaction, WalletTransactionKind};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("amount must be > 0, got {0}")]
    InvalidAmount(Micros),

    /// Paywall rejection. Carries everything a calling agent needs to
    /// self-remediate: how much is needed, what it has, and where to top up.
    #[error("credit required: need {required} usd-micros, have {current_balance}")]
    CreditRequired {
        required: Micros,
        current_balance: Micros,
        purchase_url: String,
    },

    /// Deduction attempted against insufficient funds outside the
    /// `require_credit` gate (e.g. a direct `deduct` call).
    #[error("insufficient funds: balance {current_balance} < requested amount")]
    InsufficientFunds { current_balance: Micros },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct WalletService<S: WalletStore> {
    storage: Arc<S>,
    purchase_url_base: String,
}

impl<S: WalletStore> WalletService<S> {
    pub fn new(storage: Arc<S>, purchase_url_base: impl Into<String>) -> Self {
        Self {
            storage,
            purchase_url_base: purchase_url_base.into(),
        }
    }

    /// Returns 0 for a wallet that has never been credited.
    pub async fn get_balance(&self, wallet_id: &str) -> Result<Micros, WalletError> {
        Ok(self.storage.get_balance(wallet_id).await?)
    }

    pub async fn credit(
        &self,
        wallet_id: &str,
        amount: Micros,
        kind: WalletTransactionKind,
        reference_type: &str,
        reference: &str,
    ) -> Result<WalletTransaction, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }
        let transaction = self
            .storage
            .credit(wallet_id, amount, kind, reference_type, reference)
            .await?;
        tracing::debug!(wallet_id, amount, "wallet credited");
        Ok(transaction)
    }

    /// Atomic check-and-decrement. Insufficient funds is reported as a
    /// distinct error variant, not folded into a generic storage failure;
    /// state is left unchanged either way.
    pub async fn deduct(
        &self,
        wallet_id: &str,
        amount: Micros,
        reference_type: &str,
        reference: &str,
    ) -> Result<WalletTransaction, WalletError> {
        if amount <= 0 {
            return Err(WalletError::InvalidAmount(amount));
        }
        match self.storage.deduct(wallet_id, amount, reference_type, reference).await? {
            DeductOutcome::Applied { transaction, .. } => {
                tracing::debug!(wallet_id, amount, "wallet deducted");
                Ok(transaction)
            }
            DeductOutcome::InsufficientFunds { current_balance } => {
                Err(WalletError::InsufficientFunds { current_balance })
            }
        }
    }

    /// Paywall gate: reads the balance and, if short, returns
    /// `CreditRequired` with the exact blocker metadata a client needs to
    /// top up and retry. Makes no state change either way.
    pub async fn require_credit(
        &self,
        wallet_id: &str,
        min_required: Micros,
    ) -> Result<(), WalletError> {
        let current_balance = self.storage.get_balance(wallet_id).await?;
        if current_balance >= min_required {
            return Ok(());
        }
        Err(WalletError::CreditRequired {
            required: min_required,
            current_balance,
            purchase_url: format!(
                "{}?wallet={}&amount_usd_micros={}",
                self.purchase_url_base, wallet_id, min_required
            ),
        })
    }

    pub async fn list_transactions(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletTransaction>, WalletError> {
        Ok(self.storage.list_transactions(wallet_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_storage::InMemoryKernelStorage;

    fn service() -> WalletService<InMemoryKernelStorage> {
        WalletService::new(
            Arc::new(InMemoryKernelStorage::new()),
            "https://billing.example/topup",
        )
    }

    #[tokio::test]
    async fn unknown_wallet_has_zero_balance() {
        let service = service();
        assert_eq!(service.get_balance("agent:new").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credit_then_deduct_round_trips_balance() {
        let service = service();
        service
            .credit("agent:a", 1_000_000, WalletTransactionKind::Credit, "topup", "req-1")
            .await
            .unwrap();
        service
            .deduct("agent:a", 400_000, "settlement", "req-2")
            .await
            .unwrap();
        assert_eq!(service.get_balance("agent:a").await.unwrap(), 600_000);
    }

    #[tokio::test]
    async fn deduct_past_balance_leaves_state_unchanged() {
        let service = service();
        service
            .credit("agent:a", 100, WalletTransactionKind::Credit, "topup", "req-1")
            .await
            .unwrap();
        let err = service.deduct("agent:a", 200, "settlement", "req-2").await.unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { current_balance: 100 }));
        assert_eq!(service.get_balance("agent:a").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn require_credit_below_balance_passes_silently() {
        let service = service();
        service
            .credit("agent:a", 1_000_000, WalletTransactionKind::Credit, "topup", "req-1")
            .await
            .unwrap();
        service.require_credit("agent:a", 500_000).await.unwrap();
    }

    #[tokio::test]
    async fn require_credit_above_balance_is_self_remediable() {
        let service = service();
        service
            .credit("agent:a", 500_000, WalletTransactionKind::Credit, "topup", "req-1")
            .await
            .unwrap();
        let err = service.require_credit("agent:a", 100_000_000).await.unwrap_err();
        match err {
            WalletError::CreditRequired {
                required,
                current_balance,
                purchase_url,
            } => {
                assert_eq!(required, 100_000_000);
                assert_eq!(current_balance, 500_000);
                assert!(purchase_url.contains("agent%3Aa") || purchase_url.contains("agent:a"));
            }
            other => panic!("expected CreditRequired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_amount_credit_is_rejected() {
        let service = service();
        let err = service
            .credit("agent:a", 0, WalletTransactionKind::Credit, "topup", "req-1")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(0)));
    }
}
