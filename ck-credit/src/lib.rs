//! Credit-line lifecycle engine (C8): open/draw/repay, interest accrual, fee
//! application, collateral lock/unlock, margin calls, and the liquidation
//! waterfall. Every mutating call appends to the line's event log keyed by
//! `request_hash` and is replayed from that log rather than reapplied,
//! mirroring the idempotent-by-construction style of the other C-crates.
//! Config defaults (fee schedule, spread/collateral-ratio bps) follow
//! `ibank_core::policy::RiskPolicyEngine`'s config-struct-with-`Default`
//! shape; state only ever advances through a named, precondition-checked
//! step, echoing `ibank_core::flow::ConsequenceStageMachine`'s refusal to
//! let a caller skip a stage.

use ck_canon::CanonicalValue;
use ck_receipts::{fields, ReceiptError, ReceiptFactory};
use ck_storage::{KernelStorage, StorageError};
use ck_types::{
    CollateralAssetType, CollateralLock, CollateralStatus, CreditEventLogEntry, CreditLine,
    CreditLineStatus, CreditPosition, MarginCall, MarginCallStatus, Micros, ReceiptEnvelope,
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("no seal on file for borrower {0}")]
    SealRequired(String),

    #[error("credit line {0} not found")]
    LineNotFound(String),

    #[error("collateral lock {0} not found")]
    LockNotFound(String),

    #[error("margin call {0} not found")]
    MarginCallNotFound(String),

    #[error("credit line {0} is {1:?}, not active")]
    LineNotActive(String, CreditLineStatus),

    #[error("caller {caller} is not the borrower on line {credit_line_id}")]
    NotBorrower { credit_line_id: String, caller: String },

    #[error("draw of {requested} exceeds remaining limit {remaining}")]
    DrawExceedsLimit { requested: Micros, remaining: Micros },

    #[error("collateral lock {0} is not in locked state")]
    LockNotLocked(String),

    #[error("margin call {0} is not pending")]
    MarginCallNotPending(String),

    #[error("unknown margin call action {0:?}")]
    UnknownMarginAction(String),

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

/// Fee schedule per spec.md §4.8. A config struct so an embedder can retune
/// amounts without touching engine logic, in the shape of
/// `ibank_core::policy::RiskPolicyConfig`.
#[derive(Debug, Clone, Copy)]
pub struct CreditFeeSchedule {
    pub open_bps: u32,
    pub open_min_micros: Micros,
    pub draw_bps: u32,
    pub draw_min_micros: Micros,
    pub accrue_flat_micros: Micros,
    pub fee_apply_flat_micros: Micros,
    pub collateral_flat_micros: Micros,
    pub margin_call_flat_micros: Micros,
    pub liquidation_bps: u32,
}

impl Default for CreditFeeSchedule {
    fn default() -> Self {
        Self {
            open_bps: 50,
            open_min_micros: 50 * ck_types::USD,
            draw_bps: 10,
            draw_min_micros: 10 * ck_types::USD,
            accrue_flat_micros: ck_types::USD,
            fee_apply_flat_micros: ck_types::USD,
            collateral_flat_micros: 10 * ck_types::USD,
            margin_call_flat_micros: 100 * ck_types::USD,
            liquidation_bps: 500,
        }
    }
}

/// Outcome of a mutating credit-line call: the sealed receipt plus the
/// position snapshot after the effect (or, on replay, as it stood after the
/// original call).
#[derive(Debug, Clone)]
pub struct CreditOutcome {
    pub receipt: ReceiptEnvelope,
    pub position: CreditPosition,
    pub fee_charged_micros: Micros,
}

pub struct CreditEngine<S: KernelStorage> {
    storage: Arc<S>,
    receipts: ReceiptFactory,
    fees: CreditFeeSchedule,
}

impl<S: KernelStorage> CreditEngine<S> {
    pub fn new(storage: Arc<S>, receipts: ReceiptFactory) -> Self {
        Self {
            storage,
            receipts,
            fees: CreditFeeSchedule::default(),
        }
    }

    pub fn with_fee_schedule(mut self, fees: CreditFeeSchedule) -> Self {
        self.fees = fees;
        self
    }

    /// Derives a content-addressed id for a newly created row from the
    /// caller-supplied `request_hash`, which is already content-derived and
    /// unique per call. Hashing the row's own future receipt hash would be
    /// circular (the receipt embeds the id); hashing `request_hash` is not.
    fn derive_id(prefix: &str, request_hash: &str) -> String {
        let digest = ck_crypto::hash(request_hash.as_bytes());
        format!("{prefix}_{}", &digest[..16])
    }

    /// Looks up a previously logged event by `request_hash` and, if found,
    /// reconstructs the outcome from the stored receipt and the line's
    /// current position rather than reapplying the effect.
    async fn replay(
        &self,
        request_hash: &str,
        credit_line_id: &str,
    ) -> Result<Option<CreditOutcome>, CreditError> {
        let Some(event) = self.storage.get_event_by_request_hash(request_hash).await? else {
            return Ok(None);
        };
        let receipt = self
            .storage
            .get_by_hash(&event.receipt_hash)
            .await?
            .ok_or_else(|| CreditError::LineNotFound(credit_line_id.to_string()))?;
        let position = self
            .storage
            .get_position(credit_line_id)
            .await?
            .ok_or_else(|| CreditError::LineNotFound(credit_line_id.to_string()))?;
        Ok(Some(CreditOutcome { receipt, position, fee_charged_micros: 0 }))
    }

    async fn require_line(&self, credit_line_id: &str) -> Result<CreditLine, CreditError> {
        self.storage
            .get_line(credit_line_id)
            .await?
            .ok_or_else(|| CreditError::LineNotFound(credit_line_id.to_string()))
    }

    async fn require_position(&self, credit_line_id: &str) -> Result<CreditPosition, CreditError> {
        self.storage
            .get_position(credit_line_id)
            .await?
            .ok_or_else(|| CreditError::LineNotFound(credit_line_id.to_string()))
    }

    async fn charge_fee(
        &self,
        wallet_id: &str,
        amount: Micros,
        reference_type: &str,
        reference: &str,
    ) -> Result<(), CreditError> {
        if amount <= 0 {
            return Ok(());
        }
        match self.storage.deduct(wallet_id, amount, reference_type, reference).await? {
            ck_storage::DeductOutcome::Applied { .. } => Ok(()),
            ck_storage::DeductOutcome::InsufficientFunds { current_balance } => {
                Err(CreditError::InsufficientFunds {
                    wallet_id: wallet_id.to_string(),
                    current_balance,
                    required: amount,
                })
            }
        }
    }

    async fn append_event(
        &self,
        credit_line_id: &str,
        event_type: &str,
        receipt_hash: &str,
        request_hash: &str,
        delta_principal_micros: Micros,
        delta_interest_micros: Micros,
        delta_fees_micros: Micros,
    ) -> Result<(), CreditError> {
        self.storage
            .append_event(CreditEventLogEntry {
                credit_line_id: credit_line_id.to_string(),
                event_type: event_type.to_string(),
                receipt_hash: receipt_hash.to_string(),
                request_hash: request_hash.to_string(),
                delta_principal_micros,
                delta_interest_micros,
                delta_fees_micros,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// 4.8.1 Open. Requires a seal on file for the borrower and a wallet
    /// balance covering `max(open_bps × limit / 10_000, open_min)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_line(
        &self,
        borrower: &str,
        lender: &str,
        limit_micros: Micros,
        spread_bps: Option<u32>,
        maturity_ts_ms: Option<i64>,
        collateral_ratio_min_bps: Option<u32>,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        let credit_line_id = Self::derive_id("cl", request_hash);
        if let Some(outcome) = self.replay(request_hash, &credit_line_id).await? {
            return Ok(outcome);
        }

        if self.storage.get_seal(borrower).await?.is_none() {
            return Err(CreditError::SealRequired(borrower.to_string()));
        }

        let fee = std::cmp::max(
            ck_types::bps_of(self.fees.open_bps, limit_micros),
            self.fees.open_min_micros,
        );
        self.charge_fee(borrower, fee, "credit_open", request_hash).await?;

        let spread_bps = spread_bps.unwrap_or(CreditLine::DEFAULT_SPREAD_BPS);
        let collateral_ratio_min_bps =
            collateral_ratio_min_bps.unwrap_or(CreditLine::DEFAULT_COLLATERAL_RATIO_MIN_BPS);

        let line = CreditLine {
            credit_line_id: credit_line_id.clone(),
            borrower: borrower.to_string(),
            lender: lender.to_string(),
            limit_micros,
            spread_bps,
            maturity_ts_ms,
            collateral_ratio_min_bps,
            status: CreditLineStatus::Active,
            created_at: Utc::now(),
        };
        let position = CreditPosition::zero();
        self.storage.open_line(line, position).await?;

        let receipt = self.receipts.seal(
            "CL",
            request_hash,
            fields::cl(
                &credit_line_id,
                borrower,
                lender,
                limit_micros,
                spread_bps,
                maturity_ts_ms,
                "open",
                "active",
                true,
            ),
        )?;
        self.append_event(&credit_line_id, "open", &receipt.receipt_hash, request_hash, 0, 0, 0)
            .await?;
        tracing::info!(credit_line_id, borrower, limit_micros, "credit line opened");
        Ok(CreditOutcome { receipt, position, fee_charged_micros: fee })
    }

    /// 4.8.2 Draw. Caller must be the borrower; amount must not exceed the
    /// remaining limit. Fee is `max(draw_bps × amount / 10_000, draw_min)`.
    pub async fn draw(
        &self,
        credit_line_id: &str,
        caller: &str,
        amount_micros: Micros,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        let line = self.require_line(credit_line_id).await?;
        if line.status != CreditLineStatus::Active {
            return Err(CreditError::LineNotActive(credit_line_id.to_string(), line.status));
        }
        if caller != line.borrower {
            return Err(CreditError::NotBorrower {
                credit_line_id: credit_line_id.to_string(),
                caller: caller.to_string(),
            });
        }
        let position = self.require_position(credit_line_id).await?;
        let remaining = line.limit_micros - position.principal_micros;
        if amount_micros > remaining {
            return Err(CreditError::DrawExceedsLimit {
                requested: amount_micros,
                remaining,
            });
        }

        let fee = std::cmp::max(
            ck_types::bps_of(self.fees.draw_bps, amount_micros),
            self.fees.draw_min_micros,
        );
        self.charge_fee(caller, fee, "credit_draw", request_hash).await?;

        let new_principal = position.principal_micros + amount_micros;
        let new_position = CreditPosition {
            principal_micros: new_principal,
            ..position
        };
        self.storage.update_position(credit_line_id, new_position).await?;

        let receipt = self.receipts.seal(
            "DRAW",
            request_hash,
            fields::draw_or_repay("draw", credit_line_id, amount_micros, new_principal),
        )?;
        self.append_event(
            credit_line_id,
            "draw",
            &receipt.receipt_hash,
            request_hash,
            amount_micros,
            0,
            0,
        )
        .await?;
        tracing::debug!(credit_line_id, amount_micros, "credit line drawn");
        Ok(CreditOutcome { receipt, position: new_position, fee_charged_micros: fee })
    }

    /// 4.8.3 Repay. Caller must be the borrower. Each of `fees`, `interest`,
    /// `principal` is clamped to what is actually owed; no operational fee.
    pub async fn repay(
        &self,
        credit_line_id: &str,
        caller: &str,
        fees_micros: Micros,
        interest_micros: Micros,
        principal_micros: Micros,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        let line = self.require_line(credit_line_id).await?;
        if caller != line.borrower {
            return Err(CreditError::NotBorrower {
                credit_line_id: credit_line_id.to_string(),
                caller: caller.to_string(),
            });
        }
        let position = self.require_position(credit_line_id).await?;

        let repay_fees = std::cmp::min(fees_micros.max(0), position.fees_micros);
        let repay_interest = std::cmp::min(interest_micros.max(0), position.interest_accrued_micros);
        let repay_principal = std::cmp::min(principal_micros.max(0), position.principal_micros);

        let new_position = CreditPosition {
            fees_micros: position.fees_micros - repay_fees,
            interest_accrued_micros: position.interest_accrued_micros - repay_interest,
            principal_micros: position.principal_micros - repay_principal,
            ..position
        };
        self.storage.update_position(credit_line_id, new_position).await?;

        let receipt = self.receipts.seal(
            "REPAY",
            request_hash,
            fields::draw_or_repay(
                "repay",
                credit_line_id,
                -repay_principal,
                new_position.principal_micros,
            ),
        )?;
        self.append_event(
            credit_line_id,
            "repay",
            &receipt.receipt_hash,
            request_hash,
            -repay_principal,
            -repay_interest,
            -repay_fees,
        )
        .await?;
        tracing::debug!(credit_line_id, repay_principal, repay_interest, repay_fees, "credit line repaid");
        Ok(CreditOutcome { receipt, position: new_position, fee_charged_micros: 0 })
    }

    /// 4.8.4 Interest accrue. `interest = floor(principal * spread_bps / 10_000 * days / 365)`.
    /// Idempotency rests entirely on `request_hash`: the kernel trusts the
    /// caller to mint a distinct hash per `window_id`, it does not itself
    /// reject a repeated window.
    pub async fn interest_accrue(
        &self,
        credit_line_id: &str,
        window_id: &str,
        days: Option<u32>,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        let line = self.require_line(credit_line_id).await?;
        let position = self.require_position(credit_line_id).await?;
        let days = days.unwrap_or(30);

        let interest = (position.principal_micros as i128 * line.spread_bps as i128 * days as i128
            / 10_000
            / 365) as Micros;

        self.charge_fee(&line.borrower, self.fees.accrue_flat_micros, "credit_accrue", request_hash)
            .await?;

        let new_position = CreditPosition {
            interest_accrued_micros: position.interest_accrued_micros + interest,
            last_accrual_ts_ms: Some(Utc::now().timestamp_millis()),
            last_accrual_window: Some(window_id.to_string()),
            ..position
        };
        self.storage.update_position(credit_line_id, new_position).await?;

        let receipt = self.receipts.seal(
            "IAR",
            request_hash,
            fields::iar(credit_line_id, position.principal_micros, line.spread_bps, days, interest, window_id),
        )?;
        self.append_event(credit_line_id, "interest_accrue", &receipt.receipt_hash, request_hash, 0, interest, 0)
            .await?;
        tracing::debug!(credit_line_id, window_id, interest, "interest accrued");
        Ok(CreditOutcome { receipt, position: new_position, fee_charged_micros: self.fees.accrue_flat_micros })
    }

    /// 4.8.5 Fees apply.
    pub async fn fee_apply(
        &self,
        credit_line_id: &str,
        fee_type: &str,
        amount_micros: Micros,
        reason: Option<&str>,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        let line = self.require_line(credit_line_id).await?;
        let position = self.require_position(credit_line_id).await?;

        self.charge_fee(&line.borrower, self.fees.fee_apply_flat_micros, "credit_fee_apply", request_hash)
            .await?;

        let new_position = CreditPosition {
            fees_micros: position.fees_micros + amount_micros,
            ..position
        };
        self.storage.update_position(credit_line_id, new_position).await?;

        let receipt = self.receipts.seal(
            "FEE",
            request_hash,
            fields::fee(credit_line_id, fee_type, amount_micros, reason),
        )?;
        self.append_event(credit_line_id, "fee_apply", &receipt.receipt_hash, request_hash, 0, 0, amount_micros)
            .await?;
        Ok(CreditOutcome { receipt, position: new_position, fee_charged_micros: self.fees.fee_apply_flat_micros })
    }

    /// 4.8.6 Collateral lock.
    pub async fn collateral_lock(
        &self,
        credit_line_id: &str,
        asset_ref: &str,
        asset_type: CollateralAssetType,
        amount_micros: Micros,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        let line = self.require_line(credit_line_id).await?;
        self.charge_fee(&line.borrower, self.fees.collateral_flat_micros, "credit_collateral_lock", request_hash)
            .await?;

        let lock_id = Self::derive_id("lock", request_hash);
        self.storage
            .lock_collateral(CollateralLock {
                lock_id: lock_id.clone(),
                credit_line_id: credit_line_id.to_string(),
                asset_ref: asset_ref.to_string(),
                asset_type,
                amount_micros,
                status: CollateralStatus::Locked,
            })
            .await?;

        let receipt = self.receipts.seal(
            "COLL",
            request_hash,
            fields::coll(credit_line_id, &lock_id, "lock", asset_ref, asset_type_name(asset_type), amount_micros),
        )?;
        self.append_event(credit_line_id, "collateral_lock", &receipt.receipt_hash, request_hash, 0, 0, 0)
            .await?;
        let position = self.require_position(credit_line_id).await?;
        Ok(CreditOutcome { receipt, position, fee_charged_micros: self.fees.collateral_flat_micros })
    }

    /// 4.8.6 Collateral unlock.
    pub async fn collateral_unlock(
        &self,
        credit_line_id: &str,
        lock_id: &str,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        let line = self.require_line(credit_line_id).await?;
        let lock = self
            .storage
            .get_lock(lock_id)
            .await?
            .ok_or_else(|| CreditError::LockNotFound(lock_id.to_string()))?;
        if lock.status != CollateralStatus::Locked {
            return Err(CreditError::LockNotLocked(lock_id.to_string()));
        }
        self.charge_fee(&line.borrower, self.fees.collateral_flat_micros, "credit_collateral_unlock", request_hash)
            .await?;
        self.storage.update_lock_status(lock_id, CollateralStatus::Unlocked).await?;

        let receipt = self.receipts.seal(
            "COLL",
            request_hash,
            fields::coll(
                credit_line_id,
                lock_id,
                "unlock",
                &lock.asset_ref,
                asset_type_name(lock.asset_type),
                lock.amount_micros,
            ),
        )?;
        self.append_event(credit_line_id, "collateral_unlock", &receipt.receipt_hash, request_hash, 0, 0, 0)
            .await?;
        let position = self.require_position(credit_line_id).await?;
        Ok(CreditOutcome { receipt, position, fee_charged_micros: self.fees.collateral_flat_micros })
    }

    /// 4.8.7 Margin call: `call`, `resolve`, or `escalate`.
    pub async fn margin_call(
        &self,
        credit_line_id: &str,
        action: &str,
        margin_call_id: Option<&str>,
        required_amount_micros: Option<Micros>,
        due_ts_ms: Option<i64>,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        let line = self.require_line(credit_line_id).await?;
        self.charge_fee(&line.borrower, self.fees.margin_call_flat_micros, "credit_margin_call", request_hash)
            .await?;

        let (id, status, required, due) = match action {
            "call" => {
                let required = required_amount_micros.ok_or_else(|| {
                    CreditError::UnknownMarginAction("call requires required_amount_micros".into())
                })?;
                let due = due_ts_ms
                    .ok_or_else(|| CreditError::UnknownMarginAction("call requires due_ts_ms".into()))?;
                let id = Self::derive_id("mc", request_hash);
                self.storage
                    .create_margin_call(MarginCall {
                        margin_call_id: id.clone(),
                        credit_line_id: credit_line_id.to_string(),
                        required_amount_micros: required,
                        due_ts_ms: due,
                        status: MarginCallStatus::Pending,
                        resolved_ts_ms: None,
                    })
                    .await?;
                (id, MarginCallStatus::Pending, Some(required), Some(due))
            }
            "resolve" | "escalate" => {
                let id = margin_call_id
                    .ok_or_else(|| CreditError::UnknownMarginAction(format!("{action} requires margin_call_id")))?
                    .to_string();
                let call = self
                    .storage
                    .get_margin_call(&id)
                    .await?
                    .ok_or_else(|| CreditError::MarginCallNotFound(id.clone()))?;
                if call.status != MarginCallStatus::Pending {
                    return Err(CreditError::MarginCallNotPending(id));
                }
                let new_status = if action == "resolve" {
                    MarginCallStatus::Resolved
                } else {
                    MarginCallStatus::Escalated
                };
                let resolved_ts = if action == "resolve" { Some(Utc::now().timestamp_millis()) } else { None };
                self.storage.update_margin_call_status(&id, new_status, resolved_ts).await?;
                (id, new_status, Some(call.required_amount_micros), Some(call.due_ts_ms))
            }
            other => return Err(CreditError::UnknownMarginAction(other.to_string())),
        };

        let receipt = self.receipts.seal(
            "MARGIN",
            request_hash,
            fields::margin(credit_line_id, &id, action, required, due, margin_status_name(status)),
        )?;
        self.append_event(credit_line_id, "margin_call", &receipt.receipt_hash, request_hash, 0, 0, 0)
            .await?;
        let position = self.require_position(credit_line_id).await?;
        Ok(CreditOutcome { receipt, position, fee_charged_micros: self.fees.margin_call_flat_micros })
    }

    /// 4.8.8 Liquidation. Collects all locked collateral, marks it
    /// liquidated, and applies the fees->interest->principal waterfall in a
    /// single pass against the current position. The line and margin call
    /// both transition to `liquidated`.
    pub async fn liquidate(
        &self,
        credit_line_id: &str,
        margin_call_id: &str,
        request_hash: &str,
    ) -> Result<CreditOutcome, CreditError> {
        if let Some(outcome) = self.replay(request_hash, credit_line_id).await? {
            return Ok(outcome);
        }

        self.require_line(credit_line_id).await?;
        let position = self.require_position(credit_line_id).await?;
        let margin = self
            .storage
            .get_margin_call(margin_call_id)
            .await?
            .ok_or_else(|| CreditError::MarginCallNotFound(margin_call_id.to_string()))?;

        let locks = self.storage.list_locked_for_line(credit_line_id).await?;
        let mut total_collateral: Micros = 0;
        let mut per_lock = Vec::with_capacity(locks.len());
        for lock in &locks {
            self.storage.update_lock_status(&lock.lock_id, CollateralStatus::Liquidated).await?;
            total_collateral += lock.amount_micros;
            per_lock.push(
                CanonicalValue::map()
                    .field("lock_id", CanonicalValue::str(&lock.lock_id))
                    .field("amount_micros", CanonicalValue::Int(lock.amount_micros))
                    .build(),
            );
        }

        let liquidation_fee = ck_types::bps_of(self.fees.liquidation_bps, total_collateral);
        let mut net = total_collateral - liquidation_fee;

        let fees_covered = std::cmp::min(net, position.fees_micros);
        net -= fees_covered;
        let interest_covered = std::cmp::min(net, position.interest_accrued_micros);
        net -= interest_covered;
        let principal_covered = std::cmp::min(net, position.principal_micros);
        net -= principal_covered;
        let _ = net;

        let owed = position.principal_micros + position.interest_accrued_micros + position.fees_micros;
        let covered = fees_covered + interest_covered + principal_covered;
        let shortfall = owed - covered;

        let new_position = CreditPosition {
            principal_micros: position.principal_micros - principal_covered,
            interest_accrued_micros: position.interest_accrued_micros - interest_covered,
            fees_micros: position.fees_micros - fees_covered,
            ..position
        };
        self.storage.update_position(credit_line_id, new_position).await?;
        self.storage.update_line_status(credit_line_id, CreditLineStatus::Liquidated).await?;
        self.storage
            .update_margin_call_status(margin_call_id, MarginCallStatus::Liquidated, Some(Utc::now().timestamp_millis()))
            .await?;
        let _ = margin;

        let receipt = self.receipts.seal(
            "LIQ",
            request_hash,
            fields::liq(
                credit_line_id,
                margin_call_id,
                CanonicalValue::Seq(per_lock),
                total_collateral,
                liquidation_fee,
                fees_covered,
                interest_covered,
                principal_covered,
                shortfall,
            ),
        )?;
        self.append_event(
            credit_line_id,
            "liquidate",
            &receipt.receipt_hash,
            request_hash,
            -principal_covered,
            -interest_covered,
            -fees_covered,
        )
        .await?;
        tracing::warn!(credit_line_id, total_collateral, shortfall, "credit line liquidated");
        Ok(CreditOutcome { receipt, position: new_position, fee_charged_micros: liquidation_fee })
    }
}

fn asset_type_name(asset_type: CollateralAssetType) -> &'static str {
    match asset_type {
        CollateralAssetType::Ian => "ian",
        CollateralAssetType::Msr => "msr",
        CollateralAssetType::Fc => "fc",
        CollateralAssetType::External => "external",
    }
}

fn margin_status_name(status: MarginCallStatus) -> &'static str {
    match status {
        MarginCallStatus::Pending => "pending",
        MarginCallStatus::Resolved => "resolved",
        MarginCallStatus::Escalated => "escalated",
        MarginCallStatus::Liquidated => "liquidated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_storage::InMemoryKernelStorage;

    fn engine() -> CreditEngine<InMemoryKernelStorage> {
        let (sk, pk) = ck_crypto::generate_keypair();
        CreditEngine::new(Arc::new(InMemoryKernelStorage::new()), ReceiptFactory::new(sk, pk))
    }

    async fn seal_borrower(engine: &CreditEngine<InMemoryKernelStorage>, borrower: &str) {
        engine
            .storage
            .issue_seal(ck_types::Seal {
                target: borrower.to_string(),
                conformance_hash: ck_crypto::hash(b"conformance"),
                issued_at: Utc::now(),
                receipt_hash: ck_crypto::hash(b"seal-receipt"),
            })
            .await
            .unwrap();
    }

    async fn fund(engine: &CreditEngine<InMemoryKernelStorage>, wallet: &str, amount: Micros) {
        engine
            .storage
            .credit(wallet, amount, ck_types::WalletTransactionKind::Credit, "topup", "seed")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn open_line_requires_seal() {
        let engine = engine();
        fund(&engine, "agent:borrower", 1_000 * ck_types::USD).await;
        let err = engine
            .open_line("agent:borrower", "agent:lender", 10_000 * ck_types::USD, None, None, None, "req-open-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::SealRequired(_)));
    }

    #[tokio::test]
    async fn open_then_draw_then_repay_round_trips_principal() {
        let engine = engine();
        seal_borrower(&engine, "agent:borrower").await;
        fund(&engine, "agent:borrower", 1_000 * ck_types::USD).await;

        let opened = engine
            .open_line("agent:borrower", "agent:lender", 10_000 * ck_types::USD, None, None, None, "req-open-1")
            .await
            .unwrap();
        let credit_line_id = opened.receipt.payload["credit_line_id"].as_str().unwrap().to_string();

        let drawn = engine
            .draw(&credit_line_id, "agent:borrower", 1_000 * ck_types::USD, "req-draw-1")
            .await
            .unwrap();
        assert_eq!(drawn.position.principal_micros, 1_000 * ck_types::USD);

        // replaying the same request_hash must not double-apply the draw
        let replayed = engine
            .draw(&credit_line_id, "agent:borrower", 1_000 * ck_types::USD, "req-draw-1")
            .await
            .unwrap();
        assert_eq!(replayed.position.principal_micros, 1_000 * ck_types::USD);

        let repaid = engine
            .repay(&credit_line_id, "agent:borrower", 0, 0, 400 * ck_types::USD, "req-repay-1")
            .await
            .unwrap();
        assert_eq!(repaid.position.principal_micros, 600 * ck_types::USD);
    }

    #[tokio::test]
    async fn draw_past_remaining_limit_is_rejected() {
        let engine = engine();
        seal_borrower(&engine, "agent:borrower").await;
        fund(&engine, "agent:borrower", 1_000 * ck_types::USD).await;
        let opened = engine
            .open_line("agent:borrower", "agent:lender", 1_000 * ck_types::USD, None, None, None, "req-open-1")
            .await
            .unwrap();
        let credit_line_id = opened.receipt.payload["credit_line_id"].as_str().unwrap().to_string();

        let err = engine
            .draw(&credit_line_id, "agent:borrower", 2_000 * ck_types::USD, "req-draw-1")
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::DrawExceedsLimit { .. }));
    }

    #[tokio::test]
    async fn liquidation_applies_waterfall_and_reports_shortfall() {
        let engine = engine();
        seal_borrower(&engine, "agent:borrower").await;
        fund(&engine, "agent:borrower", 10_000 * ck_types::USD).await;
        let opened = engine
            .open_line("agent:borrower", "agent:lender", 1_000 * ck_types::USD, None, None, None, "req-open-1")
            .await
            .unwrap();
        let credit_line_id = opened.receipt.payload["credit_line_id"].as_str().unwrap().to_string();

        engine.draw(&credit_line_id, "agent:borrower", 100 * ck_types::USD, "req-draw-1").await.unwrap();
        engine
            .fee_apply(&credit_line_id, "origination", 5 * ck_types::USD, None, "req-fee-1")
            .await
            .unwrap();
        // force interest to 10 via a direct position update path is not exposed;
        // accrue naturally instead, then top up with fee_apply for determinism
        engine
            .collateral_lock(&credit_line_id, "asset:1", CollateralAssetType::External, 80 * ck_types::USD, "req-lock-1")
            .await
            .unwrap();

        let call = engine
            .margin_call(&credit_line_id, "call", None, Some(50 * ck_types::USD), Some(0), "req-margin-1")
            .await
            .unwrap();
        let margin_call_id = call.receipt.payload["margin_call_id"].as_str().unwrap().to_string();

        let liquidated = engine.liquidate(&credit_line_id, &margin_call_id, "req-liq-1").await.unwrap();
        assert_eq!(liquidated.position.principal_micros, 0);
        let line = engine.storage.get_line(&credit_line_id).await.unwrap().unwrap();
        assert_eq!(line.status, CreditLineStatus::Liquidated);
    }

    #[tokio::test]
    async fn collateral_unlock_rejects_already_unlocked_lock() {
        let engine = engine();
        seal_borrower(&engine, "agent:borrower").await;
        fund(&engine, "agent:borrower", 1_000 * ck_types::USD).await;
        let opened = engine
            .open_line("agent:borrower", "agent:lender", 1_000 * ck_types::USD, None, None, None, "req-open-1")
            .await
            .unwrap();
        let credit_line_id = opened.receipt.payload["credit_line_id"].as_str().unwrap().to_string();

        let locked = engine
            .collateral_lock(&credit_line_id, "asset:1", CollateralAssetType::External, 50 * ck_types::USD, "req-lock-1")
            .await
            .unwrap();
        let lock_id = locked.receipt.payload["lock_id"].as_str().unwrap().to_string();

        engine.collateral_unlock(&credit_line_id, &lock_id, "req-unlock-1").await.unwrap();
        let err = engine.collateral_unlock(&credit_line_id, &lock_id, "req-unlock-2").await.unwrap_err();
        assert!(matches!(err, CreditError::LockNotLocked(_)));
    }
}
