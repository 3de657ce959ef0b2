use crate::money::Micros;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreditLineStatus {
    Active,
    Suspended,
    Closed,
    Liquidated,
}

/// A credit line between a borrower and a lender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditLine {
    pub credit_line_id: String,
    pub borrower: String,
    pub lender: String,
    pub limit_micros: Micros,
    pub spread_bps: u32,
    pub maturity_ts_ms: Option<i64>,
    pub collateral_ratio_min_bps: u32,
    pub status: CreditLineStatus,
    pub created_at: DateTime<Utc>,
}

impl CreditLine {
    pub const DEFAULT_SPREAD_BPS: u32 = 200;
    pub const DEFAULT_COLLATERAL_RATIO_MIN_BPS: u32 = 15_000;
}

/// One-to-one with a [`CreditLine`]. All fields nonnegative, USD-micros.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct CreditPosition {
    pub principal_micros: Micros,
    pub interest_accrued_micros: Micros,
    pub fees_micros: Micros,
    pub last_accrual_ts_ms: Option<i64>,
    pub last_accrual_window: Option<String>,
}

impl CreditPosition {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Append-only per-credit-line event: receipt hash plus signed deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEventLogEntry {
    pub credit_line_id: String,
    pub event_type: String,
    pub receipt_hash: String,
    pub request_hash: String,
    pub delta_principal_micros: Micros,
    pub delta_interest_micros: Micros,
    pub delta_fees_micros: Micros,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollateralAssetType {
    Ian,
    Msr,
    Fc,
    External,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollateralStatus {
    Locked,
    Unlocked,
    Liquidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollateralLock {
    pub lock_id: String,
    pub credit_line_id: String,
    pub asset_ref: String,
    pub asset_type: CollateralAssetType,
    pub amount_micros: Micros,
    pub status: CollateralStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarginCallStatus {
    Pending,
    Resolved,
    Escalated,
    Liquidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginCall {
    pub margin_call_id: String,
    pub credit_line_id: String,
    pub required_amount_micros: Micros,
    pub due_ts_ms: i64,
    pub status: MarginCallStatus,
    pub resolved_ts_ms: Option<i64>,
}
