use crate::money::Micros;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-agent (or treasury) credit balance. Invariant: `balance >= 0` after
/// every committed transaction — enforced by `ck-wallet`, not by this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wallet {
    pub wallet_id: String,
    pub balance_micros: Micros,
}

impl Wallet {
    pub fn empty(wallet_id: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            balance_micros: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalletTransactionKind {
    Credit,
    Deduct,
}

/// Append-only log entry recorded alongside every wallet mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub entry_id: String,
    pub wallet_id: String,
    pub kind: WalletTransactionKind,
    pub amount_micros: Micros,
    pub reference_type: String,
    pub reference: String,
    pub balance_after_micros: Micros,
    pub timestamp: DateTime<Utc>,
}
