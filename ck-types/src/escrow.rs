use crate::money::Micros;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Locked,
    Released,
    Disputed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub escrow_id: String,
    pub buyer: String,
    pub seller: String,
    pub amount_micros: Micros,
    pub description: String,
    pub expires_at: DateTime<Utc>,
    pub status: EscrowStatus,
}
