use crate::money::Micros;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub allocation_id: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount_micros: Micros,
    pub fee_micros: Micros,
    pub fee_bps: u32,
    pub window_id: Option<String>,
    pub request_hash: String,
    pub receipt_hash: String,
}
