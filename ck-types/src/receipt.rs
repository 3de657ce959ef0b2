use serde::{Deserialize, Serialize};

/// A fully-sealed, content-addressed receipt.
///
/// `payload` carries every field that went into the hash: the receipt kind's
/// hard attributes plus the common `issuer`/`kernel_pubkey`/`timestamp_ms`/
/// `request_hash` fields. `receipt_type`, `issuer`, `kernel_pubkey`,
/// `timestamp_ms`, and `request_hash` are duplicated here as first-class
/// columns purely for storage indexing and query convenience; they are never
/// re-derived from anything but `payload` and must always agree with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptEnvelope {
    pub receipt_hash: String,
    pub kernel_signature: String,
    pub receipt_type: String,
    pub issuer: String,
    pub kernel_pubkey: String,
    pub timestamp_ms: i64,
    pub request_hash: String,
    pub payload: serde_json::Value,
}
