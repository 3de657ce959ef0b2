use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-agent conformance stamp gating enterprise-tier operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seal {
    pub target: String,
    pub conformance_hash: String,
    pub issued_at: DateTime<Utc>,
    pub receipt_hash: String,
}
