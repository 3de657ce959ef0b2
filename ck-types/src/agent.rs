use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered principal. Identity is the Ed25519 public key (hex-encoded).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub agent_id: String,
    pub display_name: String,
    pub pubkey_hex: String,
    pub lifetime_volume_micros: i64,
    pub free_settlements_used: u32,
    pub free_settlements_period_start_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>, pubkey_hex: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            pubkey_hex: pubkey_hex.into(),
            lifetime_volume_micros: 0,
            free_settlements_used: 0,
            free_settlements_period_start_ms: now.timestamp_millis(),
            created_at: now,
        }
    }
}
