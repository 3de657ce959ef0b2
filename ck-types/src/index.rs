use serde::{Deserialize, Serialize};

/// A single append-only leaf within an index window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexLeaf {
    pub window_id: String,
    pub position: u64,
    pub leaf_type: String,
    pub payload_hash: String,
    pub leaf_hash: String,
    pub submitted_at_ms: i64,
}

/// A window of the append-only index: mutable while open, immutable once closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexWindow {
    pub window_id: String,
    pub previous_window_id: Option<String>,
    pub previous_root_hash: Option<String>,
    pub opened_at_ms: i64,
    pub closed_at_ms: Option<i64>,
    pub leaf_count: u64,
    pub root_hash: Option<String>,
    pub kernel_signature: Option<String>,
}

impl IndexWindow {
    pub fn is_open(&self) -> bool {
        self.closed_at_ms.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProofDirection {
    Left,
    Right,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: String,
    pub direction: ProofDirection,
}

/// A Merkle inclusion proof for one leaf of a closed window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InclusionProof {
    pub window_id: String,
    pub leaf_hash: String,
    pub position: u64,
    pub path: Vec<ProofStep>,
    pub root_hash: String,
    pub signed_head: String,
}
