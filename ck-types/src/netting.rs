use crate::money::Micros;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NettingJobStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NettingJob {
    pub job_id: String,
    pub agent: String,
    pub input_hash: String,
    pub receipt_hashes: Vec<String>,
    pub status: NettingJobStatus,
    pub ian_payload: Option<Value>,
    pub fee_charged_micros: Micros,
}
