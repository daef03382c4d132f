use serde::{Deserialize, Serialize};

use taskrelay_core::TaskId;
use taskrelay_infra::SubmitReceipt;

// -------------------------
// Request DTOs
// -------------------------

/// `GET /api/tasks?task=...` (only consulted when the body is empty).
#[derive(Debug, Default, Deserialize)]
pub struct SubmitTaskQuery {
    pub task: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub id: TaskId,
    pub payload: String,
    pub processed: bool,
    pub attempts: u32,
    pub invocation_id: String,
    pub message: String,
}

impl From<SubmitReceipt> for SubmitTaskResponse {
    fn from(receipt: SubmitReceipt) -> Self {
        let payload = receipt.record.payload.into_inner();
        Self {
            id: receipt.record.id,
            message: format!("Task added: {payload}"),
            payload,
            processed: receipt.record.processed,
            attempts: receipt.attempts,
            invocation_id: receipt.invocation_id.to_string(),
        }
    }
}
