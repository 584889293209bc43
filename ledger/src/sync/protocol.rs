//! Request/response bodies of the authority's sync endpoint.
//!
//! ```text
//! POST /api/sync
//!   { "deviceId": "…", "transactions": [Transaction, …] }
//! ← { "success": true, "acceptedIds": ["…"], "rejectedIds": ["…"] }
//! ```

use serde::{Deserialize, Serialize};

use crate::transaction::{DeviceId, Transaction, TransactionId};

/// A device's batch of pending transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub device_id: DeviceId,
    pub transactions: Vec<Transaction>,
}

/// The authority's verdict on a batch.
///
/// Ids missing from both lists were not judged and stay pending on the
/// device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    #[serde(default)]
    pub accepted_ids: Vec<TransactionId>,
    #[serde(default)]
    pub rejected_ids: Vec<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResponse {
    /// A response that judged nothing: the batch was not processed at all.
    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            accepted_ids: Vec::new(),
            rejected_ids: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn has_verdicts(&self) -> bool {
        !self.accepted_ids.is_empty() || !self.rejected_ids.is_empty()
    }
}
