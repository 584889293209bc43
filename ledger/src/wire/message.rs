//! Application-level messages exchanged between devices.
//!
//! JSON objects tagged by `"type"`:
//!
//! ```json
//! {"type":"PAYMENT","id":"tx_…","senderId":"…","receiverId":"…","amount":"200","timestamp":"…"}
//! {"type":"CONFIRMATION","status":"success","transaction":{…}}
//! {"type":"HELLO","deviceId":"…"}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::codec::CodecError;
use crate::transaction::types::amount_serde;
use crate::transaction::{DeviceId, Transaction, TransactionId};

/// A transfer as carried between devices. Sync state is local bookkeeping
/// and never crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: TransactionId,
    pub sender_id: DeviceId,
    pub receiver_id: DeviceId,
    #[serde(with = "amount_serde")]
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Payment {
    /// The transaction the receiving device applies, starting `Pending`.
    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            amount: self.amount,
            timestamp: self.timestamp,
            sync_state: Default::default(),
        }
    }
}

impl From<&Transaction> for Payment {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id.clone(),
            sender_id: tx.sender_id.clone(),
            receiver_id: tx.receiver_id.clone(),
            amount: tx.amount,
            timestamp: tx.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Success,
    Error,
}

/// Receiver's answer to a payment. UI feedback only: the sender's ledger is
/// already final whatever this says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub status: ConfirmationStatus,
    pub transaction: Payment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Confirmation {
    pub fn success(transaction: Payment) -> Self {
        Self {
            status: ConfirmationStatus::Success,
            transaction,
            reason: None,
        }
    }

    pub fn error(transaction: Payment, reason: impl Into<String>) -> Self {
        Self {
            status: ConfirmationStatus::Error,
            transaction,
            reason: Some(reason.into()),
        }
    }
}

/// Every message kind a device may receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "PAYMENT")]
    Payment(Payment),

    #[serde(rename = "CONFIRMATION")]
    Confirmation(Confirmation),

    /// First message on a peer connection: who is on the other end.
    #[serde(rename = "HELLO", rename_all = "camelCase")]
    Hello { device_id: DeviceId },
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Payment(_) => "PAYMENT",
            Self::Confirmation(_) => "CONFIRMATION",
            Self::Hello { .. } => "HELLO",
        }
    }
}
