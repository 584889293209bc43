//! # Payment Service
//!
//! Where the transport boundary meets the ledger on a device.
//!
//! ```text
//! send_payment(receiver, amount)
//!   └─► engine.apply (debit leg) ─► transport.send(PAYMENT) ─► trigger sync
//!
//! on_message(body)
//!   ├─ PAYMENT      ─► engine.apply (credit leg) ─► send CONFIRMATION back
//!   ├─ CONFIRMATION ─► remembered for the UI
//!   └─ HELLO / bad  ─► logged
//! ```
//!
//! A failed send never undoes the debit: the sender's entry stays Pending
//! and is settled with the authority like any other.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::engine::{ApplyError, ApplyOutcome, LedgerEngine};
use crate::storage::StorageError;
use crate::sync::SyncTrigger;
use crate::transaction::{DeviceId, Transaction};
use crate::transport::{Transport, TransportError};
use crate::wire::{Confirmation, Payment, WireMessage};

/// How many received confirmations are kept for display.
const CONFIRMATION_HISTORY: usize = 64;

/// Result of [`PaymentService::send_payment`].
#[derive(Debug, Clone)]
pub struct SentPayment {
    pub transaction: Transaction,
    /// Why the payment could not be handed to the transport, if it could
    /// not. The debit stands either way.
    pub delivery_error: Option<TransportError>,
}

impl SentPayment {
    pub fn delivered(&self) -> bool {
        self.delivery_error.is_none()
    }
}

/// What [`PaymentService::on_message`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A payment was credited (or was a replay of one already credited).
    Credited(ApplyOutcome),
    /// A payment was refused; the sender was told why.
    Refused { reason: String },
    /// A confirmation was recorded.
    Confirmed,
    /// A peer introduced itself. Sessions are the adapter's business.
    Hello(DeviceId),
    /// The body could not be decoded.
    Malformed,
}

pub struct PaymentService {
    owner: DeviceId,
    engine: Arc<LedgerEngine>,
    transport: Arc<dyn Transport>,
    trigger: SyncTrigger,
    confirmations: Mutex<VecDeque<Confirmation>>,
}

impl PaymentService {
    pub fn new(
        owner: DeviceId,
        engine: Arc<LedgerEngine>,
        transport: Arc<dyn Transport>,
        trigger: SyncTrigger,
    ) -> Self {
        Self {
            owner,
            engine,
            transport,
            trigger,
            confirmations: Mutex::new(VecDeque::new()),
        }
    }

    pub fn owner(&self) -> &DeviceId {
        &self.owner
    }

    pub fn engine(&self) -> &Arc<LedgerEngine> {
        &self.engine
    }

    /// Debit the owner and send the payment to `receiver`.
    ///
    /// # Errors
    ///
    /// Only a refused or failed local apply is an error. Delivery problems
    /// are reported in [`SentPayment::delivery_error`].
    pub async fn send_payment(
        &self,
        receiver: DeviceId,
        amount: Decimal,
    ) -> Result<SentPayment, ApplyError> {
        let tx = Transaction::new(self.owner.clone(), receiver, amount);
        self.engine.apply(&tx)?;
        self.trigger.notify();

        let delivery_error = match self.deliver(&tx.receiver_id, WireMessage::Payment(Payment::from(&tx))).await {
            Ok(()) => {
                info!(tx_id = %tx.id, receiver = %tx.receiver_id, amount = %tx.amount, "payment sent");
                None
            }
            Err(e) => {
                warn!(tx_id = %tx.id, receiver = %tx.receiver_id, error = %e, "payment not delivered, debit stands");
                Some(e)
            }
        };

        Ok(SentPayment {
            transaction: tx,
            delivery_error,
        })
    }

    /// Handle one message body delivered by the transport.
    ///
    /// Only a local storage failure is an error; everything a peer can send
    /// is handled and logged.
    pub async fn on_message(&self, body: &[u8]) -> Result<MessageOutcome, StorageError> {
        let message = match WireMessage::from_bytes(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = body.len(), "dropping malformed message");
                return Ok(MessageOutcome::Malformed);
            }
        };
        debug!(kind = message.kind(), "message received");

        match message {
            WireMessage::Payment(payment) => self.receive_payment(payment).await,
            WireMessage::Confirmation(confirmation) => {
                info!(
                    tx_id = %confirmation.transaction.id,
                    status = ?confirmation.status,
                    reason = confirmation.reason.as_deref().unwrap_or(""),
                    "confirmation received"
                );
                let mut history = self.confirmations.lock();
                if history.len() == CONFIRMATION_HISTORY {
                    history.pop_front();
                }
                history.push_back(confirmation);
                Ok(MessageOutcome::Confirmed)
            }
            WireMessage::Hello { device_id } => Ok(MessageOutcome::Hello(device_id)),
        }
    }

    async fn receive_payment(&self, payment: Payment) -> Result<MessageOutcome, StorageError> {
        let tx = payment.to_transaction();
        let (outcome, reply) = match self.engine.apply(&tx) {
            Ok(applied) => {
                if !applied.replayed {
                    self.trigger.notify();
                }
                (MessageOutcome::Credited(applied), Confirmation::success(payment))
            }
            Err(ApplyError::Rejected(e)) => {
                let reason = e.to_string();
                (
                    MessageOutcome::Refused {
                        reason: reason.clone(),
                    },
                    Confirmation::error(payment, reason),
                )
            }
            Err(ApplyError::Storage(e)) => {
                let reply = Confirmation::error(payment, "receiver storage failure");
                if let Err(send_err) = self.deliver(&tx.sender_id, WireMessage::Confirmation(reply)).await {
                    debug!(error = %send_err, "confirmation not delivered");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.deliver(&tx.sender_id, WireMessage::Confirmation(reply)).await {
            debug!(tx_id = %tx.id, error = %e, "confirmation not delivered");
        }
        Ok(outcome)
    }

    async fn deliver(&self, device: &DeviceId, message: WireMessage) -> Result<(), TransportError> {
        let body = message
            .to_bytes()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        self.transport.send(device, Bytes::from(body)).await
    }

    /// Confirmations received so far, oldest first.
    pub fn recent_confirmations(&self) -> Vec<Confirmation> {
        self.confirmations.lock().iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
