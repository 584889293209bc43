//! Transport boundary: the byte-delivery interface the core sends through,
//! and the registry of live peer sessions an adapter maintains.
//!
//! The core never owns sockets. An adapter (TCP, serial, Bluetooth) frames
//! bytes on the wire, calls [`PaymentService::on_message`] with each
//! inbound body, and registers an outbound channel per connected peer in a
//! [`SessionRegistry`]. The registry is what the core sends through.
//!
//! Delivery is best-effort, at-least-once and unordered. Nothing in the
//! core depends on a send succeeding.
//!
//! [`PaymentService::on_message`]: crate::service::PaymentService::on_message

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transaction::DeviceId;

/// Failure to move bytes to a peer or to the authority.
///
/// Never fatal. Pending entries stay eligible for the next sync, and a
/// payment that could not be delivered stays applied on the sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("no session for device {0}")]
    NoSession(DeviceId),

    #[error("session closed")]
    Closed,
}

/// Outbound half of the transport adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one message body to the adapter for delivery to `device`.
    async fn send(&self, device: &DeviceId, body: Bytes) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Live peer sessions, keyed by the device id each peer announced.
///
/// Each session is the sending half of a channel drained by that
/// connection's writer task. Dropping the writer closes the channel; the
/// next send to that device fails with [`TransportError::Closed`] and the
/// session is removed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<DeviceId, mpsc::Sender<Bytes>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device`, replacing any older session for it.
    pub fn register(&self, device: DeviceId, outbound: mpsc::Sender<Bytes>) {
        debug!(device = %device, "session registered");
        self.sessions.insert(device, outbound);
    }

    /// Remove `device`'s session if it is still the one feeding `outbound`.
    /// A newer session registered by a reconnect is left alone.
    pub fn unregister(&self, device: &DeviceId, outbound: &mpsc::Sender<Bytes>) -> bool {
        let removed = self
            .sessions
            .remove_if(device, |_, current| current.same_channel(outbound))
            .is_some();
        if removed {
            debug!(device = %device, "session removed");
        }
        removed
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.sessions.contains_key(device)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Devices with a live session, in no particular order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl Transport for SessionRegistry {
    async fn send(&self, device: &DeviceId, body: Bytes) -> Result<(), TransportError> {
        // Clone the sender out so no map guard is held across the await.
        let outbound = self
            .sessions
            .get(device)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::NoSession(device.clone()))?;

        if outbound.send(body).await.is_err() {
            self.unregister(device, &outbound);
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}
