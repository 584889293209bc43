//! # Peer Transport
//!
//! TCP adapter between devices. Every connection carries length-prefixed
//! JSON frames in both directions:
//!
//! ```text
//! connect ─► send HELLO{our id}
//!   reader: bytes ─► FrameDecoder ─► PaymentService::on_message
//!           HELLO{peer id} ─► SessionRegistry::register(peer id, outbound)
//!   writer: outbound mpsc ─► encode_frame ─► socket
//! disconnect ─► SessionRegistry::unregister(peer id, outbound)
//! ```
//!
//! Payments to a device with no live session fail with `NoSession`; the
//! debit on the sender stands and settles through the authority.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tally_ledger::wire::{encode_frame, FrameDecoder, WireMessage};
use tally_ledger::{DeviceId, MessageOutcome, PaymentService, SessionRegistry};

use crate::metrics::SharedMetrics;

/// Outbound frames buffered per connection before senders wait.
const OUTBOUND_CAPACITY: usize = 32;

/// Read buffer size per connection.
const READ_CHUNK: usize = 4096;

/// Accepts and dials peer connections for one device.
pub struct PeerNetwork {
    registry: Arc<SessionRegistry>,
    service: Arc<PaymentService>,
    metrics: SharedMetrics,
    shutdown: watch::Receiver<bool>,
}

impl PeerNetwork {
    pub fn new(
        registry: Arc<SessionRegistry>,
        service: Arc<PaymentService>,
        metrics: SharedMetrics,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            service,
            metrics,
            shutdown,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept peers until shutdown.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "peer connected");
                        tokio::spawn(Arc::clone(&self).run_connection(stream, addr));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("peer listener stopped");
    }

    /// Connect to a peer at `addr`. The session is usable once the peer's
    /// HELLO has arrived.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to peer at {}", addr))?;
        info!(peer = %addr, "dialed peer");
        tokio::spawn(Arc::clone(self).run_connection(stream, addr));
        Ok(())
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (mut reader, writer) = stream.into_split();
        let (outbound, inbound) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        tokio::spawn(write_frames(writer, inbound, addr));

        let hello = WireMessage::Hello {
            device_id: self.service.owner().clone(),
        };
        match hello.to_bytes() {
            Ok(body) => {
                if outbound.send(Bytes::from(body)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to encode hello");
                return;
            }
        }

        let mut shutdown = self.shutdown.clone();
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut peer: Option<DeviceId> = None;

        'conn: loop {
            let read = tokio::select! {
                read = reader.read(&mut chunk) => read,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'conn;
                    }
                    continue;
                }
            };

            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %addr, error = %e, "read failed");
                    break;
                }
            };
            decoder.extend(&chunk[..n]);

            loop {
                let frame = match decoder.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(peer = %addr, error = %e, "bad frame, closing connection");
                        break 'conn;
                    }
                };
                self.handle_frame(&frame, &outbound, &mut peer, addr).await;
            }
        }

        if let Some(device) = peer {
            if self.registry.unregister(&device, &outbound) {
                self.metrics.connected_peers.set(self.registry.len() as i64);
            }
            info!(peer = %addr, device = %device, "peer disconnected");
        }
    }

    async fn handle_frame(
        &self,
        frame: &[u8],
        outbound: &mpsc::Sender<Bytes>,
        peer: &mut Option<DeviceId>,
        addr: SocketAddr,
    ) {
        match self.service.on_message(frame).await {
            Ok(MessageOutcome::Hello(device)) => {
                info!(peer = %addr, device = %device, "peer identified");
                self.registry.register(device.clone(), outbound.clone());
                self.metrics.connected_peers.set(self.registry.len() as i64);
                *peer = Some(device);
            }
            Ok(MessageOutcome::Credited(outcome)) => {
                if !outcome.replayed {
                    self.metrics.payments_applied_total.inc();
                }
            }
            Ok(MessageOutcome::Refused { .. }) => self.metrics.record_rejection("peer_refused"),
            Ok(MessageOutcome::Confirmed) | Ok(MessageOutcome::Malformed) => {}
            Err(e) => warn!(peer = %addr, error = %e, "failed to process peer message"),
        }
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut inbound: mpsc::Receiver<Bytes>, addr: SocketAddr) {
    while let Some(body) = inbound.recv().await {
        let frame = match encode_frame(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %addr, error = %e, "dropping oversized message");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            debug!(peer = %addr, error = %e, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
