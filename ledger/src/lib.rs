// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tally - Offline Ledger & Synchronization Engine
//!
//! Devices pay each other while disconnected from any central server, each
//! keeping its own ledger, and reconcile with an authority whenever it can
//! be reached.
//!
//! ## Architecture
//!
//! - **config** - Amount bounds, opening balance, sync timing, ports.
//! - **transaction** - Ids, transactions, accounts, and pure validation.
//! - **storage** - sled-backed store: balances plus an append-only log.
//! - **engine** - Atomic, idempotent apply from a device's or the
//!   authority's perspective.
//! - **sync** - Reconciler, retry policy, HTTP authority client, timer loop.
//! - **authority** - The canonical ledger that judges sync batches.
//! - **wire** - PAYMENT / CONFIRMATION / HELLO messages and framing.
//! - **transport** - Byte-delivery trait and the peer session registry.
//! - **service** - Sending and receiving payments on a device.
//!
//! ## Consistency Model
//!
//! Each device applies only its own leg of a payment; there is no
//! cross-device commit. Redelivery is harmless because transaction ids are
//! primary keys. Conflicts the authority finds at sync time come back as
//! `Rejected` entries and are never silently corrected.

pub mod authority;
pub mod config;
pub mod engine;
pub mod service;
pub mod storage;
pub mod sync;
pub mod transaction;
pub mod transport;
pub mod wire;

pub use authority::{Authority, SyncJudgement};
pub use engine::{ApplyError, ApplyOutcome, LedgerEngine, Perspective};
pub use service::{MessageOutcome, PaymentService, SentPayment};
pub use storage::{LedgerDB, StorageError};
pub use sync::{HttpAuthority, RemoteAuthority, SyncOutcome, SyncReconciler, SyncTrigger};
pub use transaction::{Account, DeviceId, SyncState, Transaction, TransactionId, ValidationError};
pub use transport::{SessionRegistry, Transport, TransportError};
