//! # Storage Module
//!
//! Durable ground truth for one ledger: account balances plus the
//! append-only transaction log.
//!
//! ```text
//! db.rs - sled persistence: accounts, transactions, log, metadata trees
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! LedgerEngine::apply ──► LedgerDB::append ──► accounts + transactions + log
//!                                                   (one sled transaction)
//! SyncReconciler ───────► LedgerDB::set_sync_states / set_sync_cursor
//! Query surface ────────► LedgerDB::balance / transactions_for
//! ```
//!
//! Bincode on disk, JSON only at the edges.

pub mod db;

pub use db::{LedgerDB, StorageError, StorageResult};
