//! # Transaction Module
//!
//! The vocabulary of the ledger and the rules a transfer must satisfy.
//!
//! ```text
//! types.rs      - DeviceId, TransactionId, Transaction, Account, SyncState, LogEntry
//! validation.rs - Pure pre-commit checks (amount, range, duplicate id, funds)
//! ```
//!
//! Amounts are `rust_decimal::Decimal`. No floating point anywhere near
//! money, even though the devices talk JSON.

pub mod types;
pub mod validation;

pub use types::{Account, DeviceId, LogEntry, SyncState, Transaction, TransactionId};
pub use validation::{validate, SenderFunds, ValidationError};
