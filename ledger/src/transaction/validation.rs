//! Transaction validation: the checks a transfer must pass before it may
//! touch the store.
//!
//! [`validate`] is pure. It reads the sender's balance and asks whether an
//! id is already logged, but never mutates anything, so the engine can run
//! it inside its critical section and commit only on `Ok`.

use rust_decimal::Decimal;
use thiserror::Error;

use super::types::{DeviceId, Transaction, TransactionId};
use crate::config::LedgerLimits;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why a transaction was refused locally.
///
/// Validation failures are final: they are reported to whoever attempted
/// the apply and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The amount is zero or negative.
    #[error("invalid amount {amount}: must be a positive number")]
    InvalidAmount { amount: Decimal },

    /// The amount is positive but outside the configured transfer bounds.
    #[error("amount {amount} outside allowed range [{min}, {max}]")]
    OutOfRange {
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },

    /// Sender and receiver are the same identity.
    #[error("sender and receiver must differ: both are {device}")]
    SelfTransfer { device: DeviceId },

    /// The id is already present in the local log with a different payload,
    /// or is being delivered a second time.
    #[error("duplicate transaction {id}")]
    DuplicateTransaction { id: TransactionId },

    /// The sender cannot cover the amount.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    /// Neither party of the transaction is the device applying it.
    #[error("transaction {id} does not involve device {device}")]
    ForeignTransaction { id: TransactionId, device: DeviceId },

    /// The authority already judged this transfer and refused it.
    #[error("transaction {id} was already rejected")]
    PreviouslyRejected { id: TransactionId },
}

impl ValidationError {
    /// Stable short name, used as a metrics label and in confirmation
    /// messages sent back to peers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidAmount { .. } => "InvalidAmount",
            Self::OutOfRange { .. } => "OutOfRange",
            Self::SelfTransfer { .. } => "SelfTransfer",
            Self::DuplicateTransaction { .. } => "DuplicateTransaction",
            Self::InsufficientBalance { .. } => "InsufficientBalance",
            Self::ForeignTransaction { .. } => "ForeignTransaction",
            Self::PreviouslyRejected { .. } => "PreviouslyRejected",
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// What the validator knows about the sender's funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderFunds {
    /// The sender's account is held by this store; its balance is checked.
    Known(Decimal),
    /// The sender is another device. Its balance is not observable here,
    /// so the sufficiency check belongs to the sender's own device and to
    /// the authority at sync time.
    Remote,
}

/// Checks `tx` against the limits, the local log and the sender's funds.
///
/// The checks, in order:
///
/// 1. **Amount** must be positive.
/// 2. **Range**: `min_transaction <= amount <= max_transaction`.
/// 3. **Parties**: sender must differ from receiver.
/// 4. **Duplicate**: `tx.id` must not already be logged.
/// 5. **Funds**: with [`SenderFunds::Known`], balance must cover the amount.
///
/// # Errors
///
/// Returns the first failing check.
pub fn validate<F>(
    tx: &Transaction,
    limits: &LedgerLimits,
    sender_funds: SenderFunds,
    is_known: F,
) -> Result<(), ValidationError>
where
    F: Fn(&TransactionId) -> bool,
{
    if tx.amount <= Decimal::ZERO {
        return Err(ValidationError::InvalidAmount { amount: tx.amount });
    }

    if tx.amount < limits.min_transaction || tx.amount > limits.max_transaction {
        return Err(ValidationError::OutOfRange {
            amount: tx.amount,
            min: limits.min_transaction,
            max: limits.max_transaction,
        });
    }

    if tx.sender_id == tx.receiver_id {
        return Err(ValidationError::SelfTransfer {
            device: tx.sender_id.clone(),
        });
    }

    if is_known(&tx.id) {
        return Err(ValidationError::DuplicateTransaction { id: tx.id.clone() });
    }

    if let SenderFunds::Known(balance) = sender_funds {
        if balance < tx.amount {
            return Err(ValidationError::InsufficientBalance {
                required: tx.amount,
                available: balance,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn transfer(id: &str, amount: i64) -> Transaction {
        let mut tx = Transaction::new(
            DeviceId::new("alice"),
            DeviceId::new("bob"),
            Decimal::from(amount),
        );
        tx.id = TransactionId::new(id);
        tx
    }

    fn nothing_known(_: &TransactionId) -> bool {
        false
    }

    #[test]
    fn accepts_valid_transfer() {
        let tx = transfer("t1", 200);
        let funds = SenderFunds::Known(Decimal::from(1_000));
        assert!(validate(&tx, &LedgerLimits::default(), funds, nothing_known).is_ok());
    }

    #[test]
    fn rejects_zero_and_negative_amounts() {
        let limits = LedgerLimits::default();
        let funds = SenderFunds::Known(Decimal::from(1_000));
        for amount in [0, -50] {
            let err = validate(&transfer("t1", amount), &limits, funds, nothing_known).unwrap_err();
            assert!(matches!(err, ValidationError::InvalidAmount { .. }), "{amount}");
            assert_eq!(err.kind(), "InvalidAmount");
        }
    }

    #[test]
    fn rejects_amounts_outside_range() {
        let limits = LedgerLimits::default();
        let funds = SenderFunds::Known(Decimal::from(1_000_000));

        let mut too_small = transfer("t1", 1);
        too_small.amount = "0.5".parse().unwrap();
        let err = validate(&too_small, &limits, funds, nothing_known).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));

        let err = validate(&transfer("t2", 10_001), &limits, funds, nothing_known).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));

        // Both bounds are inclusive.
        assert!(validate(&transfer("t3", 1), &limits, funds, nothing_known).is_ok());
        assert!(validate(&transfer("t4", 10_000), &limits, funds, nothing_known).is_ok());
    }

    #[test]
    fn rejects_self_transfer() {
        let mut tx = transfer("t1", 10);
        tx.receiver_id = tx.sender_id.clone();
        let funds = SenderFunds::Known(Decimal::from(1_000));
        let err = validate(&tx, &LedgerLimits::default(), funds, nothing_known).unwrap_err();
        assert!(matches!(err, ValidationError::SelfTransfer { .. }));
    }

    #[test]
    fn rejects_insufficient_balance() {
        let tx = transfer("t1", 1_500);
        let funds = SenderFunds::Known(Decimal::from(1_000));
        let err = validate(&tx, &LedgerLimits::default(), funds, nothing_known).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InsufficientBalance {
                required: Decimal::from(1_500),
                available: Decimal::from(1_000),
            }
        );
        assert_eq!(
            err.to_string(),
            "insufficient balance: required 1500, available 1000"
        );
    }

    #[test]
    fn remote_sender_skips_balance_check() {
        let tx = transfer("t1", 5_000);
        assert!(validate(&tx, &LedgerLimits::default(), SenderFunds::Remote, nothing_known).is_ok());
    }

    #[test]
    fn first_failing_check_wins() {
        // Negative amount and a known id: the amount check runs first.
        let tx = transfer("t1", -1);
        let err = validate(&tx, &LedgerLimits::default(), SenderFunds::Known(Decimal::ZERO), |_| {
            true
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAmount { .. }));

        // Duplicate is reported before insufficient funds.
        let tx = transfer("t2", 100);
        let err = validate(&tx, &LedgerLimits::default(), SenderFunds::Known(Decimal::ZERO), |_| {
            true
        })
        .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateTransaction { .. }));
    }

    #[test]
    fn second_delivery_is_duplicate_in_any_order() {
        let limits = LedgerLimits::default();
        let funds = SenderFunds::Remote;
        let batch = vec![transfer("a", 10), transfer("b", 20), transfer("c", 30)];

        for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let mut seen: HashSet<TransactionId> = HashSet::new();
            for &i in order.iter().chain(order.iter().rev()) {
                let tx = &batch[i];
                let result = validate(tx, &limits, funds, |id| seen.contains(id));
                if seen.contains(&tx.id) {
                    assert!(matches!(
                        result,
                        Err(ValidationError::DuplicateTransaction { .. })
                    ));
                } else {
                    assert!(result.is_ok());
                    seen.insert(tx.id.clone());
                }
            }
            assert_eq!(seen.len(), 3);
        }
    }
}
