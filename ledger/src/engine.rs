//! # Local Apply Engine
//!
//! Turns a validated transfer into a committed change of the ledger store.
//!
//! ## Perspectives
//!
//! A payment between two devices is never committed atomically across both
//! of them. Each ledger applies only the leg it owns:
//!
//! ```text
//!   Sender device            Receiver device           Authority
//!   Perspective::Device(A)   Perspective::Device(B)    Perspective::Authority
//!   ─────────────────────    ──────────────────────    ──────────────────────
//!   debit A  (funds known)   credit B (funds remote)   debit A + credit B
//!   log t1 Pending           log t1 Pending            log t1 Synced
//! ```
//!
//! If the payment never reaches B, A stays debited and its entry stays
//! Pending. Nothing is rolled back automatically.
//!
//! ## Critical Section
//!
//! Every mutation runs under one `parking_lot::Mutex`: read current state,
//! validate, then commit through [`LedgerDB::append`] (a single multi-tree
//! sled transaction). Readers go straight to sled and only ever observe
//! committed state.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::LedgerLimits;
use crate::storage::{LedgerDB, StorageError, StorageResult};
use crate::transaction::{
    validate, Account, DeviceId, SenderFunds, SyncState, Transaction, TransactionId,
    ValidationError,
};

// ---------------------------------------------------------------------------
// Perspective
// ---------------------------------------------------------------------------

/// Whose ledger this engine maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Perspective {
    /// A device's local ledger. Only the owner's account is ever mutated.
    Device(DeviceId),
    /// The authority's canonical ledger. Both legs of every transfer apply.
    Authority,
}

// ---------------------------------------------------------------------------
// Outcome & Errors
// ---------------------------------------------------------------------------

/// Result of a successful [`LedgerEngine::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Log position of the transaction.
    pub sequence: u64,
    /// `true` if the transaction was already logged and this call changed
    /// nothing.
    pub replayed: bool,
}

/// Why an apply did not commit.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Refused by validation. Final; the caller should not retry.
    #[error("transaction rejected: {0}")]
    Rejected(#[from] ValidationError),

    /// The store failed. Nothing was applied.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ApplyError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected(e) => e.kind(),
            Self::Storage(_) => "StorageError",
        }
    }

    /// The validation failure, if that is what this is.
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Storage(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerEngine
// ---------------------------------------------------------------------------

/// Serialized entry point for every ledger mutation.
///
/// Share it behind an `Arc`. `apply`, `mark_settled` and `reset_cursor`
/// take the write lock; queries do not.
#[derive(Debug)]
pub struct LedgerEngine {
    db: LedgerDB,
    perspective: Perspective,
    limits: LedgerLimits,
    write_lock: Mutex<()>,
}

impl LedgerEngine {
    pub fn new(db: LedgerDB, perspective: Perspective, limits: LedgerLimits) -> Self {
        Self {
            db,
            perspective,
            limits,
            write_lock: Mutex::new(()),
        }
    }

    pub fn perspective(&self) -> &Perspective {
        &self.perspective
    }

    pub fn limits(&self) -> &LedgerLimits {
        &self.limits
    }

    pub fn db(&self) -> &LedgerDB {
        &self.db
    }

    /// The device this engine belongs to, or `None` for the authority.
    pub fn owner(&self) -> Option<&DeviceId> {
        match &self.perspective {
            Perspective::Device(owner) => Some(owner),
            Perspective::Authority => None,
        }
    }

    /// Create `id` with the initial balance unless it already exists.
    pub fn ensure_account(&self, id: &DeviceId) -> StorageResult<Account> {
        let _guard = self.write_lock.lock();
        self.db.create_account(id, self.limits.initial_balance)
    }

    /// Validate and commit `tx` from this engine's perspective.
    ///
    /// Redelivering a transaction that is already logged with the same
    /// parties and amount returns `replayed: true` and changes nothing. The
    /// same id with a different payload is a [`ValidationError::DuplicateTransaction`].
    pub fn apply(&self, tx: &Transaction) -> Result<ApplyOutcome, ApplyError> {
        let _guard = self.write_lock.lock();

        let existing = self.db.get_transaction(&tx.id)?;
        if let Some(entry) = &existing {
            if entry.transaction.same_transfer(tx) {
                debug!(tx_id = %tx.id, sequence = entry.sequence, "replayed transaction ignored");
                return Ok(ApplyOutcome {
                    sequence: entry.sequence,
                    replayed: true,
                });
            }
        }
        let is_known = |_: &TransactionId| existing.is_some();

        let (updates, stored_state) = match &self.perspective {
            Perspective::Device(owner) if owner == &tx.sender_id => {
                let account = self.load_or_initial(owner)?;
                self.check(tx, SenderFunds::Known(account.balance), is_known)?;
                let debited = Account::new(owner.clone(), account.balance - tx.amount);
                (vec![debited], SyncState::Pending)
            }
            Perspective::Device(owner) if owner == &tx.receiver_id => {
                let account = self.load_or_initial(owner)?;
                self.check(tx, SenderFunds::Remote, is_known)?;
                let credited = Account::new(owner.clone(), account.balance + tx.amount);
                (vec![credited], SyncState::Pending)
            }
            Perspective::Device(owner) => {
                let err = ValidationError::ForeignTransaction {
                    id: tx.id.clone(),
                    device: owner.clone(),
                };
                warn!(tx_id = %tx.id, reason = err.kind(), "transaction rejected");
                return Err(err.into());
            }
            Perspective::Authority => {
                let sender = self.load_or_initial(&tx.sender_id)?;
                let receiver = self.load_or_initial(&tx.receiver_id)?;
                self.check(tx, SenderFunds::Known(sender.balance), is_known)?;
                let debited = Account::new(sender.id, sender.balance - tx.amount);
                let credited = Account::new(receiver.id, receiver.balance + tx.amount);
                (vec![debited, credited], SyncState::Synced)
            }
        };

        let mut record = tx.clone();
        record.sync_state = stored_state;

        let sequence = match self.db.append(&record, &updates) {
            Ok(sequence) => sequence,
            Err(StorageError::DuplicateKey(id)) => {
                return Err(ValidationError::DuplicateTransaction { id }.into());
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            tx_id = %tx.id,
            sender = %tx.sender_id,
            receiver = %tx.receiver_id,
            amount = %tx.amount,
            sequence,
            "transaction applied"
        );

        Ok(ApplyOutcome {
            sequence,
            replayed: false,
        })
    }

    fn check<F>(&self, tx: &Transaction, funds: SenderFunds, is_known: F) -> Result<(), ApplyError>
    where
        F: Fn(&TransactionId) -> bool,
    {
        validate(tx, &self.limits, funds, is_known).map_err(|e| {
            warn!(tx_id = %tx.id, reason = e.kind(), error = %e, "transaction rejected");
            ApplyError::Rejected(e)
        })
    }

    /// Current account, or a not-yet-stored one holding the initial
    /// balance. It is persisted by the same commit as the transfer.
    fn load_or_initial(&self, id: &DeviceId) -> StorageResult<Account> {
        Ok(self
            .db
            .get_account(id)?
            .unwrap_or_else(|| Account::new(id.clone(), self.limits.initial_balance)))
    }

    // -- Sync state ---------------------------------------------------------

    /// Record the authority's verdicts and advance the sync cursor over the
    /// contiguous prefix of settled entries. Returns the new cursor.
    ///
    /// Balances are never touched here, including for rejected entries.
    pub fn mark_settled(
        &self,
        accepted: &[TransactionId],
        rejected: &[TransactionId],
    ) -> StorageResult<u64> {
        let _guard = self.write_lock.lock();

        let updates: Vec<(TransactionId, SyncState)> = accepted
            .iter()
            .map(|id| (id.clone(), SyncState::Synced))
            .chain(rejected.iter().map(|id| (id.clone(), SyncState::Rejected)))
            .collect();
        self.db.set_sync_states(&updates)?;

        let cursor = self.db.sync_cursor()?;
        let mut advanced = cursor;
        for entry in self.db.entries_after(cursor)? {
            if entry.transaction.sync_state == SyncState::Pending {
                break;
            }
            advanced = entry.sequence;
        }
        if advanced != cursor {
            self.db.set_sync_cursor(advanced)?;
            debug!(from = cursor, to = advanced, "sync cursor advanced");
        }
        Ok(advanced)
    }

    /// Resync from scratch: the next outstanding scan starts at the
    /// beginning of the log, so every entry not rejected is submitted again.
    pub fn reset_cursor(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        self.db.set_sync_cursor(0)?;
        info!("sync cursor reset");
        Ok(())
    }

    // -- Queries ------------------------------------------------------------

    /// Balance of `id` as this ledger sees it (zero if unknown).
    pub fn balance(&self, id: &DeviceId) -> StorageResult<Decimal> {
        self.db.balance(id)
    }

    /// Transactions involving `id`, most recent first.
    pub fn list_transactions(&self, id: &DeviceId) -> StorageResult<Vec<Transaction>> {
        self.db.transactions_for(id)
    }

    /// Pending entries after the sync cursor, oldest first.
    pub fn pending_transactions(&self) -> StorageResult<Vec<Transaction>> {
        let cursor = self.db.sync_cursor()?;
        Ok(self
            .db
            .pending_after(cursor)?
            .into_iter()
            .map(|entry| entry.transaction)
            .collect())
    }

    /// What the next sync submits: every entry after the cursor the
    /// authority has not rejected, oldest first. Synced entries past a
    /// still-pending one are included; the authority replays them.
    pub fn outstanding_transactions(&self) -> StorageResult<Vec<Transaction>> {
        let cursor = self.db.sync_cursor()?;
        Ok(self
            .db
            .unrejected_after(cursor)?
            .into_iter()
            .map(|entry| entry.transaction)
            .collect())
    }

    pub fn sync_cursor(&self) -> StorageResult<u64> {
        self.db.sync_cursor()
    }

    pub fn transaction(&self, id: &TransactionId) -> StorageResult<Option<Transaction>> {
        Ok(self.db.get_transaction(id)?.map(|entry| entry.transaction))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
