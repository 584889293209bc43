//! # LedgerDB - Persistent Ledger Store
//!
//! The durable record of one ledger (a device's local ledger, or the
//! authority's canonical one), built on sled's embedded key-value store.
//!
//! ## Tree Layout
//!
//! | Tree           | Key                     | Value              |
//! |----------------|-------------------------|--------------------|
//! | `accounts`     | `device_id` (UTF-8)     | `bincode(Account)` |
//! | `transactions` | `tx_id` (UTF-8)         | `bincode(LogEntry)`|
//! | `log`          | `sequence` (8B BE)      | `tx_id` (UTF-8)    |
//! | `metadata`     | key (UTF-8)             | value (bytes)      |
//! | `rejected`     | `tx_id` (UTF-8)         | `bincode(Transaction)` |
//!
//! Sequences are stored big-endian so sled's lexicographic order is
//! insertion order; the `log` tree is the ordered scan, `transactions` the
//! point lookup. `rejected` is only written by the authority: it keeps every
//! transfer it refused so a later submission of the same transfer gets the
//! same answer.
//!
//! ## Atomicity
//!
//! [`LedgerDB::append`] writes the balance changes, the log entry, its
//! sequence index and the bumped sequence counter in one multi-tree sled
//! transaction, then flushes. Either the whole transfer is on disk or none
//! of it is.

use std::path::Path;

use rust_decimal::Decimal;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};

use crate::transaction::{Account, DeviceId, LogEntry, SyncState, Transaction, TransactionId};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during store operations.
///
/// Any of these aborts the operation in flight. Nothing is considered
/// applied unless the write that carried it returned `Ok`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("transaction {0} already exists")]
    DuplicateKey(TransactionId),
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(e: TransactionError<StorageError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(inner) => StorageError::Sled(inner),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

/// Sequence number the next appended transaction receives.
const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

/// Highest sequence known to be settled with the authority.
const META_SYNC_CURSOR: &[u8] = b"sync_cursor";

fn encode<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> StorageResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupt("invalid u64 bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

// ---------------------------------------------------------------------------
// LedgerDB
// ---------------------------------------------------------------------------

/// Persistent storage for accounts and the append-only transaction log.
///
/// # Thread Safety
///
/// sled trees are safe to share; `LedgerDB` is `Clone` and cheap to pass
/// around. Point reads never block. Read-modify-write sequences that must
/// see a consistent state (validation followed by [`append`]) are
/// serialized by the engine, not here.
///
/// [`append`]: LedgerDB::append
#[derive(Debug, Clone)]
pub struct LedgerDB {
    db: Db,
    accounts: Tree,
    transactions: Tree,
    log: Tree,
    metadata: Tree,
    rejected: Tree,
}

impl LedgerDB {
    /// Open or create a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a throwaway store that is removed when dropped. For tests and
    /// short-lived simulations.
    pub fn open_temporary() -> StorageResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let accounts = db.open_tree("accounts")?;
        let transactions = db.open_tree("transactions")?;
        let log = db.open_tree("log")?;
        let metadata = db.open_tree("metadata")?;
        let rejected = db.open_tree("rejected")?;

        Ok(Self {
            db,
            accounts,
            transactions,
            log,
            metadata,
            rejected,
        })
    }

    // -- Account operations -------------------------------------------------

    /// Look up an account by id.
    pub fn get_account(&self, id: &DeviceId) -> StorageResult<Option<Account>> {
        match self.accounts.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Create the account with `initial_balance` unless it already exists.
    ///
    /// Insert-or-ignore: an existing account is returned unchanged, never
    /// reset.
    pub fn create_account(&self, id: &DeviceId, initial_balance: Decimal) -> StorageResult<Account> {
        let account = Account::new(id.clone(), initial_balance);
        let bytes = encode(&account)?;
        let swapped = self.accounts.compare_and_swap(
            id.as_str().as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;

        match swapped {
            Ok(()) => {
                self.db.flush()?;
                Ok(account)
            }
            Err(_) => self
                .get_account(id)?
                .ok_or_else(|| StorageError::Corrupt(format!("account {id} vanished"))),
        }
    }

    /// Current balance of `id`, or zero for an account never seen.
    pub fn balance(&self, id: &DeviceId) -> StorageResult<Decimal> {
        Ok(self
            .get_account(id)?
            .map(|account| account.balance)
            .unwrap_or(Decimal::ZERO))
    }

    // -- Transaction operations ---------------------------------------------

    /// Returns `true` if a transaction with this id has been logged.
    pub fn contains_transaction(&self, id: &TransactionId) -> StorageResult<bool> {
        Ok(self.transactions.contains_key(id.as_bytes())?)
    }

    /// Point lookup of a logged transaction.
    pub fn get_transaction(&self, id: &TransactionId) -> StorageResult<Option<LogEntry>> {
        match self.transactions.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Atomically store the updated `accounts` and append `transaction` to
    /// the log. Returns the sequence number assigned to the new entry.
    ///
    /// Fails with [`StorageError::DuplicateKey`] if the id is already
    /// logged, in which case nothing is written.
    pub fn append(&self, transaction: &Transaction, accounts: &[Account]) -> StorageResult<u64> {
        let account_rows = accounts
            .iter()
            .map(|account| Ok((account.id.as_str().as_bytes().to_vec(), encode(account)?)))
            .collect::<StorageResult<Vec<_>>>()?;
        let tx_key = transaction.id.as_bytes().to_vec();

        let sequence = (&self.accounts, &self.transactions, &self.log, &self.metadata)
            .transaction(|(accounts_t, transactions_t, log_t, metadata_t)| {
                if transactions_t.get(&tx_key)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StorageError::DuplicateKey(transaction.id.clone()),
                    ));
                }

                let sequence = match metadata_t.get(META_NEXT_SEQUENCE)? {
                    Some(bytes) => decode_u64(&bytes).map_err(ConflictableTransactionError::Abort)?,
                    None => 1,
                };

                let entry = LogEntry {
                    sequence,
                    transaction: transaction.clone(),
                };
                let entry_bytes = encode(&entry).map_err(ConflictableTransactionError::Abort)?;

                for (key, value) in &account_rows {
                    accounts_t.insert(key.clone(), value.clone())?;
                }
                transactions_t.insert(tx_key.clone(), entry_bytes)?;
                log_t.insert(sequence.to_be_bytes().to_vec(), tx_key.clone())?;
                metadata_t.insert(META_NEXT_SEQUENCE, (sequence + 1).to_be_bytes().to_vec())?;

                Ok(sequence)
            })?;

        self.db.flush()?;
        Ok(sequence)
    }

    /// Set the sync state of each listed transaction in one atomic write.
    ///
    /// Ids not present in the log are skipped. Returns how many entries
    /// were updated.
    pub fn set_sync_states(&self, updates: &[(TransactionId, SyncState)]) -> StorageResult<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        let updated = self.transactions.transaction(|transactions_t| {
            let mut updated = 0usize;
            for (id, state) in updates {
                let Some(bytes) = transactions_t.get(id.as_bytes())? else {
                    continue;
                };
                let mut entry: LogEntry =
                    decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                if entry.transaction.sync_state == *state {
                    continue;
                }
                entry.transaction.sync_state = *state;
                let entry_bytes = encode(&entry).map_err(ConflictableTransactionError::Abort)?;
                transactions_t.insert(id.as_bytes(), entry_bytes)?;
                updated += 1;
            }
            Ok(updated)
        })?;

        self.db.flush()?;
        Ok(updated)
    }

    /// All log entries with a sequence greater than `after`, in insertion
    /// order.
    pub fn entries_after(&self, after: u64) -> StorageResult<Vec<LogEntry>> {
        let start = after.saturating_add(1).to_be_bytes();
        let mut entries = Vec::new();
        for item in self.log.range(start..) {
            let (_sequence, tx_key) = item?;
            let bytes = self.transactions.get(&tx_key)?.ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "log references missing transaction {}",
                    String::from_utf8_lossy(&tx_key)
                ))
            })?;
            entries.push(decode(&bytes)?);
        }
        Ok(entries)
    }

    /// Pending entries with a sequence greater than `after`, in insertion
    /// order.
    pub fn pending_after(&self, after: u64) -> StorageResult<Vec<LogEntry>> {
        Ok(self
            .entries_after(after)?
            .into_iter()
            .filter(|entry| entry.transaction.sync_state == SyncState::Pending)
            .collect())
    }

    /// Entries with a sequence greater than `after` that the authority has
    /// not rejected, Synced ones included, in insertion order.
    pub fn unrejected_after(&self, after: u64) -> StorageResult<Vec<LogEntry>> {
        Ok(self
            .entries_after(after)?
            .into_iter()
            .filter(|entry| entry.transaction.sync_state != SyncState::Rejected)
            .collect())
    }

    /// Transactions in which `id` is sender or receiver, most recent first
    /// (by insertion, not by timestamp).
    pub fn transactions_for(&self, id: &DeviceId) -> StorageResult<Vec<Transaction>> {
        let mut out = Vec::new();
        for item in self.log.iter().rev() {
            let (_sequence, tx_key) = item?;
            if let Some(bytes) = self.transactions.get(&tx_key)? {
                let entry: LogEntry = decode(&bytes)?;
                if entry.transaction.involves(id) {
                    out.push(entry.transaction);
                }
            }
        }
        Ok(out)
    }

    // -- Rejection record ---------------------------------------------------

    /// Remember that `transaction` was refused. The first recorded payload
    /// for an id wins.
    pub fn record_rejection(&self, transaction: &Transaction) -> StorageResult<()> {
        let bytes = encode(transaction)?;
        let swapped = self.rejected.compare_and_swap(
            transaction.id.as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;
        if swapped.is_ok() {
            self.db.flush()?;
        }
        Ok(())
    }

    /// The refused transfer recorded under `id`, if any.
    pub fn rejected_transaction(&self, id: &TransactionId) -> StorageResult<Option<Transaction>> {
        match self.rejected.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    // -- Metadata operations ------------------------------------------------

    /// Sequence of the last appended entry, or 0 for an empty log.
    pub fn last_sequence(&self) -> StorageResult<u64> {
        match self.metadata.get(META_NEXT_SEQUENCE)? {
            Some(bytes) => Ok(decode_u64(&bytes)?.saturating_sub(1)),
            None => Ok(0),
        }
    }

    /// The synchronization cursor: every entry at or below it is settled
    /// (Synced or Rejected). 0 when nothing has been settled yet.
    pub fn sync_cursor(&self) -> StorageResult<u64> {
        match self.metadata.get(META_SYNC_CURSOR)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    pub fn set_sync_cursor(&self, cursor: u64) -> StorageResult<()> {
        self.metadata
            .insert(META_SYNC_CURSOR, &cursor.to_be_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    // -- Utility operations -------------------------------------------------

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Block until all buffered writes are on disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
