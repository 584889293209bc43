//! Core type definitions for Tally transactions.
//!
//! These types are shared by the store, the engine, the wire protocol and
//! the authority. JSON field names follow the camelCase shape devices have
//! always exchanged (`senderId`, `receiverId`, ...).

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DeviceId
// ---------------------------------------------------------------------------

/// Identity of a device, and of the single account it owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity (UUID v4) for a device starting up for the
    /// first time.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ---------------------------------------------------------------------------
// TransactionId
// ---------------------------------------------------------------------------

/// Globally unique transaction identifier.
///
/// Uniqueness is what makes redelivery safe: the store refuses a second
/// entry with the same id, and the engine turns an identical redelivery
/// into a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

const ID_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates an id of the form `tx_<unix-millis>_<9 base-36 chars>`.
    ///
    /// The millisecond prefix keeps ids roughly sortable for humans reading
    /// logs; the random suffix makes collisions between two devices minting
    /// in the same millisecond negligible.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| ID_SUFFIX_ALPHABET[rng.gen_range(0..ID_SUFFIX_ALPHABET.len())] as char)
            .collect();
        Self(format!("tx_{}_{}", Utc::now().timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ---------------------------------------------------------------------------
// SyncState
// ---------------------------------------------------------------------------

/// Where a locally applied transaction stands with respect to the authority.
///
/// Every entry starts `Pending`. Only the reconciler moves it on, to
/// `Synced` once the authority accepts it or to `Rejected` when the
/// authority's canonical record disagrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Applied locally, not yet acknowledged by the authority.
    #[default]
    Pending,
    /// Accepted into the authority's canonical record.
    Synced,
    /// Refused by the authority. The local balance is left untouched.
    Rejected,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Synced => write!(f, "synced"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A transfer of `amount` from `sender_id` to `receiver_id`.
///
/// `timestamp` is supplied by the sending device and is informational only.
/// Log order is insertion order, never timestamp order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub sender_id: DeviceId,
    pub receiver_id: DeviceId,
    #[serde(with = "amount_serde")]
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sync_state: SyncState,
}

impl Transaction {
    /// Builds a fresh `Pending` transfer with a generated id, stamped now.
    pub fn new(sender_id: DeviceId, receiver_id: DeviceId, amount: Decimal) -> Self {
        Self {
            id: TransactionId::generate(),
            sender_id,
            receiver_id,
            amount,
            timestamp: Utc::now(),
            sync_state: SyncState::Pending,
        }
    }

    /// Returns `true` if `other` describes the same transfer: same id,
    /// parties and amount. Sync state and timestamp are ignored, so a
    /// redelivered copy of an already synced entry still matches.
    pub fn same_transfer(&self, other: &Transaction) -> bool {
        self.id == other.id
            && self.sender_id == other.sender_id
            && self.receiver_id == other.receiver_id
            && self.amount == other.amount
    }

    /// Returns `true` if `device` is the sender or the receiver.
    pub fn involves(&self, device: &DeviceId) -> bool {
        &self.sender_id == device || &self.receiver_id == device
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Balance held by one device identity.
///
/// Invariant: `balance >= 0` after every committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: DeviceId,
    #[serde(with = "amount_serde")]
    pub balance: Decimal,
}

impl Account {
    pub fn new(id: DeviceId, balance: Decimal) -> Self {
        Self { id, balance }
    }
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

/// A transaction together with its position in the local log.
///
/// `sequence` starts at 1 and grows by one per appended transaction. It is
/// the order the store was mutated in, which is what the sync cursor tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub transaction: Transaction,
}

// ---------------------------------------------------------------------------
// Amount encoding
// ---------------------------------------------------------------------------

/// Serde adapter for monetary amounts.
///
/// Human-readable formats (JSON) get rust_decimal's own representation:
/// a decimal string on output, strings or numbers on input. Binary formats
/// (bincode, used on disk) get the fixed 16-byte form, since bincode cannot
/// drive rust_decimal's self-describing visitor.
pub(crate) mod amount_serde {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            Serialize::serialize(value, serializer)
        } else {
            let bytes: [u8; 16] = Decimal::serialize(value);
            bytes.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            <Decimal as Deserialize>::deserialize(deserializer)
        } else {
            let bytes = <[u8; 16]>::deserialize(deserializer)?;
            Ok(Decimal::deserialize(bytes))
        }
    }
}
