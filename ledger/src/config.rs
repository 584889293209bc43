//! # Ledger Configuration & Constants
//!
//! Every limit the ledger enforces lives here, next to the small config
//! structs that carry them at runtime. Devices and the authority must agree
//! on the amount bounds, otherwise the authority will reject transfers a
//! device already accepted offline.

use std::time::Duration;

use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Version string reported by devices and the authority.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Upper bound on a single wire frame. A payment is a few hundred bytes of
/// JSON; anything near this size is garbage or an attack.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Balances & Transaction Limits
// ---------------------------------------------------------------------------

/// Balance every account starts with when it is first created.
pub const INITIAL_BALANCE: i64 = 1_000;

/// Smallest amount a single transfer may carry (inclusive).
pub const MIN_TRANSACTION: i64 = 1;

/// Largest amount a single transfer may carry (inclusive).
pub const MAX_TRANSACTION: i64 = 10_000;

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// How often a device pushes its pending log to the authority when nothing
/// else triggers a sync.
pub const AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delay before the first retry of a failed authority request. Doubles on
/// every further attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the retry delay.
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Attempts per sync run before the authority is declared unreachable.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Per-attempt timeout for an authority request. A request that exceeds it
/// counts as unreachable.
pub const AUTHORITY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Network Defaults
// ---------------------------------------------------------------------------

/// Default HTTP port of the central authority.
pub const DEFAULT_AUTHORITY_PORT: u16 = 3000;

/// Default HTTP port of a device server.
pub const DEFAULT_DEVICE_PORT: u16 = 3001;

/// Default TCP port a device listens on for peer payments.
pub const DEFAULT_PEER_PORT: u16 = 3002;

/// Path of the authority's sync endpoint, relative to its base URL.
pub const SYNC_ENDPOINT: &str = "/api/sync";

// ---------------------------------------------------------------------------
// LedgerLimits
// ---------------------------------------------------------------------------

/// Amount bounds and opening balance applied by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerLimits {
    /// Inclusive lower bound of a transfer amount.
    pub min_transaction: Decimal,
    /// Inclusive upper bound of a transfer amount.
    pub max_transaction: Decimal,
    /// Balance given to an account the first time it is seen.
    pub initial_balance: Decimal,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            min_transaction: Decimal::from(MIN_TRANSACTION),
            max_transaction: Decimal::from(MAX_TRANSACTION),
            initial_balance: Decimal::from(INITIAL_BALANCE),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Timing of a device's reconciliation with the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Period of the background sync timer.
    pub auto_sync_interval: Duration,

    /// Bound on a single authority request. Exceeding it counts as
    /// unreachable for that attempt.
    pub request_timeout: Duration,

    /// Delay after the first failed attempt.
    pub retry_base_delay: Duration,

    /// Ceiling for the doubled delay.
    pub retry_max_delay: Duration,

    /// Attempts per sync run, including the first.
    pub retry_max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_interval: AUTO_SYNC_INTERVAL,
            request_timeout: AUTHORITY_REQUEST_TIMEOUT,
            retry_base_delay: RETRY_BASE_DELAY,
            retry_max_delay: RETRY_MAX_DELAY,
            retry_max_attempts: RETRY_MAX_ATTEMPTS,
        }
    }
}
