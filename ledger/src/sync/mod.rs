//! # Synchronization
//!
//! Reconciliation of a device's local log with the authority's canonical
//! record.
//!
//! ```text
//! protocol.rs   - SyncRequest / SyncResponse bodies
//! remote.rs     - RemoteAuthority trait, reqwest-backed HttpAuthority
//! retry.rs      - RetryPolicy: bounded attempts, pure backoff schedule
//! reconciler.rs - SyncReconciler::sync, SyncOutcome
//! scheduler.rs  - SyncTrigger and the background timer loop
//! ```

pub mod protocol;
pub mod reconciler;
pub mod remote;
pub mod retry;
pub mod scheduler;

pub use protocol::{SyncRequest, SyncResponse};
pub use reconciler::{SyncOutcome, SyncReconciler};
pub use remote::{HttpAuthority, RemoteAuthority};
pub use retry::RetryPolicy;
pub use scheduler::{spawn_sync_loop, SyncTrigger};
