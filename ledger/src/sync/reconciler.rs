//! # Sync Reconciler
//!
//! Pushes a device's outstanding log entries to the authority and records
//! the verdicts.
//!
//! ```text
//! outstanding_transactions() ─► SyncRequest ─► RemoteAuthority::submit
//!        (after cursor)                             │ retry + timeout
//!                                                   ▼
//! mark_settled(accepted, rejected)  ◄──  SyncResponse
//! ```
//!
//! Unreachable is a normal outcome, not an error: the entries stay
//! Pending and the next run picks them up again. The only `Err` a run can
//! return is a local storage failure.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{SyncRequest, SyncResponse};
use super::remote::RemoteAuthority;
use super::retry::RetryPolicy;
use crate::config::SyncConfig;
use crate::engine::LedgerEngine;
use crate::storage::StorageError;
use crate::transaction::{DeviceId, SyncState, TransactionId};
use crate::transport::TransportError;

/// What one [`SyncReconciler::sync`] run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Ids the authority accepted; now `Synced`.
    pub synced: Vec<TransactionId>,
    /// Ids the authority rejected; now `Rejected`, balances untouched.
    pub failed: Vec<TransactionId>,
    /// The authority could not be reached. Nothing changed.
    pub unreachable: bool,
}

impl SyncOutcome {
    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Nothing was pending, or nothing was judged.
    pub fn is_empty(&self) -> bool {
        self.synced.is_empty() && self.failed.is_empty() && !self.unreachable
    }
}

/// Reconciles one device's ledger with a remote authority.
pub struct SyncReconciler {
    engine: Arc<LedgerEngine>,
    authority: Arc<dyn RemoteAuthority>,
    device_id: DeviceId,
    retry: RetryPolicy,
    request_timeout: Duration,
    /// Serializes runs. Held across network I/O, unlike the engine's lock.
    gate: Mutex<()>,
}

impl SyncReconciler {
    pub fn new(
        engine: Arc<LedgerEngine>,
        authority: Arc<dyn RemoteAuthority>,
        device_id: DeviceId,
        config: &SyncConfig,
    ) -> Self {
        Self {
            engine,
            authority,
            device_id,
            retry: RetryPolicy::from(config),
            request_timeout: config.request_timeout,
            gate: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<LedgerEngine> {
        &self.engine
    }

    /// Submit every outstanding entry after the cursor and apply the
    /// verdicts.
    ///
    /// Safe to call concurrently: runs queue up behind each other, and a
    /// run that finds nothing outstanding returns without touching the
    /// network. The outcome lists only verdicts that changed an entry's
    /// local state.
    pub async fn sync(&self) -> Result<SyncOutcome, StorageError> {
        let _gate = self.gate.lock().await;

        let outstanding = self.engine.outstanding_transactions()?;
        if outstanding.is_empty() {
            debug!("nothing outstanding, skipping sync");
            return Ok(SyncOutcome::default());
        }

        let submitted: HashSet<TransactionId> = outstanding.iter().map(|tx| tx.id.clone()).collect();
        let already_synced: HashSet<TransactionId> = outstanding
            .iter()
            .filter(|tx| tx.sync_state == SyncState::Synced)
            .map(|tx| tx.id.clone())
            .collect();
        let request = SyncRequest {
            device_id: self.device_id.clone(),
            transactions: outstanding,
        };

        let response = match self.submit_with_retry(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(pending = submitted.len(), error = %e, "authority unreachable, entries stay pending");
                return Ok(SyncOutcome::unreachable());
            }
        };

        if !response.success && !response.has_verdicts() {
            warn!(
                pending = submitted.len(),
                error = response.error.as_deref().unwrap_or("none given"),
                "authority declined batch, entries stay pending"
            );
            return Ok(SyncOutcome::unreachable());
        }

        // Only ids from this batch count; a rejection outranks an acceptance
        // if the authority lists an id twice.
        let failed: Vec<TransactionId> = dedup_in(&response.rejected_ids, &submitted, &HashSet::new());
        let failed_set: HashSet<TransactionId> = failed.iter().cloned().collect();
        let synced: Vec<TransactionId> = dedup_in(&response.accepted_ids, &submitted, &failed_set);

        let cursor = self.engine.mark_settled(&synced, &failed)?;

        info!(
            synced = synced.len(),
            rejected = failed.len(),
            still_pending = submitted.len() - synced.len() - failed.len(),
            cursor,
            "sync completed"
        );
        let synced: Vec<TransactionId> = synced
            .into_iter()
            .filter(|id| !already_synced.contains(id))
            .collect();
        for id in &failed {
            warn!(tx_id = %id, "authority rejected transaction");
        }

        Ok(SyncOutcome {
            synced,
            failed,
            unreachable: false,
        })
    }

    async fn submit_with_retry(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let timeout = self.request_timeout;
        let authority = &self.authority;
        self.retry
            .run(|attempt| async move {
                debug!(attempt = attempt + 1, "contacting authority");
                tokio::time::timeout(timeout, authority.submit(request))
                    .await
                    .map_err(|_| TransportError::Timeout(timeout))?
            })
            .await
    }

    /// Resync from scratch. The next run resubmits every entry the
    /// authority has not rejected.
    pub fn reset_cursor(&self) -> Result<(), StorageError> {
        self.engine.reset_cursor()
    }
}

/// Ids of `ids` that are in `within` and not in `exclude`, first occurrence
/// only, in response order.
fn dedup_in(
    ids: &[TransactionId],
    within: &HashSet<TransactionId>,
    exclude: &HashSet<TransactionId>,
) -> Vec<TransactionId> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| within.contains(*id) && !exclude.contains(*id))
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
