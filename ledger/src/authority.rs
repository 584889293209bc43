//! # Authority
//!
//! The canonical ledger every device reconciles against.
//!
//! A sync batch is replayed transaction by transaction against the
//! canonical balances with [`Perspective::Authority`]:
//!
//! - both legs apply, and unknown accounts open with the initial balance;
//! - a transaction already applied (the other party synced first) is
//!   accepted again as a replay;
//! - an overspend that two offline peers each accepted is caught here: the
//!   sender's canonical balance no longer covers it, so the id comes back
//!   rejected.
//!
//! A rejection is final. Refused transfers are kept in the store, and the
//! same transfer submitted again (typically by the other party, after the
//! sender's balance has grown) is refused again without being re-judged.
//!
//! The authority never reaches into device ledgers. It only answers.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::LedgerLimits;
use crate::engine::{ApplyError, ApplyOutcome, LedgerEngine, Perspective};
use crate::storage::{LedgerDB, StorageError, StorageResult};
use crate::sync::{RemoteAuthority, SyncRequest, SyncResponse};
use crate::transaction::{Account, DeviceId, Transaction, ValidationError};
use crate::transport::TransportError;

/// A judged sync batch.
#[derive(Debug, Clone, Default)]
pub struct SyncJudgement {
    /// The answer sent back to the device.
    pub response: SyncResponse,
    /// Accepted ids that changed the canonical ledger. Replays of a
    /// transfer the other party already synced are not counted.
    pub newly_applied: usize,
}

#[derive(Debug)]
pub struct Authority {
    engine: LedgerEngine,
    /// Held from the rejection lookup until the verdict is recorded.
    verdict_lock: Mutex<()>,
}

impl Authority {
    pub fn new(db: LedgerDB, limits: LedgerLimits) -> Self {
        Self {
            engine: LedgerEngine::new(db, Perspective::Authority, limits),
            verdict_lock: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &LedgerEngine {
        &self.engine
    }

    /// Register a device. Existing accounts are left as they are.
    pub fn create_user(&self, id: &DeviceId) -> StorageResult<Account> {
        self.engine.ensure_account(id)
    }

    pub fn account(&self, id: &DeviceId) -> StorageResult<Option<Account>> {
        self.engine.db().get_account(id)
    }

    /// Apply one transfer to the canonical ledger.
    ///
    /// A transfer refused before is refused again with
    /// [`ValidationError::PreviouslyRejected`]. A new refusal is recorded,
    /// unless the id is already logged under a different payload.
    pub fn apply(&self, tx: &Transaction) -> Result<ApplyOutcome, ApplyError> {
        let _verdict = self.verdict_lock.lock();
        let db = self.engine.db();

        if let Some(refused) = db.rejected_transaction(&tx.id)? {
            if refused.same_transfer(tx) {
                debug!(tx_id = %tx.id, "transfer already rejected");
                return Err(ValidationError::PreviouslyRejected { id: tx.id.clone() }.into());
            }
        }

        match self.engine.apply(tx) {
            Err(ApplyError::Rejected(e)) => {
                if !db.contains_transaction(&tx.id)? {
                    db.record_rejection(tx)?;
                }
                Err(ApplyError::Rejected(e))
            }
            other => other,
        }
    }

    /// Judge every transaction of a device's batch, in the order given.
    ///
    /// A transaction that does not involve the submitting device is
    /// rejected without being applied or recorded.
    pub fn judge(&self, request: &SyncRequest) -> Result<SyncJudgement, StorageError> {
        self.engine.ensure_account(&request.device_id)?;

        let mut judgement = SyncJudgement {
            response: SyncResponse {
                success: true,
                ..Default::default()
            },
            newly_applied: 0,
        };
        let response = &mut judgement.response;

        for tx in &request.transactions {
            if !tx.involves(&request.device_id) {
                let err = ValidationError::ForeignTransaction {
                    id: tx.id.clone(),
                    device: request.device_id.clone(),
                };
                warn!(device = %request.device_id, tx_id = %tx.id, error = %err, "sync entry rejected");
                response.rejected_ids.push(tx.id.clone());
                continue;
            }

            match self.apply(tx) {
                Ok(outcome) => {
                    if !outcome.replayed {
                        judgement.newly_applied += 1;
                    }
                    response.accepted_ids.push(tx.id.clone());
                }
                Err(ApplyError::Rejected(e)) => {
                    warn!(device = %request.device_id, tx_id = %tx.id, reason = e.kind(), "sync entry rejected");
                    response.rejected_ids.push(tx.id.clone());
                }
                Err(ApplyError::Storage(e)) => return Err(e),
            }
        }

        info!(
            device = %request.device_id,
            accepted = response.accepted_ids.len(),
            rejected = response.rejected_ids.len(),
            applied = judgement.newly_applied,
            "sync batch judged"
        );
        Ok(judgement)
    }

    pub fn handle_sync(&self, request: &SyncRequest) -> Result<SyncResponse, StorageError> {
        self.judge(request).map(|judgement| judgement.response)
    }
}

/// In-process authority, for simulations and tests that skip HTTP.
#[async_trait]
impl RemoteAuthority for Authority {
    async fn submit(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        self.handle_sync(request).map_err(|e| {
            warn!(error = %e, "authority storage failure");
            TransportError::Status(500)
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;
    use crate::transaction::{Transaction, TransactionId};

    fn setup() -> Authority {
        Authority::new(LedgerDB::open_temporary().unwrap(), LedgerLimits::default())
    }

    fn tx(id: &str, from: &str, to: &str, amount: i64) -> Transaction {
        let mut tx = Transaction::new(DeviceId::new(from), DeviceId::new(to), Decimal::from(amount));
        tx.id = TransactionId::new(id);
        tx
    }

    fn batch(device: &str, txs: Vec<Transaction>) -> SyncRequest {
        SyncRequest {
            device_id: DeviceId::new(device),
            transactions: txs,
        }
    }

    #[test]
    fn both_parties_syncing_the_same_transfer_applies_it_once() {
        let authority = setup();
        let t1 = tx("t1", "alice", "bob", 200);

        let from_bob = authority.handle_sync(&batch("bob", vec![t1.clone()])).unwrap();
        let from_alice = authority.handle_sync(&batch("alice", vec![t1])).unwrap();

        assert_eq!(from_bob.accepted_ids, vec![TransactionId::new("t1")]);
        assert_eq!(from_alice.accepted_ids, vec![TransactionId::new("t1")]);

        let engine = authority.engine();
        assert_eq!(engine.balance(&DeviceId::new("alice")).unwrap(), Decimal::from(800));
        assert_eq!(engine.balance(&DeviceId::new("bob")).unwrap(), Decimal::from(1_200));
        assert_eq!(engine.db().transaction_count(), 1);
    }

    #[test]
    fn offline_double_spend_is_rejected() {
        let authority = setup();
        let response = authority
            .handle_sync(&batch(
                "alice",
                vec![
                    tx("t1", "alice", "bob", 700),
                    tx("t2", "alice", "carol", 700),
                ],
            ))
            .unwrap();

        assert!(response.success);
        assert_eq!(response.accepted_ids, vec![TransactionId::new("t1")]);
        assert_eq!(response.rejected_ids, vec![TransactionId::new("t2")]);
        assert_eq!(
            authority.engine().balance(&DeviceId::new("carol")).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn foreign_entries_are_rejected() {
        let authority = setup();
        let response = authority
            .handle_sync(&batch("mallory", vec![tx("t1", "alice", "bob", 10)]))
            .unwrap();
        assert_eq!(response.rejected_ids, vec![TransactionId::new("t1")]);
        assert_eq!(authority.engine().db().transaction_count(), 0);
    }

    #[test]
    fn create_user_is_idempotent() {
        let authority = setup();
        let alice = DeviceId::new("alice");
        authority.create_user(&alice).unwrap();
        authority
            .handle_sync(&batch("alice", vec![tx("t1", "alice", "bob", 100)]))
            .unwrap();
        let again = authority.create_user(&alice).unwrap();
        assert_eq!(again.balance, Decimal::from(900));
        assert!(authority.account(&DeviceId::new("nobody")).unwrap().is_none());
    }

    #[test]
    fn rejected_transfer_stays_rejected_for_the_receiver() {
        let authority = setup();
        let t2 = tx("t2", "alice", "bob", 1_200);

        let from_alice = authority.handle_sync(&batch("alice", vec![t2.clone()])).unwrap();
        assert_eq!(from_alice.rejected_ids, vec![TransactionId::new("t2")]);

        // Alice's canonical balance now covers t2.
        authority
            .handle_sync(&batch("erin", vec![tx("t3", "erin", "alice", 500)]))
            .unwrap();
        assert_eq!(
            authority.engine().balance(&DeviceId::new("alice")).unwrap(),
            Decimal::from(1_500)
        );

        let from_bob = authority.handle_sync(&batch("bob", vec![t2.clone()])).unwrap();
        assert!(from_bob.accepted_ids.is_empty());
        assert_eq!(from_bob.rejected_ids, vec![TransactionId::new("t2")]);

        let engine = authority.engine();
        assert_eq!(engine.balance(&DeviceId::new("alice")).unwrap(), Decimal::from(1_500));
        assert!(engine.transaction(&t2.id).unwrap().is_none());

        let err = authority.apply(&t2).unwrap_err();
        assert_eq!(err.kind(), "PreviouslyRejected");
    }

    #[test]
    fn foreign_submission_does_not_poison_the_id() {
        let authority = setup();
        let t1 = tx("t1", "alice", "bob", 5_000);
        authority.handle_sync(&batch("mallory", vec![t1])).unwrap();
        assert_eq!(authority.engine().db().rejected_count(), 0);

        // A different payload under a refused id is judged on its own.
        let authority = setup();
        authority
            .handle_sync(&batch("alice", vec![tx("t1", "alice", "bob", 5_000)]))
            .unwrap();
        let response = authority
            .handle_sync(&batch("alice", vec![tx("t1", "alice", "bob", 50)]))
            .unwrap();
        assert_eq!(response.accepted_ids, vec![TransactionId::new("t1")]);
    }

    #[test]
    fn judgement_counts_only_new_applies() {
        let authority = setup();
        let t1 = tx("t1", "alice", "bob", 200);

        let first = authority.judge(&batch("alice", vec![t1.clone()])).unwrap();
        let replay = authority.judge(&batch("bob", vec![t1])).unwrap();

        assert_eq!(first.newly_applied, 1);
        assert_eq!(replay.newly_applied, 0);
        assert_eq!(replay.response.accepted_ids, vec![TransactionId::new("t1")]);
    }

    #[tokio::test]
    async fn submit_goes_through_handle_sync() {
        let authority = setup();
        let response = authority
            .submit(&batch("alice", vec![tx("t1", "alice", "bob", 100)]))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.accepted_ids.len(), 1);
    }
}
