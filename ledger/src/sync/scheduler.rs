//! Background sync task.
//!
//! Three things start a sync run: a local apply (best-effort nudge through
//! [`SyncTrigger`]), the periodic timer, and an explicit request (which
//! calls [`SyncReconciler::sync`] directly). The first two are driven here.
//!
//! ## Shutdown
//!
//! The loop watches a `tokio::sync::watch` channel and exits when it flips
//! to `true` or the sender is dropped. A run already in progress finishes
//! first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::reconciler::{SyncOutcome, SyncReconciler};

/// Cheap, cloneable handle to request a sync "soon".
///
/// Notifications coalesce: many nudges while a run is in progress result
/// in one follow-up run.
#[derive(Debug, Clone, Default)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Spawn the loop that runs `reconciler` every `interval` and whenever
/// `trigger` fires. `observe` sees the outcome of every completed run.
pub fn spawn_sync_loop<F>(
    reconciler: Arc<SyncReconciler>,
    trigger: SyncTrigger,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    observe: F,
) -> JoinHandle<()>
where
    F: Fn(&SyncOutcome) + Send + 'static,
{
    tokio::spawn(async move {
        info!(?interval, "sync loop starting");
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let reason = tokio::select! {
                _ = ticker.tick() => "timer",
                _ = trigger.notified() => "apply",
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            debug!(reason, "sync triggered");
            match reconciler.sync().await {
                Ok(outcome) => {
                    if outcome.unreachable {
                        debug!(reason, "sync run ended unreachable");
                    }
                    observe(&outcome);
                }
                Err(e) => warn!(reason, error = %e, "sync run failed"),
            }
        }

        info!("sync loop stopped");
    })
}
