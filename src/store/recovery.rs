//! Background recovery task for a degraded persistent store: a
//! `tokio::select!` over a cancellation token and an interval tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::PersistentBudgetStore;

/// Periodically probes a persistent store that has been marked degraded
/// and flips the flag back once a call succeeds.
pub struct RecoveryTask {
    store: Arc<dyn PersistentBudgetStore>,
    degraded: Arc<AtomicBool>,
    interval: Duration,
}

impl RecoveryTask {
    pub fn new(store: Arc<dyn PersistentBudgetStore>, degraded: Arc<AtomicBool>, interval: Duration) -> Self {
        Self { store, degraded, interval }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !self.degraded.load(Ordering::Relaxed) {
                            continue;
                        }
                        match self.store.list_keys("").await {
                            Ok(_) => {
                                self.degraded.store(false, Ordering::Relaxed);
                                tracing::info!("persistent budget store recovered");
                            }
                            Err(error) => {
                                tracing::warn!(%error, "persistent budget store still unavailable");
                            }
                        }
                    }
                }
            }
        })
    }
}
