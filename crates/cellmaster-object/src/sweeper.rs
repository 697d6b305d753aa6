//! Background GC sweep and transaction expiry.

use crate::service::ObjectService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Periodic sweep task of one replica. Only does work while the replica is
/// an active leader.
pub struct GarbageSweeper {
    wakeup: Arc<Notify>,
    task: JoinHandle<()>,
}

impl GarbageSweeper {
    pub fn spawn(service: Arc<ObjectService>) -> Self {
        let period = service.config().gc_sweep_period();
        let wakeup = Arc::new(Notify::new());
        let task = tokio::spawn(sweep_loop(service, period, wakeup.clone()));
        Self { wakeup, task }
    }

    /// Sweep now instead of waiting for the next period.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for GarbageSweeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn sweep_loop(service: Arc<ObjectService>, period: Duration, wakeup: Arc<Notify>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = wakeup.notified() => {}
        }

        if let Err(e) = service.abort_expired_transactions().await {
            log_failure("Transaction expiry", &e);
        }

        // A committed batch may leave more behind; keep draining until a
        // sweep finds nothing or fails.
        loop {
            match service.sweep_garbage().await {
                Ok(0) => break,
                Ok(count) => debug!(count, "Swept zombies"),
                Err(e) => {
                    log_failure("GC sweep", &e);
                    break;
                }
            }
        }
    }
}

fn log_failure(what: &str, e: &cellmaster_common::Error) {
    if e.is_retryable() {
        debug!("{what} deferred: {e}");
    } else {
        warn!("{what} failed: {e}");
    }
}
