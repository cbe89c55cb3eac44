//! Shared shutdown signal.
//!
//! One cloneable flag threaded through every component that can block.
//! All waits in the call tree are built on [`ShutdownSignal::sleep`] so a
//! SIGINT/SIGTERM interrupts even a 12-second inter-batch wait within
//! about a second.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait for `duration`, checking the flag on a ≤1 s tick.
    ///
    /// Returns `true` when the full duration elapsed, `false` when the
    /// shutdown flag fired mid-wait. Callers must skip their intended
    /// side effect on `false`.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        loop {
            if self.is_set() {
                return false;
            }
            if remaining.is_zero() {
                return true;
            }
            let step = remaining.min(POLL_INTERVAL);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    /// Spawn the signal listeners (ctrl-c, and SIGTERM on unix) that set
    /// this flag.
    pub fn install_handlers(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();

            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                )
                .expect("install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }

            info!("shutdown signal received");
            signal.trigger();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_when_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(signal.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn sleep_aborts_when_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        assert!(!signal.sleep(Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn trigger_mid_sleep_interrupts() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.trigger();
        let completed = handle.await.unwrap();
        assert!(!completed);
    }
}
