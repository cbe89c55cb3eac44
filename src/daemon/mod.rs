//! Common runtime for the long-lived daemons.
//!
//! Every daemon gets the same harness: a single-instance lock, a shared
//! shutdown signal wired to SIGINT/SIGTERM, task retries with
//! interruptible back-off, an interruptible inter-cycle wait, and
//! start/stop/failure notifications.

pub mod lock;
pub mod shutdown;

pub use lock::InstanceLock;
pub use shutdown::ShutdownSignal;

use crate::notify::{Notifier, NotifyLevel};
use anyhow::Result;
use chrono::Local;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub name: String,
    pub interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl DaemonConfig {
    pub fn new(name: &str, interval_seconds: u64) -> Self {
        Self {
            name: name.to_string(),
            interval: Duration::from_secs(interval_seconds),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    shutdown: ShutdownSignal,
    notifier: Arc<Notifier>,
}

impl DaemonRuntime {
    pub fn new(config: DaemonConfig, shutdown: ShutdownSignal, notifier: Arc<Notifier>) -> Self {
        Self {
            config,
            shutdown,
            notifier,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run the daemon loop until shutdown. `task` returns `Ok(true)` for a
    /// clean cycle, `Ok(false)` for a cycle with errors.
    ///
    /// Returns whether the last executed cycle succeeded, for the process
    /// exit code.
    pub async fn run<F, Fut>(&self, mut task: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        info!(
            "{} daemon starting (interval {}s, max retries {})",
            self.config.name,
            self.config.interval.as_secs(),
            self.config.max_retries
        );
        self.notifier
            .notify(
                "daemon_start",
                &format!("{} started", self.config.name),
                &format!("interval: {}s", self.config.interval.as_secs()),
                NotifyLevel::Info,
            )
            .await;

        let mut last_cycle_ok = true;

        loop {
            if self.shutdown.is_set() {
                break;
            }

            let started = Instant::now();
            last_cycle_ok = self.execute_with_retry(&mut task).await;
            let elapsed = started.elapsed();

            if last_cycle_ok {
                info!("cycle finished ({:.1}s)", elapsed.as_secs_f64());
            } else {
                warn!("cycle finished with errors ({:.1}s)", elapsed.as_secs_f64());
            }

            if self.shutdown.is_set() {
                break;
            }

            let next_run =
                Local::now() + chrono::Duration::seconds(self.config.interval.as_secs() as i64);
            info!(
                "next run around {} (waiting {}s)",
                next_run.format("%Y-%m-%d %H:%M:%S"),
                self.config.interval.as_secs()
            );

            if !self.shutdown.sleep(self.config.interval).await {
                break;
            }
        }

        info!("{} daemon shutting down", self.config.name);
        self.notifier
            .notify(
                "daemon_stop",
                &format!("{} stopped", self.config.name),
                "daemon stopped cleanly",
                NotifyLevel::Info,
            )
            .await;

        last_cycle_ok
    }

    async fn execute_with_retry<F, Fut>(&self, task: &mut F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        for attempt in 1..=self.config.max_retries {
            if self.shutdown.is_set() {
                info!("shutdown requested, aborting retry loop");
                return false;
            }

            if attempt > 1 {
                info!("retry {}/{}", attempt, self.config.max_retries);
            }

            match task().await {
                Ok(true) => return true,
                Ok(false) => {
                    if attempt < self.config.max_retries {
                        warn!(
                            "task failed ({}/{}), retrying in {}s",
                            attempt,
                            self.config.max_retries,
                            self.config.retry_delay.as_secs()
                        );
                        if !self.shutdown.sleep(self.config.retry_delay).await {
                            return false;
                        }
                    } else {
                        error!("task failed, retry budget exhausted");
                        self.notifier
                            .notify(
                                "retry_exhausted",
                                &format!("{} retries exhausted", self.config.name),
                                &format!(
                                    "task failed {} times, manual check needed",
                                    self.config.max_retries
                                ),
                                NotifyLevel::Error,
                            )
                            .await;
                        return false;
                    }
                }
                Err(e) => {
                    error!(
                        "task raised an error ({}/{}): {:#}",
                        attempt, self.config.max_retries, e
                    );
                    if attempt == 1 {
                        self.notifier
                            .notify(
                                "task_failure",
                                &format!("{} task failed", self.config.name),
                                &format!("{e:#}\n\nretrying..."),
                                NotifyLevel::Warning,
                            )
                            .await;
                    }
                    if attempt < self.config.max_retries {
                        if !self.shutdown.sleep(self.config.retry_delay).await {
                            return false;
                        }
                    } else {
                        self.notifier
                            .notify(
                                "retry_exhausted",
                                &format!("{} retries exhausted", self.config.name),
                                &format!("last error: {e:#}"),
                                NotifyLevel::Error,
                            )
                            .await;
                        return false;
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runtime(max_retries: u32) -> DaemonRuntime {
        let config = DaemonConfig {
            name: "test".into(),
            interval: Duration::from_millis(10),
            max_retries,
            retry_delay: Duration::from_millis(1),
        };
        DaemonRuntime::new(
            config,
            ShutdownSignal::new(),
            Arc::new(Notifier::new(Default::default())),
        )
    }

    #[tokio::test]
    async fn retry_stops_after_first_success() {
        let rt = runtime(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();
        let ok = rt
            .execute_with_retry(&mut move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            })
            .await;
        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_budget_on_persistent_failure() {
        let rt = runtime(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();
        let ok = rt
            .execute_with_retry(&mut move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            })
            .await;
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn shutdown_aborts_before_first_attempt() {
        let rt = runtime(3);
        rt.shutdown_signal().trigger();
        let ok = rt
            .execute_with_retry(&mut || async { Ok(true) })
            .await;
        assert!(!ok);
    }
}
