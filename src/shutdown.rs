//! Cooperative cancellation.
//!
//! A `watch` channel carries a single "must exit" flag. The poll loop checks
//! it between cycles, and every blocking wait (between cycles, while the
//! print queue drains) races against it.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

/// Receiving side of the cancel signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a signal and the sender that triggers it.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the
    /// sender is gone without having triggered.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration`. Returns `false` if cut short by cancellation.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.triggered() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Trigger shutdown on Ctrl+C, or SIGTERM on Unix.
pub fn watch_signals() -> Shutdown {
    let (tx, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Termination signal received, finishing current cycle");
        let _ = tx.send(true);
    });
    shutdown
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(e) = res {
                            warn!("Cannot listen for Ctrl+C: {e}");
                            term.recv().await;
                        }
                    }
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot install SIGTERM handler: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C, shutdown only by kill: {e}");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_signal() {
        let (_tx, mut shutdown) = Shutdown::channel();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn sleep_is_cut_short_by_signal() {
        let (tx, mut shutdown) = Shutdown::channel();
        tx.send(true).unwrap();
        let started = std::time::Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn dropped_sender_never_triggers() {
        let (tx, mut shutdown) = Shutdown::channel();
        drop(tx);
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
    }
}
