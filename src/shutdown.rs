//! Operator interrupt wiring.
//!
//! A single [`Trigger`] flips a watch channel that any number of
//! [`Shutdown`] handles observe. The echo server stops accepting when it
//! fires; the experiment orchestrator aborts its workers.

use tokio::sync::watch;
use tracing::{info, warn};

/// Create a connected trigger/observer pair.
pub fn channel() -> (Trigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (Trigger { tx }, Shutdown { rx })
}

/// Fires the shutdown signal.
#[derive(Debug)]
pub struct Trigger {
    tx: watch::Sender<bool>,
}

impl Trigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires. A dropped [`Trigger`] counts as fired.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|&fired| fired).await;
    }
}

/// Fire `trigger` on the first Ctrl-C.
pub fn on_ctrl_c(trigger: Trigger) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                trigger.fire();
            }
            Err(e) => {
                // Without a signal handler the run can only end on its own;
                // keep the trigger alive so observers do not treat this as
                // a shutdown.
                warn!(error = %e, "Failed to install interrupt handler");
                std::future::pending::<()>().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_wakes_all_observers() {
        let (trigger, shutdown) = channel();
        let mut a = shutdown.clone();
        let mut b = shutdown;
        assert!(!a.is_triggered());

        trigger.fire();

        tokio::time::timeout(Duration::from_secs(1), async {
            a.recv().await;
            b.recv().await;
        })
        .await
        .unwrap();
        assert!(a.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_fired() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);

        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_until_fired() {
        let (_trigger, mut shutdown) = channel();

        let waited = tokio::time::timeout(Duration::from_millis(20), shutdown.recv()).await;
        assert!(waited.is_err());
    }
}
