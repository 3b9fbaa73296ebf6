//! Cooperative cancellation.
//!
//! A single [ShutdownHandle] is armed by the binary's signal handler;
//! clones of [Shutdown] are threaded through the orchestrator and
//! checked at every suspension point.

use anyhow::Error;
use tokio::sync::watch;

use crate::ArchiveError;

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(ArchiveError::Cancelled.into());
        }
        Ok(())
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep that wakes early on cancellation.
    pub async fn sleep(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn trigger_is_observed_everywhere() {
        let (handle, shutdown) = channel();
        let clone = shutdown.clone();
        assert!(!clone.is_cancelled());
        assert!(clone.check().is_ok());

        handle.trigger();
        assert!(clone.is_cancelled());
        let err = shutdown.check().unwrap_err();
        assert!(crate::is_cancelled(&err));
        // does not block once triggered
        shutdown.cancelled().await;
    }

    #[tokio::test]
    async fn sleep_wakes_on_cancel() {
        let (handle, shutdown) = channel();
        let start = std::time::Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            handle.trigger();
        });
        shutdown.sleep(std::time::Duration::from_secs(60)).await;
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }
}
