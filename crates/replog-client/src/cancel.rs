//! Cancellation tokens
//!
//! Every outstanding request carries a token; cancelling detaches the
//! caller and pending responses are dropped on arrival.

use crate::{ClientError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable cancellation token
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A fresh, uncancelled token
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Cancel every clone of this token
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Error out when cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ClientError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Sender gone without cancelling: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep, waking early with `Cancelled` when the token fires
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(ClientError::Cancelled),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
