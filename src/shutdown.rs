//! Cooperative shutdown signal
//!
//! A cloneable token propagated from the process root into the network
//! event loop, the mining loop, and the proof-of-work search. Long-running
//! loops poll `is_cancelled`; async tasks await `cancelled`.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signal shutdown to every holder of this token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Non-blocking check, cheap enough to poll every nonce.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_observed() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_cancelled());

        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        shutdown.cancel();
        assert!(shutdown.is_cancelled());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        clone.cancel();
        assert!(shutdown.is_cancelled());
    }
}
