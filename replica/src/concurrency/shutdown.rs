use tokio::sync::watch;

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};

/// Asks the main worker and every copy worker of a queue to stop after their current batch.
#[derive(Debug, Clone)]
pub struct ShutdownTx(SignalTx);

impl ShutdownTx {
    pub fn wrap(tx: SignalTx) -> Self {
        Self(tx)
    }

    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

pub type ShutdownRx = SignalRx;

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = create_signal();
    (ShutdownTx::wrap(tx), rx)
}

/// Returns `true` once shutdown was requested or nobody is left to request it.
pub fn shutdown_requested(rx: &ShutdownRx) -> bool {
    rx.has_changed().unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_seen_by_every_subscriber() {
        let (tx, rx) = create_shutdown_channel();
        let copy_rx = tx.subscribe();
        assert!(!shutdown_requested(&rx));

        tx.shutdown().unwrap();

        assert!(shutdown_requested(&rx));
        assert!(shutdown_requested(&copy_rx));
    }
}
