use std::future::pending;

use tokio::sync::watch;

/// Sending half of a payload-less wake-up signal.
///
/// Sends that happen before the receiver looked coalesce into one wake-up.
pub type SignalTx = watch::Sender<()>;

/// Receiving half of a payload-less wake-up signal.
pub type SignalRx = watch::Receiver<()>;

/// Creates a new pair of [`SignalTx`] and [`SignalRx`].
pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(())
}

/// Completes on the next signal of `rx`.
///
/// Never completes without a receiver or once every sender is gone, so it can sit in a
/// `select!` next to a timer.
pub async fn signaled(rx: Option<&mut SignalRx>) {
    if let Some(rx) = rx {
        if rx.changed().await.is_ok() {
            return;
        }
    }

    pending::<()>().await
}
