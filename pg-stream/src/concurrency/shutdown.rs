use std::sync::Arc;

use tokio::sync::watch;

/// Result of a step that may be interrupted by a shutdown signal.
///
/// `Shutdown` carries whatever the step had produced before it was interrupted.
#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownResult<T, I> {
    Ok(T),
    Shutdown(I),
}

impl<T, I> ShutdownResult<T, I> {
    pub fn should_shutdown(&self) -> bool {
        matches!(self, ShutdownResult::Shutdown(_))
    }
}

/// Sending half of a shutdown channel.
///
/// Cloning is cheap and every clone signals the same receivers.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<()>>);

impl ShutdownTx {
    /// Signals every current receiver. Returns an error when no receiver is left.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Creates a receiver that only observes signals sent after this call.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiving half of a shutdown channel. A signal is observed through [`watch::Receiver::changed`].
pub type ShutdownRx = watch::Receiver<()>;

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(Arc::new(tx)), rx)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn receivers_observe_signal() {
        let (tx, mut rx) = create_shutdown_channel();
        let mut subscribed = tx.subscribe();

        tx.shutdown().unwrap();

        assert!(rx.changed().await.is_ok());
        assert!(subscribed.changed().await.is_ok());
    }

    #[tokio::test]
    async fn signal_before_subscribe_is_not_observed() {
        let (tx, _rx) = create_shutdown_channel();
        tx.shutdown().unwrap();

        let mut late = tx.subscribe();
        let waited = tokio::time::timeout(Duration::from_millis(50), late.changed()).await;

        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn dropping_all_senders_closes_receivers() {
        let (tx, mut rx) = create_shutdown_channel();
        drop(tx);

        assert!(rx.changed().await.is_err());
    }

    #[test]
    fn shutdown_result_reports_interruption() {
        assert!(ShutdownResult::<(), usize>::Shutdown(3).should_shutdown());
        assert!(!ShutdownResult::<(), usize>::Ok(()).should_shutdown());
    }
}
