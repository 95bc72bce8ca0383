//! Graceful shutdown signalling shared by every background task the host
//! stack spawns (HCI engine readers, L2CAP channel pumps, SMP watchdogs).

use std::future::Future;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct Shutdown {
    shutdown_tx: mpsc::Sender<()>,
    shutdown_complete_tx: mpsc::WeakSender<()>,
}

impl Shutdown {
    /// Creates a new shutdown signal pair. `shutdown_complete_tx` should be
    /// held by the task orchestrator and awaited (via `recv()` returning
    /// `None`) once every clone of the guard returned by [`Self::drop_guard`]
    /// has been dropped.
    pub fn new(shutdown_tx: mpsc::Sender<()>, shutdown_complete_tx: mpsc::Sender<()>) -> Self {
        Self {
            shutdown_tx,
            shutdown_complete_tx: shutdown_complete_tx.downgrade(),
        }
    }

    /// True once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_tx.is_closed()
    }

    /// Resolves once shutdown has been requested.
    pub fn recv_shutdown(&self) -> impl Future<Output = ()> {
        let shutdown_tx = self.shutdown_tx.clone();
        async move { shutdown_tx.closed().await }
    }

    /// Hands out a guard; drop it to signal that this task has finished
    /// unwinding. Panics if the orchestrator's completion receiver has
    /// already been dropped, which would indicate shutdown was already
    /// observed as complete.
    pub fn drop_guard(&self) -> mpsc::Sender<()> {
        self.shutdown_complete_tx
            .clone()
            .upgrade()
            .expect("shutdown already completed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_shutdown_resolves_after_sender_dropped() {
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel::<()>(1);
        let shutdown = Shutdown::new(shutdown_tx.clone(), complete_tx);

        assert!(!shutdown.is_shutdown());
        let guard = shutdown.drop_guard();
        drop(shutdown_tx);
        shutdown.recv_shutdown().await;
        assert!(shutdown.is_shutdown());

        drop(guard);
        assert_eq!(complete_rx.recv().await, None);
    }
}
