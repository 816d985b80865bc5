//! Shared shutdown signal, cancellation tokens and supervised task spawning.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error};

/// Shared stop signal for every background loop.
///
/// Triggering is idempotent; receivers observe the change within one await.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create an untriggered shutdown signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger the signal. Safe to call more than once.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Check whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Obtain a receiver for a background loop.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver half of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until shutdown is triggered.
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Check whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Per-operation cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    /// Create an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the associated operation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check whether the token has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait for cancellation.
    pub async fn canceled(&self) {
        while !self.is_canceled() {
            self.notify.notified().await;
        }
    }
}

/// Spawn a loop that is relaunched after a panic.
///
/// The factory is invoked for every (re)launch; the shutdown signal stops
/// restarts once triggered.
pub fn spawn_supervised<F, Fut>(name: &'static str, shutdown: ShutdownSignal, factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    if shutdown.is_triggered() {
                        break;
                    }
                    error!(task = name, "background task panicked, restarting");
                }
                Err(_) => break,
            }
        }
        debug!(task = name, "background task finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();

        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());

        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("signal should fire promptly");
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());

        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.canceled().await });

        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_canceled());
    }

    #[tokio::test]
    async fn test_supervised_restart_after_panic() {
        use std::sync::atomic::AtomicU32;

        let shutdown = Shutdown::new();
        let launches = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&launches);
        spawn_supervised("panicky", shutdown.signal(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first launch dies");
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(launches.load(Ordering::SeqCst) >= 2);
        shutdown.trigger();
    }
}
