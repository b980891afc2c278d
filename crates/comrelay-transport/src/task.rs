//! Run-flags and callback isolation shared by every client loop

use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::watch;
use tracing::error;

/// Create a linked trigger/signal pair. The signal fires once the trigger is
/// pulled or dropped.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Owner side of a client's run-flag
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown. Returns `false` if it had already been requested.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Loop side of a client's run-flag
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the trigger is gone
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Run a user callback, containing any panic to this one invocation.
pub fn invoke_guarded<F>(client_id: &str, callback: F)
where
    F: FnOnce(),
{
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(client = client_id, "callback failed: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_fires_on_trigger() {
        let (trigger, mut signal) = shutdown_channel();
        assert!(!signal.is_triggered());
        assert!(trigger.trigger());
        assert!(!trigger.trigger());
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_fires_on_drop() {
        let (trigger, mut signal) = shutdown_channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .unwrap();
    }

    #[test]
    fn test_invoke_guarded_contains_panic() {
        let calls = AtomicU32::new(0);
        invoke_guarded("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            panic!("boom");
        });
        invoke_guarded("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
