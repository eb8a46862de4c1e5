use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// A cloneable cancellation signal. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the signal is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of `self`, so `wait_for` only
        // fails if it was dropped, in which case nothing can cancel anymore.
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Result of a call raced against a deadline and a cancellation signal.
#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Runs `fut` until it completes, `timeout` elapses or `cancel` fires.
pub async fn guarded<F: Future>(
    fut: F,
    timeout: Duration,
    cancel: &Cancellation,
) -> Guarded<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Guarded::Cancelled,
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(output) => Guarded::Done(output),
            Err(_) => Guarded::TimedOut,
        },
    }
}
