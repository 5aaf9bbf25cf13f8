//! Per-call deadline and cancellation.
//!
//! Every network operation takes an [`OperationContext`]. A context carries an
//! optional deadline and a cancellation signal; backends race their I/O
//! against [`OperationContext::done`] so a caller can stop a blocked call
//! without dropping the whole future.

use crate::error::ContextError;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Deadline and cancellation signal for a single operation
#[derive(Debug, Clone)]
pub struct OperationContext {
    deadline: Option<Instant>,
    cancelled: watch::Receiver<bool>,
}

/// Cancels every [`OperationContext`] derived from it
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation; idempotent
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl OperationContext {
    /// Context that never expires and can never be cancelled
    pub fn background() -> Self {
        // With the sender dropped the receiver never observes a change.
        let (_sender, cancelled) = watch::channel(false);
        Self {
            deadline: None,
            cancelled,
        }
    }

    /// Context plus the handle that cancels it
    pub fn cancellable() -> (Self, CancelHandle) {
        let (sender, cancelled) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancelled,
            },
            CancelHandle { sender },
        )
    }

    /// Copy of this context that also expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Copy of this context that also expires at `deadline`.
    ///
    /// An earlier existing deadline is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancelled: self.cancelled.clone(),
        }
    }

    /// Deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context has ended, or `None` while it is still live
    pub fn err(&self) -> Option<ContextError> {
        if *self.cancelled.borrow() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> ContextError {
        let mut cancelled = self.cancelled.clone();
        let cancellation = async move {
            loop {
                if *cancelled.borrow_and_update() {
                    return;
                }
                if cancelled.changed().await.is_err() {
                    // Sender gone: cancellation can no longer happen.
                    std::future::pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancellation => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                cancellation.await;
                ContextError::Cancelled
            }
        }
    }

    /// Run `future` unless the context ends first
    pub async fn run<F, T>(&self, future: F) -> Result<T, ContextError>
    where
        F: std::future::Future<Output = T>,
    {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = future => Ok(output),
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
