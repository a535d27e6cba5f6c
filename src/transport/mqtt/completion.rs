//! One-shot completion signal shared by many waiters
//!
//! Backs the open (CONNACK) and default-subscribe (SUBACK) waits. The first
//! `try_*` call wins; later calls are ignored.

use crate::error::{TransportError, TransportResult};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum CompletionState {
    Pending,
    Completed,
    Failed(TransportError),
    Canceled,
}

#[derive(Debug)]
pub struct Completion {
    tx: watch::Sender<CompletionState>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CompletionState::Pending);
        Self { tx }
    }

    fn settle(&self, next: CompletionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == CompletionState::Pending {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn try_complete(&self) -> bool {
        self.settle(CompletionState::Completed)
    }

    pub fn try_fail(&self, error: TransportError) -> bool {
        self.settle(CompletionState::Failed(error))
    }

    /// Cancellation by the owner's own teardown; waiters observe `AlreadyClosed`
    pub fn try_cancel(&self) -> bool {
        self.settle(CompletionState::Canceled)
    }

    pub fn is_pending(&self) -> bool {
        *self.tx.borrow() == CompletionState::Pending
    }

    /// Wait until settled. Caller cancellation yields `Canceled` and leaves the
    /// completion untouched.
    pub async fn wait(&self, cancel: &CancellationToken) -> TransportResult<()> {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                CompletionState::Completed => return Ok(()),
                CompletionState::Failed(e) => return Err(e),
                CompletionState::Canceled => return Err(TransportError::AlreadyClosed),
                CompletionState::Pending => {}
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::AlreadyClosed);
                    }
                }
                _ = cancel.cancelled() => return Err(TransportError::Canceled),
            }
        }
    }
}
