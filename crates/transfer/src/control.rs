//! Pause/resume/cancel control for one transfer.
//!
//! A [`ControlHandle`] is owned by the layer that started the transfer; every
//! task belonging to the transfer holds a [`ControlWatcher`]. Suspension is
//! notification-driven — a paused task parks on the watch channel and wakes
//! on the next state change, it never polls.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
    Cancelled,
}

/// Shared control switch. Cloning is cheap; all clones steer the same
/// transfer.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Arc<watch::Sender<ControlState>>,
    cancel: CancellationToken,
}

impl ControlHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Running);
        Self {
            tx: Arc::new(tx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn current(&self) -> ControlState {
        *self.tx.borrow()
    }

    /// Pauses a running transfer. No effect once cancelled.
    pub fn pause(&self) {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Running {
                *state = ControlState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Resumes a paused transfer. No effect once cancelled.
    pub fn resume(&self) {
        self.tx.send_if_modified(|state| {
            if *state == ControlState::Paused {
                *state = ControlState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Cancels the transfer. Terminal: wakes paused tasks and trips every
    /// derived cancellation token.
    pub fn cancel(&self) {
        self.tx.send_replace(ControlState::Cancelled);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation token tied to this transfer; child tokens propagate
    /// top-down.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn watcher(&self) -> ControlWatcher {
        ControlWatcher {
            rx: self.tx.subscribe(),
            cancel: self.cancel.clone(),
        }
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-side view of a [`ControlHandle`].
#[derive(Clone)]
pub struct ControlWatcher {
    rx: watch::Receiver<ControlState>,
    cancel: CancellationToken,
}

impl ControlWatcher {
    /// Suspends while paused. Returns `Err(Cancelled)` once the transfer is
    /// cancelled, whether before or during the wait.
    pub async fn wait_until_running(&mut self) -> Result<(), TransferError> {
        loop {
            let state = *self.rx.borrow_and_update();
            match state {
                ControlState::Running => return Ok(()),
                ControlState::Cancelled => return Err(TransferError::Cancelled),
                ControlState::Paused => {
                    if self.rx.changed().await.is_err() {
                        return Err(TransferError::Cancelled);
                    }
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
