//! Per-transfer liveness watchdog.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;

use crate::control::ControlHandle;

/// Force-cancels a transfer that shows no progress within the timeout.
///
/// Every block delivery and control callback beats the heart. If nothing
/// beats for a full timeout window the transfer is assumed hung and its
/// control handle is cancelled; the owner can distinguish this from a user
/// cancel via [`is_stalled`]. This is a safety net against silently hung
/// I/O, not a correctness mechanism.
///
/// [`is_stalled`]: Heartbeat::is_stalled
pub struct Heartbeat {
    last_beat: Arc<Mutex<Instant>>,
    paused: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(timeout: Duration, control: ControlHandle) -> Self {
        let last_beat = Arc::new(Mutex::new(Instant::now()));
        let paused = Arc::new(AtomicBool::new(false));
        let stalled = Arc::new(AtomicBool::new(false));

        let poll = (timeout / 4).max(Duration::from_millis(10));
        let beat_ref = Arc::clone(&last_beat);
        let paused_ref = Arc::clone(&paused);
        let stalled_ref = Arc::clone(&stalled);
        let task = tokio::spawn(async move {
            let mut was_idle = false;
            loop {
                tokio::time::sleep(poll).await;
                if control.is_cancelled() {
                    break;
                }
                // A user pause is control activity, not a stall.
                let idle = paused_ref.load(Ordering::Relaxed)
                    || control.current() == crate::control::ControlState::Paused;
                if idle {
                    was_idle = true;
                    continue;
                }
                if was_idle {
                    was_idle = false;
                    *beat_ref.lock().unwrap() = Instant::now();
                    continue;
                }
                let elapsed = beat_ref.lock().unwrap().elapsed();
                if elapsed >= timeout {
                    warn!(elapsed_secs = elapsed.as_secs(), "transfer stalled, cancelling");
                    stalled_ref.store(true, Ordering::SeqCst);
                    control.cancel();
                    break;
                }
            }
        });

        Self {
            last_beat,
            paused,
            stalled,
            task,
        }
    }

    pub fn beat(&self) {
        *self.last_beat.lock().unwrap() = Instant::now();
    }

    /// Suspends the watchdog, e.g. while waiting out a network outage.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.beat();
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.task.abort();
    }
}
