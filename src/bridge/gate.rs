//! Admission gate for calls into a loaded module
//!
//! Every source call holds a [`CallPermit`] for its whole duration. Closing
//! the gate refuses new calls and lets the owner wait until running ones have
//! returned, so the execution context is never unloaded under a live call.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
pub struct CallGate {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl CallGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admit one call, or `None` once the gate is closed
    pub fn enter(self: &Arc<Self>) -> Option<CallPermit> {
        // count first so a concurrent close either sees us or we see it
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.leave();
            return None;
        }
        Some(CallPermit { gate: self.clone() })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse new calls without waiting
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Close, then wait up to `timeout` for running calls. Returns whether the gate drained.
    pub async fn close_and_drain(&self, timeout: Duration) -> bool {
        self.close();
        let drain = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drain).await.is_ok()
    }

    fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.is_closed() {
            self.drained.notify_waiters();
        }
    }
}

/// One admitted call; leaving the gate on drop
pub struct CallPermit {
    gate: Arc<CallGate>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.gate.leave();
    }
}
