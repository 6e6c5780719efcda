//! Continuation bridge for suspend-style foreign calls
//!
//! A foreign call receives a [`Continuation`] and either answers on the spot
//! ([`Suspend::Ready`]) or keeps the continuation and resumes it later from
//! whatever thread it runs on. [`call_suspend`] turns either outcome into a
//! host future.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::runtime::ForeignError;
use crate::core::error::{BridgeError, Result};

/// One-shot completion handle handed to a foreign call
pub struct Continuation<T> {
    sender: oneshot::Sender<std::result::Result<T, ForeignError>>,
}

impl<T> Continuation<T> {
    /// Deliver the result. Resuming after the host stopped waiting is a no-op.
    pub fn resume(self, result: std::result::Result<T, ForeignError>) {
        let _ = self.sender.send(result);
    }

    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Immediate outcome of a suspend-style call
pub enum Suspend<T> {
    Ready(std::result::Result<T, ForeignError>),
    /// The continuation was kept and will be resumed later
    Suspended,
}

/// Invoke a suspend-style foreign call and wait for its result.
///
/// Cancellation is best-effort: the foreign side may keep running after
/// this returns `Cancelled`.
pub async fn call_suspend<T, F>(call: F, cancel: &CancellationToken) -> Result<T>
where
    F: FnOnce(Continuation<T>) -> Suspend<T>,
{
    if cancel.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }

    let (sender, receiver) = oneshot::channel();
    if let Suspend::Ready(result) = call(Continuation { sender }) {
        return result.map_err(Into::into);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
        result = receiver => match result {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(BridgeError::request("foreign call dropped its continuation without a result")),
        },
    }
}
