//! Request/response handshake primitive
//!
//! A one-shot response channel used by call-handling tasks to hand a decision
//! to the coordinator (or a spawned dial worker) and block until it replies.
//! The replying side signals at its safe handoff point and continues
//! independently; the waiting side resumes immediately, typically to start
//! blocking I/O of its own such as joining the mixing service.

use tokio::sync::oneshot;

use crate::errors::{BlaError, Result};

/// Reply half of a handshake, held by the worker
#[derive(Debug)]
pub struct HandshakeReply<T> {
    tx: oneshot::Sender<T>,
}

/// Wait half of a handshake, held by the requester
#[derive(Debug)]
pub struct HandshakeWait<T> {
    rx: oneshot::Receiver<T>,
}

/// Create a connected reply/wait pair
pub fn pair<T>() -> (HandshakeReply<T>, HandshakeWait<T>) {
    let (tx, rx) = oneshot::channel();
    (HandshakeReply { tx }, HandshakeWait { rx })
}

impl<T> HandshakeReply<T> {
    /// Deliver the response, waking the requester
    ///
    /// Returns the value back if the requester has already gone away.
    pub fn reply(self, value: T) -> std::result::Result<(), T> {
        self.tx.send(value)
    }
}

impl<T> HandshakeWait<T> {
    /// Block until the worker replies
    ///
    /// A dropped reply handle (worker died, coordinator stopped) surfaces as
    /// `BlaError::ChannelClosed` rather than hanging forever.
    pub async fn wait(self) -> Result<T> {
        self.rx.await.map_err(|_| BlaError::ChannelClosed)
    }
}
