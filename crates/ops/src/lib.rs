//! kassert ops: bounded-concurrency fan-out, poll-until waits and pod log commands.

#![forbid(unsafe_code)]

pub mod logs;
pub mod parallel;
pub mod poll;

pub use logs::{PodLogs, NAMESPACE_PLACEHOLDER};
pub use parallel::{AggregateError, ParallelExecutor};
pub use poll::{PollSettings, PollState, PollWaiter};

use tokio::sync::oneshot;

/// Cancellation handle for a background loop.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }

    pub fn is_armed(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }
}
