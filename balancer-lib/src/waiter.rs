//! Wait for a dynamic set of in-flight requests to finish.
//!
//! A [`WaitGroup`] has a single waiter and any number of waitees. Each
//! waitee holds a [`WaitGuard`]; cloning a guard registers more work. Once
//! every guard is gone, [`WaitGroup::wait`] returns.
//!
//! Connection handles use this to drain: every request started on a handle
//! clones the handle's guard, and recycling drops the primary guard and
//! waits. No new request can pick up a retired handle, so the wait ends
//! once the last request that used it completes.
//!
//! The implementation wraps [`tokio::sync::mpsc::channel`]. The group
//! holds the receiver, every guard holds a sender, and no message is ever
//! sent. The receiver sees the channel close when the last sender drops.

use futures::never::Never;
use tokio::sync::mpsc::{Receiver, Sender, channel};

/// Waits for all [`WaitGuard`]s created from it to be dropped.
///
/// A group is single-use: [`WaitGroup::wait`] consumes it. After the last
/// guard is dropped, no new guard can be created.
#[derive(Debug)]
pub struct WaitGroup {
    recv: Receiver<Never>,
}

/// Outstanding work for a [`WaitGroup`], released on drop.
#[derive(Clone, Debug)]
pub struct WaitGuard {
    _send: Sender<Never>,
}

impl WaitGroup {
    /// Create a group and its first guard.
    ///
    /// Further guards are created by cloning the returned [`WaitGuard`].
    #[must_use]
    pub fn new() -> (Self, WaitGuard) {
        let (send, recv) = channel(1);
        (Self { recv }, WaitGuard { _send: send })
    }

    /// Resolve once every associated guard has been dropped
    pub async fn wait(mut self) {
        let None = self.recv.recv().await;
    }
}
