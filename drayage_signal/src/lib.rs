//! One-shot shutdown signalling between the drayage supervisor and its
//! long-running tasks.
//!
//! A [`Broadcaster`] is held by whoever decides that the process is done --
//! in practice the signal handler in the binary -- and any number of
//! [`Watcher`] clones are parked inside component loops. Calling
//! [`Broadcaster::signal`] resolves every pending and future
//! [`Watcher::recv`] call. The signal fires exactly once and cannot be
//! rescinded.

use tokio::sync::watch;
use tracing::debug;

/// Create a connected [`Broadcaster`]/[`Watcher`] pair.
#[must_use]
pub fn signal() -> (Broadcaster, Watcher) {
    let (sender, receiver) = watch::channel(false);
    (Broadcaster { sender }, Watcher { receiver })
}

/// The sending half of a shutdown signal.
#[derive(Debug)]
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Fire the signal, waking every [`Watcher`].
    ///
    /// Consumes the broadcaster: the signal is one-shot. Dropping the
    /// broadcaster without calling this has the same effect, so a panic in
    /// the supervisor still releases the watchers.
    pub fn signal(self) {
        debug!("broadcasting shutdown signal");
        let _ = self.sender.send(true);
    }
}

/// The receiving half of a shutdown signal.
///
/// Watchers are cheap to clone; each component loop keeps its own.
#[derive(Debug, Clone)]
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Wait until the signal fires.
    ///
    /// Resolves immediately if the signal has already fired, or if the
    /// [`Broadcaster`] was dropped without firing.
    pub async fn recv(mut self) {
        // wait_for errors only when the sender is gone, which we treat as a
        // signal: an aborted supervisor must still stop its tasks.
        let _ = self.receiver.wait_for(|fired| *fired).await;
    }

    /// Non-blocking probe of the signal state.
    #[must_use]
    pub fn peek(&self) -> bool {
        *self.receiver.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_wakes_all_watchers() {
        let (broadcaster, watcher) = signal();
        let other = watcher.clone();

        let first = tokio::spawn(watcher.recv());
        let second = tokio::spawn(other.recv());
        broadcaster.signal();

        first.await.expect("watcher task");
        second.await.expect("watcher task");
    }

    #[tokio::test]
    async fn recv_after_signal_resolves_immediately() {
        let (broadcaster, watcher) = signal();
        broadcaster.signal();
        assert!(watcher.peek());
        watcher.recv().await;
    }

    #[tokio::test]
    async fn dropped_broadcaster_releases_watchers() {
        let (broadcaster, watcher) = signal();
        drop(broadcaster);
        watcher.recv().await;
    }
}
