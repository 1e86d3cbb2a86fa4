//! Cooperative stop/pause signals.
//!
//! The supervisor owns a [`RunSignal`]; the worker holds a [`SignalListener`]
//! and polls it only at suspension points (before a load attempt and at the
//! start of an epoch). In-flight backend calls are never interrupted.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RunSignal {
    cancel: CancellationToken,
    hold: watch::Sender<bool>,
}

impl RunSignal {
    #[must_use]
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self { cancel: CancellationToken::new(), hold }
    }

    #[must_use]
    pub fn listener(&self) -> SignalListener {
        SignalListener { cancel: self.cancel.clone(), hold: self.hold.subscribe() }
    }

    /// Requests cancellation. Also releases a held run so it can observe it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn hold(&self) {
        self.hold.send_replace(true);
    }

    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        *self.hold.borrow()
    }
}

impl Default for RunSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// How a hold ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldRelease {
    Resumed,
    Cancelled,
}

/// Worker-side view of a [`RunSignal`].
#[derive(Debug, Clone)]
pub struct SignalListener {
    cancel: CancellationToken,
    hold: watch::Receiver<bool>,
}

impl SignalListener {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        *self.hold.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Waits while the run is held. No timeout.
    pub async fn wait_while_held(&mut self) -> HoldRelease {
        if self.is_cancelled() {
            return HoldRelease::Cancelled;
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => HoldRelease::Cancelled,
            released = self.hold.wait_for(|held| !*held) => match released {
                Ok(_) if !self.cancel.is_cancelled() => HoldRelease::Resumed,
                // Sender dropped or stop raced with resume: treat as a stop.
                _ => HoldRelease::Cancelled,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_resumes_held_listener() {
        let signal = RunSignal::new();
        let mut listener = signal.listener();
        signal.hold();
        assert!(listener.is_held());

        let waiter = tokio::spawn(async move { listener.wait_while_held().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.release();

        assert_eq!(waiter.await.unwrap(), HoldRelease::Resumed);
    }

    #[tokio::test]
    async fn test_cancel_ends_hold() {
        let signal = RunSignal::new();
        let mut listener = signal.listener();
        signal.hold();

        let waiter = tokio::spawn(async move { listener.wait_while_held().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel();

        assert_eq!(waiter.await.unwrap(), HoldRelease::Cancelled);
    }

    #[tokio::test]
    async fn test_unheld_listener_returns_immediately() {
        let signal = RunSignal::new();
        let mut listener = signal.listener();
        assert_eq!(listener.wait_while_held().await, HoldRelease::Resumed);
    }
}
