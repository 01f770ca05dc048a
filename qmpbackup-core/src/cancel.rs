//! Cancellation / signal handling (C12) — a cooperative stop flag
//! consulted between monitor round-trips and poll iterations, tripped by
//! a signal handler (§5, §9).
//!
//! Grounded in `tokio::signal`'s idiomatic async signal handling, with the
//! watch-channel shape used for broadcasting a one-shot stop flag to many
//! readers without locking.

use tokio::sync::watch;

/// Shared stop flag. Cheap to clone; every clone observes the same trip.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    /// Creates a token that has not been tripped.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Trips the token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the token has been tripped.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// Returns [`crate::error::Error::Cancelled`] if the token has
    /// tripped, else `Ok(())`. Call at every monitor round-trip and poll
    /// iteration (§5).
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() { Err(crate::error::Error::Cancelled) } else { Ok(()) }
    }

    /// Spawns a task that trips this token on `SIGINT`/`SIGTERM`.
    #[cfg(unix)]
    pub fn spawn_signal_handler(&self) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(%err, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(%err, "failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
            token.cancel();
        })
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_uncancelled_and_trips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.check().unwrap();

        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.check().is_err());
    }

    #[test]
    fn clones_observe_the_same_trip() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
