//! Shutdown on SIGTERM or SIGINT (Ctrl+C on Windows).
//!
//! The listener task cancels a [`CancellationToken`]; the HTTP server stops
//! accepting connections when it fires and drains in-flight requests, so a
//! settlement already submitted still gets its response.

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Owns the signal listener task and the token it cancels.
#[derive(Debug)]
pub struct ShutdownSignal {
    listener: TaskTracker,
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Installs the signal handlers.
    ///
    /// # Errors
    ///
    /// Fails if a Unix signal handler cannot be registered.
    #[allow(clippy::unnecessary_wraps)] // infallible off Unix
    pub fn install() -> Result<Self, std::io::Error> {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let listener = TaskTracker::new();

        #[cfg(unix)]
        {
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            listener.spawn(async move {
                let name = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                    () = trigger.cancelled() => return,
                };
                tracing::info!(signal = name, "shutting down");
                trigger.cancel();
            });
        }

        #[cfg(not(unix))]
        {
            listener.spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!(signal = "ctrl-c", "shutting down");
                        trigger.cancel();
                    }
                    () = trigger.cancelled() => {}
                }
            });
        }

        listener.close();
        Ok(Self { listener, token })
    }

    /// A token cancelled when shutdown starts.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Starts shutdown without a signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Resolves once shutdown has started and the listener has exited.
    pub async fn recv(&self) {
        self.token.cancelled().await;
        self.listener.wait().await;
    }
}
