//! Shutdown coordination.
//!
//! [`ShutdownSignal`] stops the accept loop and asks open HTTP connections
//! to finish. [`ConnectionTracker`] lets the server wait for them.
//!
//! ```rust
//! use portico_server::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let for_task = shutdown.clone();
//! for_task.trigger();
//! assert!(shutdown.is_shutdown());
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Trigger-once flag shared by every clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Triggers shutdown. Later calls do nothing.
    pub fn trigger(&self) {
        if !self.state.send_replace(true) {
            tracing::debug!("shutdown triggered");
        }
    }

    /// Whether [`trigger`](Self::trigger) has been called.
    pub fn is_shutdown(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the signal is triggered, immediately if it already is.
    ///
    /// The subscription is taken when this is called, not on first poll.
    pub fn recv(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.subscribe();
        async move {
            let _ = state.wait_for(|triggered| *triggered).await;
        }
    }

    /// Creates a signal fired by SIGTERM or SIGINT (Ctrl+C off unix).
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn with_os_signals() -> Self {
        let signal = Self::new();
        let fire = signal.clone();
        tokio::spawn(async move {
            if let Some(name) = os_signal().await {
                tracing::info!(signal = name, "stopping server");
                fire.trigger();
            }
        });
        signal
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for a termination signal and returns its name, or `None` if no
/// handler could be installed.
#[cfg(unix)]
async fn os_signal() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())
        .map_err(|e| tracing::error!(error = %e, "cannot listen for SIGTERM"))
        .ok()?;
    let mut int = signal(SignalKind::interrupt())
        .map_err(|e| tracing::error!(error = %e, "cannot listen for SIGINT"))
        .ok()?;

    tokio::select! {
        _ = term.recv() => Some("SIGTERM"),
        _ = int.recv() => Some("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn os_signal() -> Option<&'static str> {
    match tokio::signal::ctrl_c().await {
        Ok(()) => Some("ctrl-c"),
        Err(e) => {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            None
        }
    }
}

/// Counts open HTTP connections.
///
/// ```rust
/// use portico_server::ConnectionTracker;
///
/// let tracker = ConnectionTracker::new();
/// let token = tracker.acquire();
/// assert_eq!(tracker.active_connections(), 1);
/// drop(token);
/// assert_eq!(tracker.active_connections(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    open: Arc<watch::Sender<usize>>,
}

impl ConnectionTracker {
    /// Creates a tracker with nothing open.
    #[must_use]
    pub fn new() -> Self {
        let (open, _) = watch::channel(0);
        Self { open: Arc::new(open) }
    }

    /// Counts one connection until the returned token drops.
    #[must_use]
    pub fn acquire(&self) -> ConnectionToken {
        self.open.send_modify(|n| *n += 1);
        ConnectionToken {
            open: Arc::clone(&self.open),
        }
    }

    /// Tokens currently alive.
    pub fn active_connections(&self) -> usize {
        *self.open.borrow()
    }

    /// Resolves when no token is alive.
    pub async fn wait_idle(&self) {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one connection counted in its [`ConnectionTracker`].
#[derive(Debug)]
pub struct ConnectionToken {
    open: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        self.open.send_modify(|n| *n = n.saturating_sub(1));
    }
}
