//! Shutdown trigger and the one-shot teardown sequence.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info, warn};

use crate::discovery;
use crate::services::SessionManager;

/// Why the serving loop was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Interrupt with no confirmation available, or a second interrupt.
    Interrupt,
    /// Unconditional termination signal.
    Terminate,
    /// Operator answered yes in the confirmation dialog.
    Confirmed,
    /// The serving loop returned on its own.
    ServiceExited,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Terminate => "terminate",
            ShutdownReason::Confirmed => "confirmed",
            ShutdownReason::ServiceExited => "service exited",
        };
        f.write_str(s)
    }
}

/// Cloneable handle that asks the serving loop to stop. Triggering is idempotent;
/// the first reason wins.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Returns `true` for the call that actually triggered it.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// The shutdown sequence: shut down compute sessions, then remove the discovery record.
/// Runs at most once no matter how many callers race to it; late callers wait for the
/// first run to finish.
pub struct Teardown {
    sessions: Arc<dyn SessionManager>,
    info_file: PathBuf,
    done: OnceCell<()>,
}

impl Teardown {
    pub fn new(sessions: Arc<dyn SessionManager>, info_file: PathBuf) -> Self {
        Self {
            sessions,
            info_file,
            done: OnceCell::new(),
        }
    }

    pub async fn run(&self) {
        self.done
            .get_or_init(|| async {
                info!("Shutting down kernels");
                if let Err(e) = self.sessions.shutdown_all().await {
                    error!("Failed to shut down kernels: {}", e);
                }
                if let Err(e) = discovery::remove(&self.info_file) {
                    warn!("{}", e);
                }
            })
            .await;
    }

    pub fn has_run(&self) -> bool {
        self.done.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_triggered());
        assert!(handle.trigger(ShutdownReason::Terminate));
        assert!(!handle.clone().trigger(ShutdownReason::Confirmed));
        assert!(handle.is_triggered());
        assert_eq!(handle.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_cancelled_resolves_after_trigger() {
        let handle = ShutdownHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        handle.trigger(ShutdownReason::Interrupt);
        task.await.unwrap();
    }
}
