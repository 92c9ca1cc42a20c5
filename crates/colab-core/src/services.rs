//! Collaborator contracts. The lifecycle controller starts and stops these but does
//! not implement them.

use async_trait::async_trait;

use crate::error::{Result, SessionError};
use crate::shutdown::ShutdownHandle;

/// Manages compute sessions (kernels).
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Shut down every running session and clean up its resources.
    async fn shutdown_all(&self) -> std::result::Result<(), SessionError>;

    fn active_count(&self) -> usize;
}

/// Notebook/document storage.
pub trait ContentManager: Send + Sync {
    fn info_string(&self) -> String;
}

/// The request-serving component that takes over the bound socket.
///
/// `serve` must return once `shutdown` is triggered.
#[async_trait]
pub trait Service<L: Send + 'static>: Send {
    async fn serve(self, listener: L, shutdown: ShutdownHandle) -> Result<()>;
}
