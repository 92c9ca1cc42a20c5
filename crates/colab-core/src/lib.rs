//! colab-core: bootstrap and lifecycle control for the colab notebook server.
//!
//! The lifecycle controller binds a port (retrying nearby ports when busy), writes a
//! discovery record so local tools can find the server, hands the socket to the
//! request-serving component, and on shutdown stops every kernel before removing the
//! record. Control-C asks for confirmation first; a second Control-C skips it.

pub mod config;
pub mod confirm;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod ports;
pub mod services;
pub mod shutdown;
pub mod signals;
pub mod status;

pub use config::{ServerConfig, Settings, TlsConfig};
pub use discovery::DiscoveryRecord;
pub use error::{BindError, ColabError, ConfigError, DiscoveryError, Result, SessionError};
pub use lifecycle::Lifecycle;
pub use ports::{BoundEndpoint, TcpBinder};
pub use services::{ContentManager, Service, SessionManager};
pub use shutdown::{ShutdownHandle, ShutdownReason};
pub use signals::{ControlMessage, InterruptPolicy, SignalState};
