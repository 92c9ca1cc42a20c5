//! Error types for colab-core.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ColabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Other(String),
}

/// Rejected configuration, reported before anything is bound.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("a TLS key file ({0}) was given without a certificate file")]
    KeyWithoutCertificate(PathBuf),

    #[error("invalid bind address {0:?}")]
    InvalidAddress(String),

    #[error("cookie secret is not valid hex: {0}")]
    CookieSecret(#[from] hex::FromHexError),

    #[error("cookie secret must be at least {min} bytes, got {len}")]
    CookieSecretTooShort { len: usize, min: usize },

    #[error("password hash is not a bcrypt hash: {0}")]
    PasswordHash(#[source] bcrypt::BcryptError),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Error, Debug)]
pub enum BindError {
    /// Address in use or permission denied. Logged by the allocator, never returned.
    #[error("port {port} is unavailable: {source}")]
    Retryable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind port {port}: {source}")]
    Fatal {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no available port could be found after {attempts} attempts")]
    NoAvailablePort { attempts: usize },
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("failed to write discovery record {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read discovery record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed discovery record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to remove discovery record {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to start kernel: {0}")]
    Start(String),

    #[error("kernel not found: {0}")]
    NotFound(String),

    #[error("failed to shut down {failed} kernel(s): {message}")]
    Shutdown { failed: usize, message: String },
}

pub type Result<T> = std::result::Result<T, ColabError>;
