//! Shared application state for the Axum server.

use std::path::PathBuf;
use std::sync::Arc;

use colab_core::ServerConfig;

use crate::auth::login_token;
use crate::kernels::KernelManager;
use crate::notebooks::FileNotebookManager;
use crate::sessions::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub kernels: KernelManager,
    pub sessions: SessionRegistry,
    pub notebooks: Arc<FileNotebookManager>,
    pub web: Arc<WebSettings>,
}

impl AppState {
    pub fn new(
        kernels: KernelManager,
        notebooks: Arc<FileNotebookManager>,
        web: WebSettings,
    ) -> Self {
        Self {
            kernels,
            sessions: SessionRegistry::new(),
            notebooks,
            web: Arc::new(web),
        }
    }
}

/// Request-handling settings taken from the server configuration.
#[derive(Debug, Clone)]
pub struct WebSettings {
    /// Always starts and ends with `/`.
    pub base_url: String,
    /// Directory searched for page templates before the built-in ones.
    pub template_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub trust_xheaders: bool,
    /// bcrypt hash; when set, pages and API calls require logging in.
    pub password_hash: Option<String>,
    /// Value of the login cookie; see [`crate::auth`].
    pub login_token: String,
}

impl WebSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            template_dir: config
                .template_path
                .clone()
                .unwrap_or_else(|| config.resources_dir.join("colab")),
            resources_dir: config.resources_dir.clone(),
            trust_xheaders: config.trust_xheaders,
            password_hash: config.password_hash.clone(),
            login_token: login_token(&config.cookie_secret),
        }
    }
}

impl Default for WebSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}
