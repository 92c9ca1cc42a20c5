//! colab-server: Axum web server, kernel and session management for the notebook server.

pub mod api;
pub mod auth;
pub mod kernels;
pub mod notebooks;
pub mod sessions;
pub mod state;
pub mod tls;
pub mod xheaders;

use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use colab_core::{ServerConfig, Service, ShutdownHandle};
use tokio_rustls::rustls;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use kernels::{KernelInfo, KernelManager};
pub use notebooks::FileNotebookManager;
pub use sessions::{SessionModel, SessionRegistry};
pub use state::{AppState, WebSettings};
pub use xheaders::RemoteClient;

/// Build the Axum router with all routes, mounted under the configured base URL.
pub fn build_router(state: AppState) -> Router {
    let web = Arc::clone(&state.web);
    let resources = &web.resources_dir;

    let pages = api::pages().route_layer(axum::middleware::from_fn_with_state(
        Arc::clone(&web),
        auth::require_login_page,
    ));
    let api_routes = api::router().route_layer(axum::middleware::from_fn_with_state(
        Arc::clone(&web),
        auth::require_login_api,
    ));

    let mut app = Router::new()
        .merge(pages)
        .nest("/api", api_routes)
        .route("/login", get(auth::login_page).post(auth::login))
        .nest_service(
            "/colab",
            ServeDir::new(resources.join("colab")).fallback(get(api::serve_embedded)),
        )
        .nest_service("/extern", ServeDir::new(resources.join("extern")))
        .nest_service(
            "/closure",
            ServeDir::new(resources.join("closure-library").join("closure").join("goog")),
        )
        .nest_service("/ipython", ServeDir::new(resources.join("ipython_patch")))
        .with_state(state);

    if web.trust_xheaders {
        app = app.layer(axum::middleware::from_fn(xheaders::remote_client));
    }
    let app = app.layer(TraceLayer::new_for_http());

    match web.base_url.trim_end_matches('/') {
        "" => app,
        prefix => Router::new().nest(prefix, app),
    }
}

/// The request-serving component handed to the lifecycle controller.
pub struct WebServer {
    router: Router,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl WebServer {
    /// Load TLS material (if configured) and build the router. Fails before serving
    /// when the certificate cannot be used.
    pub fn new(state: AppState, config: &ServerConfig) -> colab_core::Result<Self> {
        let tls = config.tls.as_ref().map(tls::load_tls_config).transpose()?;
        Ok(Self {
            router: build_router(state),
            tls,
        })
    }
}

#[async_trait]
impl Service<std::net::TcpListener> for WebServer {
    async fn serve(
        self,
        listener: std::net::TcpListener,
        shutdown: ShutdownHandle,
    ) -> colab_core::Result<()> {
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        info!("Accepting connections on {}", listener.local_addr()?);

        match self.tls {
            Some(tls) => tls::serve_tls(listener, self.router, tls, shutdown).await,
            None => {
                let stopped = shutdown.token();
                axum::serve(listener, self.router)
                    .with_graceful_shutdown(stopped.cancelled_owned())
                    .await?;
                Ok(())
            }
        }
    }
}
