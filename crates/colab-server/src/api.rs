//! HTTP handlers: pages, kernel and session APIs, embedded assets.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode, Uri},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Extension, Json, Router,
};
use colab_core::SessionError;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::state::{AppState, WebSettings};
use crate::xheaders::RemoteClient;

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/kernels", get(list_kernels).post(start_kernel))
        .route("/kernels/{id}", get(get_kernel).delete(shutdown_kernel))
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
}

pub fn pages() -> Router<AppState> {
    Router::new()
        .route("/", get(redirect_welcome))
        .route("/welcome", get(welcome))
        .route("/welcome/", get(welcome))
        .route("/notebook", get(notebook))
        .route("/notebook/", get(notebook))
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn session_error(e: SessionError) -> Response {
    let status = match e {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Start(_) | SessionError::Shutdown { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        error!("{}", e);
    }
    (status, e.to_string()).into_response()
}

fn log_client(action: &str, client: Option<Extension<RemoteClient>>) {
    if let Some(Extension(client)) = client {
        info!(
            ip = client.ip.as_deref().unwrap_or("-"),
            scheme = client.scheme.as_deref().unwrap_or("-"),
            "{}",
            action
        );
    }
}

// ─── Pages ───────────────────────────────────────────────────────────────────

async fn redirect_welcome(State(state): State<AppState>) -> Redirect {
    Redirect::to(&format!("{}welcome", state.web.base_url))
}

async fn welcome(State(state): State<AppState>) -> Response {
    render_page(&state.web, "welcome.html").await
}

async fn notebook(State(state): State<AppState>) -> Response {
    render_page(&state.web, "notebook.html").await
}

/// Render a page from the template directory, falling back to the built-in copy.
pub async fn render_page(web: &WebSettings, name: &str) -> Response {
    let path = web.template_dir.join(name);
    let template = match tokio::fs::read_to_string(&path).await {
        Ok(template) => template,
        Err(e) => {
            debug!("Using built-in {} ({}: {})", name, path.display(), e);
            match Assets::get(&format!("colab/{}", name)) {
                Some(file) => String::from_utf8_lossy(&file.data).into_owned(),
                None => return StatusCode::NOT_FOUND.into_response(),
            }
        }
    };
    Html(template.replace("{{ base_url }}", &web.base_url)).into_response()
}

// ─── Kernels ─────────────────────────────────────────────────────────────────

async fn list_kernels(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.kernels.list())
}

async fn start_kernel(
    State(state): State<AppState>,
    client: Option<Extension<RemoteClient>>,
) -> Response {
    log_client("Kernel start requested", client);
    match state.kernels.start(Some(state.notebooks.root())).await {
        Ok(kernel) => (StatusCode::CREATED, Json(kernel)).into_response(),
        Err(e) => session_error(e),
    }
}

async fn get_kernel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.kernels.get(&id) {
        Some(kernel) => Json(kernel).into_response(),
        None => session_error(SessionError::NotFound(id)),
    }
}

async fn shutdown_kernel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    client: Option<Extension<RemoteClient>>,
) -> Response {
    log_client("Kernel shutdown requested", client);
    match state.kernels.shutdown(&id).await {
        Ok(()) => {
            state.sessions.retain_kernels(|k| k != id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => session_error(e),
    }
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct NewSession {
    path: String,
}

fn prune_sessions(state: &AppState) {
    let kernels = &state.kernels;
    state.sessions.retain_kernels(|k| kernels.get(k).is_some());
}

async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    prune_sessions(&state);
    Json(state.sessions.list())
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    prune_sessions(&state);
    match state.sessions.get(&id) {
        Some(session) => Json(session).into_response(),
        None => session_error(SessionError::NotFound(id)),
    }
}

async fn create_session(
    State(state): State<AppState>,
    client: Option<Extension<RemoteClient>>,
    Json(request): Json<NewSession>,
) -> Response {
    prune_sessions(&state);
    if let Some(existing) = state.sessions.find_by_path(&request.path) {
        return Json(existing).into_response();
    }

    let Some(cwd) = state.notebooks.kernel_dir(&request.path) else {
        return (StatusCode::BAD_REQUEST, "Invalid notebook path").into_response();
    };

    log_client("Session requested", client);
    match state.kernels.start(Some(&cwd)).await {
        Ok(kernel) => {
            let session = state.sessions.create(&request.path, &kernel.id);
            (StatusCode::CREATED, Json(session)).into_response()
        }
        Err(e) => session_error(e),
    }
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(session) = state.sessions.remove(&id) else {
        return session_error(SessionError::NotFound(id));
    };
    match state.kernels.shutdown(&session.kernel_id).await {
        Ok(()) | Err(SessionError::NotFound(_)) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => session_error(e),
    }
}

// ─── Embedded assets ─────────────────────────────────────────────────────────

/// Built-in files under `/colab/`, used when the resources directory lacks them.
pub async fn serve_embedded(uri: Uri) -> Response {
    let path = format!("colab/{}", uri.path().trim_start_matches('/'));
    let Some(content) = Assets::get(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .body(Body::from(content.data.into_owned()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(rust_embed::Embed)]
#[folder = "resources/"]
#[include = "*.html"]
#[include = "*.css"]
#[include = "*.js"]
struct Assets;
