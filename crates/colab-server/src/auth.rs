//! Password login. Without a configured password hash every request is allowed.
//!
//! A successful login sets a cookie holding a token derived from the per-start cookie
//! secret, so restarting the server logs everyone out.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
    Form,
};
use serde::Deserialize;
use tracing::warn;

use crate::state::{AppState, WebSettings};

pub const AUTH_COOKIE: &str = "colab-auth";

/// Bytes of the cookie secret that make up the login token.
const TOKEN_LEN: usize = 32;

pub fn login_token(cookie_secret: &[u8]) -> String {
    hex::encode(&cookie_secret[..cookie_secret.len().min(TOKEN_LEN)])
}

fn has_token(headers: &HeaderMap, token: &str) -> bool {
    !token.is_empty()
        && headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| name == AUTH_COOKIE && value == token)
}

fn logged_in(web: &WebSettings, headers: &HeaderMap) -> bool {
    web.password_hash.is_none() || has_token(headers, &web.login_token)
}

/// API calls without a login cookie get 403.
pub async fn require_login_api(
    State(web): State<Arc<WebSettings>>,
    req: Request,
    next: Next,
) -> Response {
    if logged_in(&web, req.headers()) {
        return next.run(req).await;
    }
    StatusCode::FORBIDDEN.into_response()
}

/// Pages without a login cookie redirect to the login form.
pub async fn require_login_page(
    State(web): State<Arc<WebSettings>>,
    req: Request,
    next: Next,
) -> Response {
    if logged_in(&web, req.headers()) {
        return next.run(req).await;
    }
    Redirect::to(&format!("{}login", web.base_url)).into_response()
}

#[derive(Deserialize)]
pub struct LoginForm {
    password: String,
}

pub async fn login_page(State(state): State<AppState>) -> Response {
    crate::api::render_page(&state.web, "login.html").await
}

/// Check `password` against a bcrypt hash off the async runtime.
async fn verify_password(password: String, hash: String) -> bool {
    match tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await {
        Ok(Ok(valid)) => valid,
        Ok(Err(e)) => {
            warn!("Password hash check failed: {}", e);
            false
        }
        Err(e) => {
            warn!("Password hash check panicked: {}", e);
            false
        }
    }
}

pub async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    let web = &state.web;
    let accepted = match &web.password_hash {
        Some(hash) => Some(verify_password(form.password, hash.clone()).await),
        None => None,
    };
    match accepted {
        Some(true) => {
            let cookie = format!(
                "{}={}; Path={}; HttpOnly; SameSite=Strict",
                AUTH_COOKIE, web.login_token, web.base_url
            );
            (
                [(header::SET_COOKIE, cookie)],
                Redirect::to(&format!("{}welcome", web.base_url)),
            )
                .into_response()
        }
        Some(false) => {
            warn!("Rejected login attempt");
            (
                StatusCode::FORBIDDEN,
                Html("<p>Invalid password.</p>".to_string()),
            )
                .into_response()
        }
        None => Redirect::to(&format!("{}welcome", web.base_url)).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_login_token_uses_secret_prefix() {
        assert_eq!(login_token(&[0xab, 0x01]), "ab01");
        assert_eq!(login_token(&[0u8; 1024]).len(), TOKEN_LEN * 2);
    }

    #[test]
    fn test_has_token_parses_cookie_header() {
        let mut headers = HeaderMap::new();
        assert!(!has_token(&headers, "abc"));

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; colab-auth=abc"),
        );
        assert!(has_token(&headers, "abc"));
        assert!(!has_token(&headers, "abd"));
    }

    #[test]
    fn test_empty_token_never_matches() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("colab-auth="));
        assert!(!has_token(&headers, ""));
    }

    #[tokio::test]
    async fn test_verify_password_against_hash() {
        let hash = bcrypt::hash("secret", 4).unwrap();
        assert!(verify_password("secret".to_string(), hash.clone()).await);
        assert!(!verify_password("wrong".to_string(), hash).await);
        assert!(!verify_password("secret".to_string(), "secret".to_string()).await);
    }
}
