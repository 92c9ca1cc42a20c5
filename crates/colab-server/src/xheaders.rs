//! Proxy headers. Only consulted when the server is told to trust them.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

/// Client address and scheme as reported by a fronting proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteClient {
    pub ip: Option<String>,
    pub scheme: Option<String>,
}

impl RemoteClient {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let ip = header(headers, "x-real-ip").or_else(|| {
            header(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
                .filter(|s| !s.is_empty())
        });
        let scheme = header(headers, "x-scheme")
            .or_else(|| header(headers, "x-forwarded-proto"))
            .map(|s| s.to_lowercase());
        Self { ip, scheme }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Attach a [`RemoteClient`] extension to every request.
pub async fn remote_client(mut req: Request, next: Next) -> Response {
    let client = RemoteClient::from_headers(req.headers());
    req.extensions_mut().insert(client);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_real_ip_wins_over_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(
            RemoteClient::from_headers(&headers).ip.as_deref(),
            Some("10.0.0.1")
        );

        headers.insert("x-real-ip", HeaderValue::from_static("192.168.1.7"));
        assert_eq!(
            RemoteClient::from_headers(&headers).ip.as_deref(),
            Some("192.168.1.7")
        );
    }

    #[test]
    fn test_scheme_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(RemoteClient::from_headers(&headers), RemoteClient::default());

        headers.insert("x-forwarded-proto", HeaderValue::from_static("HTTPS"));
        assert_eq!(
            RemoteClient::from_headers(&headers).scheme.as_deref(),
            Some("https")
        );

        headers.insert("x-scheme", HeaderValue::from_static("http"));
        assert_eq!(
            RemoteClient::from_headers(&headers).scheme.as_deref(),
            Some("http")
        );
    }
}
