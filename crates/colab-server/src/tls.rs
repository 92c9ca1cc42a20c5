//! TLS: certificate loading and the HTTPS accept loop.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use colab_core::{ColabError, ShutdownHandle, TlsConfig};
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, warn};

fn open(path: &Path) -> colab_core::Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ColabError::Other(format!("cannot open {}: {}", path.display(), e))
    })
}

/// Load the certificate chain and private key. The key may live in the certificate file.
pub fn load_tls_config(tls: &TlsConfig) -> colab_core::Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut open(&tls.certfile)?)
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ColabError::Other(format!(
            "no certificates found in {}",
            tls.certfile.display()
        )));
    }

    let key_path = tls.key_path();
    let key = rustls_pemfile::private_key(&mut open(key_path)?)?.ok_or_else(|| {
        ColabError::Other(format!("no private key found in {}", key_path.display()))
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ColabError::Other(format!("invalid TLS configuration: {}", e)))?;

    Ok(Arc::new(config))
}

/// Accept TLS connections until shutdown is requested.
pub async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: Arc<ServerConfig>,
    shutdown: ShutdownHandle,
) -> colab_core::Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("HTTPS accept error: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let token = shutdown.token();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper::service::service_fn(
                move |req: hyper::Request<hyper::body::Incoming>| {
                    app.clone().oneshot(req.map(Body::new))
                },
            );

            let builder =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
            let conn = builder.serve_connection(io, service);
            tokio::pin!(conn);
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!("HTTPS connection error: {}", e);
                    }
                }
                _ = token.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_certificate_is_an_error() {
        let tls = TlsConfig {
            certfile: PathBuf::from("/nonexistent/cert.pem"),
            keyfile: None,
        };
        assert!(load_tls_config(&tls).is_err());
    }

    #[test]
    fn test_file_without_pem_blocks_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cert = tmp.path().join("cert.pem");
        std::fs::write(&cert, "not a certificate\n").unwrap();
        let tls = TlsConfig {
            certfile: cert,
            keyfile: None,
        };
        match load_tls_config(&tls) {
            Err(ColabError::Other(msg)) => assert!(msg.contains("no certificates")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
