//! HTTP server setup and accept loops.
//!
//! # Responsibilities
//! - Build the axum router for the admission endpoint
//! - Wire up the admission gates in their required order
//! - Accept connections, optionally TLS-terminated and rate-gated
//! - Serve each connection with upgrade support for WebSockets

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, routing::get, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::EnvelopeConfig;
use crate::controller::{token_limit, tx_limit, TokenController, TxController};
use crate::firewall::Manager;
use crate::lifecycle::Shutdown;
use crate::session::{allow_request, EnvelopeState};

/// The admission endpoint path.
pub const ACCESS_PATH: &str = "/v0/envelope/access";

/// Time budget for non-upgraded requests, preventing connections from
/// staying open indefinitely. Clients that negotiate the WebSocket are
/// instead bounded by their session deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
}

/// HTTP server for the envelope access API.
pub struct EnvelopeServer {
    router: Router,
    tls: Option<TlsAcceptor>,
    tx: Option<Arc<TxController>>,
    shutdown: Shutdown,
}

impl EnvelopeServer {
    /// Create a new server. The gates are optional: the token gate is
    /// absent when no verifier is configured, the rate gate when no
    /// device is sampled.
    pub fn new(
        config: &EnvelopeConfig,
        token: Option<Arc<TokenController>>,
        tx: Option<Arc<TxController>>,
        manager: Arc<dyn Manager>,
        shutdown: Shutdown,
    ) -> Result<Self, ServerError> {
        let state = Arc::new(EnvelopeState {
            manager,
            subject: config.token.subject.clone(),
            token_required: config.token.required,
            min_timeout: config.envelope.timeout(),
            shutdown: shutdown.clone(),
        });
        let router = Self::build_router(state, token, tx.clone());
        let tls = if !config.listener.cert.is_empty() && !config.listener.key.is_empty() {
            Some(tls_acceptor(&config.listener.cert, &config.listener.key)?)
        } else {
            None
        };
        Ok(Self {
            router,
            tls,
            tx,
            shutdown,
        })
    }

    /// Build the axum router with all middleware layers.
    fn build_router(
        state: Arc<EnvelopeState>,
        token: Option<Arc<TokenController>>,
        tx: Option<Arc<TxController>>,
    ) -> Router {
        let mut router = Router::new()
            .route(ACCESS_PATH, get(allow_request))
            .with_state(state);
        // Layers added later run earlier. The token gate must run before
        // the rate gate so the rate gate can see the attached claim.
        if let Some(tx) = tx {
            router = router.layer(middleware::from_fn_with_state(tx, tx_limit));
        }
        if let Some(token) = token {
            router = router.layer(middleware::from_fn_with_state(token, token_limit));
        }
        router
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server, accepting connections on the given listener until
    /// shutdown is triggered.
    pub async fn run(self, listener: TcpListener) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            tls = self.tls.is_some(),
            "Envelope server starting"
        );

        let mut make_service = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = accept(&listener, self.tx.as_deref()) => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::debug!(error = %err, "connection rejected");
                    continue;
                }
            };

            let service =
                TowerToHyperService::new(unwrap_infallible(make_service.call(remote).await));
            let tls = self.tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => {
                            if let Err(err) = auto::Builder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                                .await
                            {
                                tracing::debug!(error = %err, client = %remote, "connection error");
                            }
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, client = %remote, "tls handshake failed");
                        }
                    },
                    None => {
                        if let Err(err) = auto::Builder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(TokioIo::new(stream), service)
                            .await
                        {
                            tracing::debug!(error = %err, client = %remote, "connection error");
                        }
                    }
                }
            });
        }

        tracing::info!("Envelope server stopped");
        Ok(())
    }
}

/// Accept through the rate controller when one is configured.
async fn accept(
    listener: &TcpListener,
    tx: Option<&TxController>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match tx {
        Some(tx) => tx.accept(listener).await,
        None => listener.accept().await,
    }
}

fn tls_acceptor(cert: &str, key: &str) -> Result<TlsAcceptor, ServerError> {
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    let certs = CertificateDer::pem_file_iter(cert)
        .map_err(|err| ServerError::Tls(err.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ServerError::Tls(err.to_string()))?;
    let key = PrivateKeyDer::from_pem_file(key).map_err(|err| ServerError::Tls(err.to_string()))?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ServerError::Tls(err.to_string()))?;
    // Sessions negotiate the WebSocket over HTTP/1.1.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn unwrap_infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::ConnectInfo;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use crate::firewall::NullManager;

    fn test_router() -> Router {
        let state = Arc::new(EnvelopeState {
            manager: Arc::new(NullManager),
            subject: "envelope".to_string(),
            token_required: false,
            min_timeout: Duration::from_secs(60),
            shutdown: Shutdown::new(),
        });
        EnvelopeServer::build_router(state, None, None)
    }

    fn request(method: Method) -> Request<Body> {
        let mut request = Request::builder()
            .method(method)
            .uri(ACCESS_PATH)
            .body(Body::empty())
            .expect("request");
        let peer: SocketAddr = "127.0.0.2:1234".parse().expect("peer addr");
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    #[tokio::test]
    async fn non_get_method_is_rejected() {
        let response = test_router()
            .oneshot(request(Method::POST))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn get_without_upgrade_headers_is_rejected() {
        let response = test_router()
            .oneshot(request(Method::GET))
            .await
            .expect("response");
        assert!(response.status().is_client_error());
    }
}
