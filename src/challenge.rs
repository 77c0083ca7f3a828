//! HTTP-01 challenge responder.
//!
//! The certificate manager deposits `token -> key authorization` pairs here
//! while an order is validating; HAProxy's HTTP frontend forwards
//! `/.well-known/acme-challenge/*` to this server on its fixed internal
//! port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges, shared between the certificate manager and
/// the responder.
#[derive(Clone, Default)]
pub struct ChallengeStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Minimal HTTP server answering ACME validation requests.
pub struct ChallengeResponder {
    listener: TcpListener,
    store: ChallengeStore,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChallengeResponder {
    /// Bind the listener up front so a busy port is a startup failure, not
    /// a silently dead responder.
    pub async fn bind(
        port: u16,
        store: ChallengeStore,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind ACME responder on {addr}: {e}"))?;
        info!(%addr, "ACME challenge responder listening");
        Ok(Self {
            listener,
            store,
            shutdown_rx,
        })
    }

    /// Local address, useful when bound to an ephemeral port in tests.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let store = self.store.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let store = store.clone();
                                async move { respond(req, store).await }
                            });
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "challenge connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept challenge connection");
                    }
                },
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("ACME challenge responder shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn respond(
    req: Request<hyper::body::Incoming>,
    store: ChallengeStore,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let path = req.uri().path();

    if req.method() != Method::GET {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let Some(token) = path.strip_prefix(CHALLENGE_PREFIX).filter(|t| !t.is_empty()) else {
        return Ok(plain(StatusCode::NOT_FOUND, "not found"));
    };

    match store.get(token).await {
        Some(key_authorization) => {
            debug!(token, "served ACME challenge");
            Ok(plain(StatusCode::OK, key_authorization))
        }
        None => {
            warn!(token, "unknown ACME challenge token");
            Ok(plain(StatusCode::NOT_FOUND, "unknown token"))
        }
    }
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}
