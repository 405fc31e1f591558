//! HTTP binding: serves an [`SseServer`] over real sockets.
//!
//! One task per connection, tracked in a `JoinSet` so that dropping the
//! serve future tears every open stream down with it. Each request's
//! body is collected and handed to [`SseServer::dispatch`], whose
//! response body may stream for the lifetime of the connection.

use crate::error::{TransportError, TransportResult};
use crate::server::SseServer;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Accepts connections on `listener` until the future is dropped.
pub async fn run_server(server: SseServer, listener: TcpListener) -> TransportResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on http://{}", addr);
    }

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted
                    .map_err(|e| TransportError::network(format!("accept failed: {}", e)))?;
                let io = TokioIo::new(stream);
                let server = server.clone();

                connections.spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let server = server.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            Ok::<_, Infallible>(server.dispatch(parts, body).await)
                        }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        // Disconnects mid-stream are routine for this transport.
                        debug!(%peer, error = %err, "connection ended");
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

impl SseServer {
    /// Binds `addr` and serves until the future is dropped.
    pub async fn listen(self, addr: SocketAddr) -> TransportResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::network(format!("failed to bind {}: {}", addr, e)))?;
        run_server(self, listener).await
    }
}
