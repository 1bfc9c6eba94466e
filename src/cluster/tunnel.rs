//! Local listeners that make in-cluster services reachable
//!
//! Two mechanisms, both bound to `host:local_port`:
//!
//! 1. **Service proxy**: an HTTP server that replays each request against the
//!    API server's service proxy subresource.
//! 2. **Port-forward**: a TCP listener that opens one pod port-forward stream
//!    per accepted connection and copies bytes both ways.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::{ClusterError, SERVICE_PORT};

/// Largest request body replayed through the service proxy
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// How long `close` lets in-flight requests drain before aborting the server
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Connection-scoped headers that must not be copied across the proxy
const HOP_BY_HOP: [header::HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
];

/// A running tunnel; dropping it leaves the tunnel up until the parent token fires.
#[derive(Debug)]
pub struct TunnelHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    pub fn new(token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { token, task }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting connections and wait up to [`CLOSE_GRACE`] for the
    /// listener to exit
    pub async fn close(self) {
        self.close_within(CLOSE_GRACE).await
    }

    /// Like [`TunnelHandle::close`]; after `grace` the server task is aborted
    /// along with any request still in flight.
    pub async fn close_within(mut self, grace: Duration) {
        self.token.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Tunnel task ended abnormally"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs_f32(), "Tunnel did not drain in time, aborting");
                self.task.abort();
                let _ = (&mut self.task).await;
            }
        }
    }
}

pub async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, ClusterError> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| ClusterError::Bind {
            addr,
            reason: e.to_string(),
        })
}

/// Serve `router` on `listener` until `token` is cancelled
pub fn serve_router(listener: TcpListener, router: Router, token: CancellationToken) -> TunnelHandle {
    let shutdown = token.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            warn!(error = %e, "Tunnel server stopped");
        }
    });
    TunnelHandle::new(token, task)
}

// ============================================================================
// Service proxy
// ============================================================================

#[derive(Clone)]
struct ProxyState {
    client: Client,
    prefix: String,
}

/// API server path of a service's proxy subresource
pub fn service_proxy_prefix(namespace: &str, service: &str) -> String {
    format!(
        "/api/v1/namespaces/{}/services/{}:{}/proxy",
        namespace, service, SERVICE_PORT
    )
}

pub fn serve_service_proxy(
    client: Client,
    namespace: &str,
    service: &str,
    listener: TcpListener,
    token: CancellationToken,
) -> TunnelHandle {
    let state = ProxyState {
        client,
        prefix: service_proxy_prefix(namespace, service),
    };
    let router = Router::new()
        .fallback(forward_to_service)
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    serve_router(listener, router, token)
}

async fn forward_to_service(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("{}{}", state.prefix, path_and_query);

    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let mut builder = http::Request::builder().method(parts.method).uri(&target);
    if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let upstream = match builder.body(kube::client::Body::from(body.to_vec())) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    debug!(target = %target, "Proxying request to service");

    let response = match state.client.send(upstream).await {
        Ok(response) => response,
        Err(e) => return (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    };

    // Status and headers are copied; the body is streamed as it arrives
    let (mut head, body) = response.into_parts();
    head.headers = end_to_end_headers(&head.headers);
    Response::from_parts(head, Body::new(body))
}

/// `headers` without the connection-scoped ones
pub fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = headers.clone();
    for name in HOP_BY_HOP.iter() {
        kept.remove(name);
    }
    kept
}

// ============================================================================
// Port-forward
// ============================================================================

pub fn serve_port_forward(
    pods: Api<Pod>,
    pod_name: String,
    remote_port: u16,
    listener: TcpListener,
    token: CancellationToken,
) -> TunnelHandle {
    let accept_token = token.clone();
    let task = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = accept_token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept port-forward connection");
                    continue;
                }
            };
            debug!(peer = %peer, pod = %pod_name, "Port-forward connection accepted");

            let pods = pods.clone();
            let pod_name = pod_name.clone();
            let conn_token = accept_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = conn_token.cancelled() => {}
                    result = forward_connection(&pods, &pod_name, remote_port, socket) => {
                        if let Err(e) = result {
                            warn!(pod = %pod_name, error = %e, "Port-forward connection failed");
                        }
                    }
                }
            });
        }
    });
    TunnelHandle::new(token, task)
}

async fn forward_connection(
    pods: &Api<Pod>,
    pod_name: &str,
    port: u16,
    mut socket: TcpStream,
) -> Result<(), ClusterError> {
    let mut forwarder = pods.portforward(pod_name, &[port]).await?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| ClusterError::PortForward(format!("no stream for port {}", port)))?;

    tokio::io::copy_bidirectional(&mut socket, &mut upstream).await?;
    drop(upstream);

    forwarder
        .join()
        .await
        .map_err(|e| ClusterError::PortForward(e.to_string()))
}
