//! Instrumenting reverse proxy: forwards every request to a fixed upstream
//! and logs the resolved URL before the call goes out.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info};

/// Hop-by-hop headers dropped from relayed responses; relaying them would
/// introduce double-encoding and stale length mismatches.
const IGNORE_HEADERS: [&str; 4] = [
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Largest request body the proxy is willing to buffer for forwarding.
const MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    upstream_base: String,
    urls: Arc<Mutex<Vec<String>>>,
}

/// Long-lived reverse proxy for one experiment. Serves on its own tasks
/// between `start` and `stop`; the URL log is shared with the handler tasks
/// and consumed through the atomic [`ProxyServer::reset`].
pub struct ProxyServer {
    host: String,
    port: u16,
    upstream_base: String,
    urls: Arc<Mutex<Vec<String>>>,
    shutdown: Option<oneshot::Sender<()>>,
    serve_task: Option<JoinHandle<()>>,
}

impl ProxyServer {
    pub fn new(host: &str, port: u16, upstream_host: &str, upstream_port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            upstream_base: format!("http://{upstream_host}:{upstream_port}"),
            urls: Arc::new(Mutex::new(Vec::new())),
            shutdown: None,
            serve_task: None,
        }
    }

    /// Bind the listener and start serving. Called once per experiment;
    /// a bind failure is a fatal setup error.
    pub async fn start(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build proxy upstream client")?;
        let state = ProxyState {
            client,
            upstream_base: self.upstream_base.clone(),
            urls: Arc::clone(&self.urls),
        };
        let app = Router::new().fallback(proxy_request).with_state(state);

        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("failed to bind proxy to {}:{}", self.host, self.port))?;
        info!(
            "Proxy server: <http://{}:{}> to <{}>",
            self.host, self.port, self.upstream_base
        );

        let (shutdown, on_shutdown) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = on_shutdown.await;
            });
            if let Err(err) = serve.await {
                error!("Proxy server failed: {err}");
            }
        });
        self.shutdown = Some(shutdown);
        self.serve_task = Some(task);
        Ok(())
    }

    /// Stop serving and wait for the serve task to wind down.
    pub async fn stop(&mut self) {
        info!("Shutting down proxy server");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.serve_task.take() {
            if let Err(err) = task.await {
                error!("Proxy server task failed: {err}");
            }
        }
    }

    /// Atomically take the ordered URL log accumulated since the last reset
    /// and leave an empty one behind. The same lock serializes this against
    /// the handlers' record-on-forward writes, so no URL can end up in both
    /// capture windows or in neither.
    pub fn reset(&self) -> Vec<String> {
        let mut urls = self.urls.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *urls)
    }
}

async fn proxy_request(State(state): State<ProxyState>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
    let response = forward(&state, request, &path).await;
    debug!("Proxy {} {method:<7} {path}", response.status().as_u16());
    response
}

/// Forward one request to the fixed upstream. Every branch answers the
/// client; nothing is allowed to drop the connection unanswered.
async fn forward(state: &ProxyState, request: Request, path: &str) -> Response {
    let target_url = format!("{}{path}", state.upstream_base);
    {
        let mut urls = state.urls.lock().unwrap_or_else(PoisonError::into_inner);
        // Recorded before the call goes out: a failed upstream call counts.
        urls.push(target_url.clone());
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(err) => {
            error!("Failed to read request body for <{target_url}>: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut upstream_request = state.client.request(parts.method, &target_url);
    for (name, value) in &parts.headers {
        if name != header::HOST {
            upstream_request = upstream_request.header(name, value);
        }
    }
    if !body.is_empty() {
        upstream_request = upstream_request.body(body);
    }

    match upstream_request.send().await {
        // Upstream HTTP errors pass through with their original status.
        Ok(upstream) => relay(upstream),
        Err(err) if is_connection_failure(&err) => {
            error!("Upstream connection failed for <{target_url}>: {err}");
            StatusCode::BAD_GATEWAY.into_response()
        }
        Err(err) => {
            error!("Unexpected proxy failure for <{target_url}>: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Relay status, filtered headers, and a streamed body back to the caller.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if !IGNORE_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn is_connection_failure(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            );
        }
        source = inner.source();
    }
    false
}
