use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{
        FromRequestParts, State,
        ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;

use crate::injector::{HtmlInjector, ScriptConfig};
use crate::static_assets::{HEARTBEAT_SCRIPT, LOADING_PAGE, NAVIGATION_SCRIPT, StaticAssets};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stale caches are the dominant source of confusion during active
/// development, so every proxied response gets the full no-cache treatment.
const CACHE_BUSTING: &str = "no-store, no-cache, must-revalidate, proxy-revalidate, max-age=0";

/// Reverse proxy in front of one project's dev server.
///
/// Listens on the stable public port and forwards to the per-restart
/// upstream port. While `loading` is set, HTML navigations get a cached
/// placeholder page and asset requests get 503 + Retry-After.
pub struct ProxyServer {
    listen_port: u16,
    upstream_port: u16,
    loading: AtomicBool,
    assets: StaticAssets,
    client: reqwest::Client,
    shutdown: Notify,
    serve_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(listen_port: u16, upstream_port: u16) -> Arc<Self> {
        Arc::new(Self {
            listen_port,
            upstream_port,
            loading: AtomicBool::new(false),
            assets: StaticAssets::preloaded(),
            client: reqwest::Client::new(),
            shutdown: Notify::new(),
            serve_task: StdMutex::new(None),
        })
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Bind and serve in a background task. Errors (e.g. the public port is
    /// taken) are logged; the orchestrator's readiness probe is what decides
    /// whether the restart as a whole succeeded.
    pub fn spawn(self: &Arc<Self>) {
        let task = tokio::spawn(self.clone().serve());
        *self.serve_task.lock().expect("serve task slot poisoned") = Some(task);
    }

    async fn serve(self: Arc<Self>) {
        let port = self.listen_port;
        if let Err(e) = self.run().await {
            tracing::error!(error = %e, port, "proxy server error");
        }
    }

    /// Blocks serving until `stop` is called.
    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.listen_port))
            .await
            .with_context(|| format!("bind proxy port {}", self.listen_port))?;
        tracing::info!(
            port = self.listen_port,
            upstream = self.upstream_port,
            "reverse proxy listening"
        );

        let app = Router::new().fallback(handle).with_state(self.clone());
        let shutdown = self.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.shutdown.notified().await })
            .await?;
        Ok(())
    }

    /// Graceful shutdown with a deadline, then force-close.
    pub async fn stop(&self) {
        self.shutdown.notify_one();
        let task = self.serve_task.lock().expect("serve task slot poisoned").take();
        if let Some(mut task) = task
            && tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err()
        {
            tracing::warn!(port = self.listen_port, "graceful proxy shutdown timed out, aborting");
            task.abort();
        }
    }

    fn loading_response(&self, req: &axum::http::request::Parts) -> Response {
        let accept = req
            .headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if loading_wants_html(&accept, req.uri.path()) {
            match self.assets.get(LOADING_PAGE) {
                Some(content) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/html")],
                    content.as_ref().clone(),
                )
                    .into_response(),
                None => {
                    tracing::error!("loading.html is missing from the static directory");
                    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
                }
            }
        } else {
            // Assets should fail fast and retry rather than be served as HTML.
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [
                    (header::RETRY_AFTER, "2"),
                    (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
                ],
                "Service Unavailable - Server is restarting",
            )
                .into_response()
        }
    }

    async fn proxy_websocket(&self, req: Request<Body>) -> Response {
        let uri = request_uri(&req);
        let upstream_url = format!("ws://localhost:{}{}", self.upstream_port, uri);

        let (mut parts, _body) = req.into_parts();
        let upgrade =
            <WebSocketUpgrade as FromRequestParts<()>>::from_request_parts(&mut parts, &()).await;
        let ws = match upgrade {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };

        let upstream = match tokio_tungstenite::connect_async(upstream_url.as_str()).await {
            Ok((upstream, _)) => upstream,
            Err(e) => {
                tracing::warn!(error = %e, "websocket upstream connect failed");
                return (StatusCode::SERVICE_UNAVAILABLE, "Could not connect to app server")
                    .into_response();
            }
        };

        ws.on_upgrade(move |client| relay_websocket(client, upstream))
    }

    async fn proxy_http(&self, req: Request<Body>) -> Response {
        let uri = request_uri(&req);
        let url = format!("http://localhost:{}{}", self.upstream_port, uri);
        let (parts, body) = req.into_parts();

        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
            }
        };

        let mut request_headers = parts.headers.clone();
        // The client stack derives these from the upstream URL and body.
        request_headers.remove(header::HOST);
        request_headers.remove(header::CONTENT_LENGTH);

        let upstream_response = match self
            .client
            .request(parts.method.clone(), &url)
            .headers(request_headers)
            .body(body_bytes)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(error = %e, url = %url, "failed to proxy request to app server");
                return (StatusCode::SERVICE_UNAVAILABLE, "App server unavailable").into_response();
            }
        };

        let status = upstream_response.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream_response.headers() {
            if should_copy_response_header(name.as_str()) {
                response_headers.append(name.clone(), value.clone());
            }
        }
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_BUSTING));
        response_headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        response_headers.insert(header::EXPIRES, HeaderValue::from_static("0"));

        let is_html = upstream_response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));

        let body = match upstream_response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read upstream response body");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
            }
        };

        let body = if is_html {
            match self.inject_observer_scripts(&body) {
                Ok(injected) => Body::from(injected),
                Err(e) => {
                    // Serve the original document rather than break the page.
                    tracing::warn!(error = %e, "html injection failed");
                    Body::from(body)
                }
            }
        } else {
            Body::from(body)
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    /// Heartbeat first, navigation second; both prepend, so the navigation
    /// script ends up as the very first child of `<head>`.
    fn inject_observer_scripts(&self, body: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut injector = HtmlInjector::new();
        for script in [HEARTBEAT_SCRIPT, NAVIGATION_SCRIPT] {
            match self.assets.get(script) {
                Some(content) => injector.add_script(ScriptConfig {
                    content: String::from_utf8_lossy(&content).into_owned(),
                    insert_first: true,
                    ..Default::default()
                }),
                None => tracing::warn!(script, "observer script missing, skipping injection"),
            }
        }
        injector.inject(body)
    }
}

async fn handle(State(proxy): State<Arc<ProxyServer>>, req: Request<Body>) -> Response {
    let mut response = dispatch(&proxy, req).await;
    apply_cors(response.headers_mut());
    response
}

async fn dispatch(proxy: &ProxyServer, req: Request<Body>) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }

    if proxy.is_loading() {
        let (parts, _body) = req.into_parts();
        return proxy.loading_response(&parts);
    }

    if is_websocket_upgrade(req.headers()) {
        return proxy.proxy_websocket(req).await;
    }

    proxy.proxy_http(req).await
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Accept, Authorization, Content-Type, Upgrade, Connection"),
    );
}

fn request_uri(req: &Request<Body>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

fn header_value_lowercase(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_value_lowercase(headers, header::UPGRADE) == "websocket"
        && header_value_lowercase(headers, header::CONNECTION) == "upgrade"
}

/// HTML navigations get the placeholder; anything that looks like an asset
/// request (a dotted final path segment without an HTML Accept) gets 503.
fn loading_wants_html(accept: &str, path: &str) -> bool {
    let last_segment = path.rsplit('/').next().unwrap_or("");
    accept.contains("text/html") || !last_segment.contains('.') || path.ends_with('/')
}

fn should_copy_response_header(name: &str) -> bool {
    // Content-Length is recomputed by the writer; the cache trio is
    // overridden below; the framing headers belong to each hop.
    !matches!(
        name,
        "content-length" | "cache-control" | "etag" | "last-modified" | "transfer-encoding"
            | "connection"
    )
}

async fn relay_websocket(
    client: WebSocket,
    upstream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            if upstream_tx.send(client_to_upstream_message(msg)).await.is_err() {
                break;
            }
        }
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = upstream_to_client_message(msg) else {
                continue;
            };
            if client_tx.send(msg).await.is_err() {
                break;
            }
        }
    };

    // Either side closing tears down the whole bridge.
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

fn client_to_upstream_message(msg: ClientMessage) -> UpstreamMessage {
    match msg {
        ClientMessage::Text(text) => UpstreamMessage::Text(text.as_str().into()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(frame) => UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        })),
    }
}

fn upstream_to_client_message(msg: UpstreamMessage) -> Option<ClientMessage> {
    match msg {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.as_str().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| ClientCloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().into(),
        }))),
        // Raw frames never surface from a read without manual frame mode.
        UpstreamMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_navigation_requests_get_the_placeholder() {
        assert!(loading_wants_html("text/html,application/xhtml+xml", "/assets/app.css"));
        assert!(loading_wants_html("", "/"));
        assert!(loading_wants_html("", "/dashboard"));
        assert!(loading_wants_html("*/*", "/nested/route/"));
    }

    #[test]
    fn asset_requests_are_rejected_while_loading() {
        assert!(!loading_wants_html("*/*", "/assets/app.css"));
        assert!(!loading_wants_html("", "/favicon.ico"));
    }

    #[test]
    fn websocket_upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        assert!(is_websocket_upgrade(&headers));

        headers.remove(header::CONNECTION);
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn cache_and_length_headers_are_never_copied() {
        for name in ["content-length", "cache-control", "etag", "last-modified"] {
            assert!(!should_copy_response_header(name));
        }
        assert!(should_copy_response_header("content-type"));
        assert!(should_copy_response_header("x-powered-by"));
    }
}
