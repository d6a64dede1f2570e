//! Preview reverse proxy and debug hub.
//!
//! A second listener proxies everything to the current preview target
//! (default `http://localhost:{PREVIEW_TARGET_PORT}`), except the
//! `/__swe-swe-debug__/` namespace which it serves itself: the inject
//! script, the iframe and agent WebSockets, and target get/set. Proxied HTML
//! responses get the debug script injected after `<head>` (or `<body>`), a
//! loosened Content-Security-Policy, and cookies rescoped to the proxy's
//! origin. Upstream failures return a 502 page that retries on its own.

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Script tag inserted into proxied HTML.
pub const INJECT_TAG: &str = r#"<script src="/__swe-swe-debug__/inject.js"></script>"#;

const DEBUG_PREFIX: &str = "/__swe-swe-debug__";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

static INJECT_JS: &str = include_str!("assets/inject.js");

// ── Shared proxy state ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ProxyState {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    client: reqwest::Client,
    default_target: Url,
    /// User-set override; None means use the default.
    current_target: RwLock<Option<Url>>,
    hub: DebugHub,
}

impl ProxyState {
    pub fn new(target_port: u16) -> anyhow::Result<Self> {
        let default_target = Url::parse(&format!("http://localhost:{target_port}"))?;
        // The target is typically a local dev server with a self-signed cert;
        // verification is off and redirects are the browser's problem.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        Ok(Self {
            inner: Arc::new(ProxyInner {
                client,
                default_target,
                current_target: RwLock::new(None),
                hub: DebugHub::default(),
            }),
        })
    }

    pub fn target(&self) -> Url {
        self.inner
            .current_target
            .read()
            .expect("target lock")
            .clone()
            .unwrap_or_else(|| self.inner.default_target.clone())
    }

    pub fn set_target(&self, target: Option<Url>) {
        *self.inner.current_target.write().expect("target lock") = target;
    }
}

// ── Debug hub ─────────────────────────────────────────────────────────────────

/// Fan-out between injected iframe scripts and a single agent consumer:
/// iframe messages go to the agent verbatim, agent messages to every iframe.
#[derive(Default)]
pub struct DebugHub {
    inner: RwLock<HubInner>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    iframes: HashMap<u64, mpsc::UnboundedSender<Message>>,
    agent: Option<(u64, mpsc::UnboundedSender<Message>)>,
}

impl DebugHub {
    fn add_iframe(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let mut inner = self.inner.write().expect("hub lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.iframes.insert(id, tx);
        id
    }

    fn remove_iframe(&self, id: u64) {
        self.inner.write().expect("hub lock").iframes.remove(&id);
    }

    /// Install the agent connection, closing any previous one.
    fn set_agent(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let mut inner = self.inner.write().expect("hub lock");
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some((_, old)) = inner.agent.replace((id, tx)) {
            let _ = old.send(Message::Close(None));
        }
        id
    }

    fn clear_agent(&self, id: u64) {
        let mut inner = self.inner.write().expect("hub lock");
        if inner.agent.as_ref().is_some_and(|(aid, _)| *aid == id) {
            inner.agent = None;
        }
    }

    fn to_agent(&self, msg: Message) {
        let inner = self.inner.read().expect("hub lock");
        if let Some((_, tx)) = &inner.agent {
            let _ = tx.send(msg);
        }
    }

    fn to_iframes(&self, msg: Message) {
        let inner = self.inner.read().expect("hub lock");
        for tx in inner.iframes.values() {
            let _ = tx.send(msg.clone());
        }
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Run the preview proxy listener. Only called when `PREVIEW_TARGET_PORT`
/// is configured.
pub async fn run_preview_proxy(port: u16, target_port: u16) -> anyhow::Result<()> {
    let state = ProxyState::new(target_port)?;
    let app = Router::new()
        .route(&format!("{DEBUG_PREFIX}/inject.js"), get(inject_js_handler))
        .route(&format!("{DEBUG_PREFIX}/ws"), get(iframe_ws_handler))
        .route(&format!("{DEBUG_PREFIX}/agent"), get(agent_ws_handler))
        .route(
            &format!("{DEBUG_PREFIX}/target"),
            get(get_target_handler).post(set_target_handler),
        )
        .fallback(any(proxy_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("preview proxy listening on http://{addr} -> localhost:{target_port}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn inject_js_handler() -> Response {
    (
        [("Content-Type", "application/javascript; charset=utf-8")],
        INJECT_JS,
    )
        .into_response()
}

async fn get_target_handler(State(state): State<ProxyState>) -> Response {
    axum::Json(serde_json::json!({
        "target": state.target().to_string(),
        "default": state.inner.default_target.to_string(),
    }))
    .into_response()
}

/// POST body is the new target URL, either plain text or `{"target": "..."}`.
/// Empty resets to the default; only http/https schemes are accepted.
async fn set_target_handler(State(state): State<ProxyState>, body: String) -> Response {
    let raw = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("target").and_then(|t| t.as_str()).map(String::from))
        .unwrap_or(body);
    let raw = raw.trim();
    if raw.is_empty() {
        state.set_target(None);
        return get_target_handler(State(state)).await;
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            log::info!("preview target set to {url}");
            state.set_target(Some(url));
            get_target_handler(State(state)).await
        }
        Ok(url) => (
            StatusCode::BAD_REQUEST,
            format!("unsupported scheme {}", url.scheme()),
        )
            .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, format!("invalid URL: {e}")).into_response(),
    }
}

// ── Iframe / agent WebSockets ────────────────────────────────────────────────

async fn iframe_ws_handler(State(state): State<ProxyState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_iframe_socket(state, socket))
}

async fn handle_iframe_socket(state: ProxyState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = state.inner.hub.add_iframe(tx);

    let writer = async {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };
    let hub = &state.inner.hub;
    let reader = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(_) | Message::Binary(_) => hub.to_agent(msg),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };
    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
    state.inner.hub.remove_iframe(id);
}

async fn agent_ws_handler(State(state): State<ProxyState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(state, socket))
}

async fn handle_agent_socket(state: ProxyState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = state.inner.hub.set_agent(tx);

    let writer = async {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    };
    let hub = &state.inner.hub;
    let reader = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(_) | Message::Binary(_) => hub.to_iframes(msg),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };
    tokio::select! {
        () = writer => {}
        () = reader => {}
    }
    state.inner.hub.clear_agent(id);
}

// ── Proxying ──────────────────────────────────────────────────────────────────

async fn proxy_handler(State(state): State<ProxyState>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();
    if wants_websocket(&parts.headers) {
        match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => {
                let target = state.target();
                let path_query = parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| "/".to_string());
                return ws.on_upgrade(move |socket| relay_websocket(socket, target, path_query));
            }
            Err(rejection) => return rejection.into_response(),
        }
    }
    let req = Request::from_parts(parts, body);
    match forward_http(&state, req).await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("preview proxy upstream error: {e}");
            bad_gateway_response(&e)
        }
    }
}

fn wants_websocket(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn forward_http(state: &ProxyState, req: Request) -> anyhow::Result<Response> {
    let target = state.target();
    let path_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}://{}{}",
        target.scheme(),
        target.authority(),
        path_query
    );

    let accepts_html = req
        .headers()
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/html"));

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())?;
    let mut upstream = state.inner.client.request(method, &url);
    for (name, value) in req.headers() {
        let name_str = name.as_str();
        // Host is rewritten to the target; hop-by-hop headers never forward.
        if name_str.eq_ignore_ascii_case("host") || is_hop_by_hop_header(name_str) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            upstream = upstream.header(name_str, v);
        }
    }
    let body_bytes = axum::body::to_bytes(req.into_body(), usize::MAX).await?;
    if !body_bytes.is_empty() {
        upstream = upstream.body(body_bytes);
    }

    let resp = match upstream.send().await {
        Ok(r) => r,
        Err(e) => {
            log::warn!("preview proxy {url}: {e}");
            return Ok(if accepts_html {
                bad_gateway_response(&anyhow::anyhow!(e))
            } else {
                (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response()
            });
        }
    };

    let status = resp.status().as_u16();
    let mut headers = Vec::new();
    let mut content_type = String::new();
    let mut content_encoding = String::new();
    let mut csp: Option<String> = None;
    for (name, value) in resp.headers() {
        let name_str = name.as_str();
        if is_hop_by_hop_header(name_str) {
            continue;
        }
        let Ok(value_str) = value.to_str() else {
            continue;
        };
        match name_str.to_ascii_lowercase().as_str() {
            "content-type" => content_type = value_str.to_string(),
            "content-encoding" => content_encoding = value_str.to_ascii_lowercase(),
            "content-security-policy" => {
                csp = Some(value_str.to_string());
                continue;
            }
            "set-cookie" => {
                headers.push(("set-cookie".to_string(), rewrite_set_cookie(value_str)));
                continue;
            }
            _ => {}
        }
        headers.push((name_str.to_string(), value_str.to_string()));
    }

    let is_html = content_type.to_ascii_lowercase().starts_with("text/html");
    // gzip is decoded for injection; anything else (br, zstd) passes through
    // untouched along with its Content-Encoding.
    let injectable = is_html && (content_encoding.is_empty() || content_encoding == "gzip");

    let mut builder = Response::builder().status(status);
    if !injectable {
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(csp) = csp {
            builder = builder.header("content-security-policy", csp);
        }
        let stream = resp.bytes_stream().map(|r| {
            r.map_err(|e| std::io::Error::other(e.to_string()))
        });
        return Ok(builder.body(Body::from_stream(stream))?);
    }

    let raw = resp.bytes().await?;
    let decoded = if content_encoding == "gzip" {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(raw.as_ref()).read_to_end(&mut out)?;
        out
    } else {
        raw.to_vec()
    };
    let injected = inject_debug_script(&decoded);

    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" || lower == "content-encoding" {
            continue;
        }
        builder = builder.header(name, value);
    }
    if let Some(csp) = csp {
        builder = builder.header("content-security-policy", modify_csp_header(&csp));
    }
    builder = builder.header("content-length", injected.len());
    Ok(builder.body(Body::from(injected))?)
}

/// Relay a browser WebSocket to the same path on the preview target, both
/// directions, until either side closes. The upstream leg disables TLS
/// verification like the HTTP leg.
async fn relay_websocket(client: WebSocket, target: Url, path_query: String) {
    let scheme = if target.scheme() == "https" { "wss" } else { "ws" };
    let upstream_url = format!(
        "{scheme}://{}{path_query}",
        target.authority()
    );

    let connector = tokio_tungstenite::Connector::Rustls(Arc::new(no_verify_tls_config()));
    let upstream = tokio_tungstenite::connect_async_tls_with_config(
        upstream_url.as_str(),
        None,
        false,
        Some(connector),
    )
    .await;
    let (upstream, _) = match upstream {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("preview ws {upstream_url}: {e}");
            return;
        }
    };

    use tokio_tungstenite::tungstenite::Message as Upstream;
    let (mut up_tx, mut up_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let mapped = match msg {
                Message::Text(t) => Upstream::text(t.to_string()),
                Message::Binary(b) => Upstream::binary(b),
                Message::Ping(p) => Upstream::Ping(p.to_vec().into()),
                Message::Pong(p) => Upstream::Pong(p.to_vec().into()),
                Message::Close(_) => break,
            };
            if up_tx.send(mapped).await.is_err() {
                break;
            }
        }
        let _ = up_tx.send(Upstream::Close(None)).await;
    };
    let upstream_to_client = async {
        while let Some(Ok(msg)) = up_rx.next().await {
            let mapped = match msg {
                Upstream::Text(t) => Message::Text(t.to_string().into()),
                Upstream::Binary(b) => Message::Binary(Bytes::from(b)),
                Upstream::Ping(p) => Message::Ping(Bytes::from(p)),
                Upstream::Pong(p) => Message::Pong(Bytes::from(p)),
                Upstream::Close(_) => break,
                Upstream::Frame(_) => continue,
            };
            if client_tx.send(mapped).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(Message::Close(None)).await;
    };
    tokio::select! {
        () = client_to_upstream => {}
        () = upstream_to_client => {}
    }
}

/// rustls config that accepts any server certificate, mirroring the HTTP
/// client's disabled verification for local self-signed dev servers.
fn no_verify_tls_config() -> rustls::ClientConfig {
    #[derive(Debug)]
    struct NoVerify;

    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth()
}

fn bad_gateway_response(err: &anyhow::Error) -> Response {
    let html = crate::pages::proxy_error_page(&err.to_string());
    (
        StatusCode::BAD_GATEWAY,
        [("Content-Type", "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

// ── Header and body rewriting ─────────────────────────────────────────────────

/// Headers that describe a single hop and must not be forwarded.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Strip `Domain` and `Secure` so the cookie binds to the proxy's origin.
pub fn rewrite_set_cookie(value: &str) -> String {
    value
        .split(';')
        .map(str::trim)
        .filter(|attr| {
            let lower = attr.to_ascii_lowercase();
            lower != "secure" && !lower.starts_with("domain=")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn head_tag() -> &'static regex::bytes::Regex {
    static RE: OnceLock<regex::bytes::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::bytes::Regex::new(r"(?i)<head[^>]*>").expect("head regex"))
}

fn body_tag() -> &'static regex::bytes::Regex {
    static RE: OnceLock<regex::bytes::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::bytes::Regex::new(r"(?i)<body[^>]*>").expect("body regex"))
}

/// Insert the inject-script tag right after the first `<head...>` or, with
/// no head, the first `<body...>`. Documents with neither pass unchanged.
pub fn inject_debug_script(html: &[u8]) -> Vec<u8> {
    let insert_at = head_tag()
        .find(html)
        .or_else(|| body_tag().find(html))
        .map(|m| m.end());
    match insert_at {
        Some(pos) => {
            let mut out = Vec::with_capacity(html.len() + INJECT_TAG.len());
            out.extend_from_slice(&html[..pos]);
            out.extend_from_slice(INJECT_TAG.as_bytes());
            out.extend_from_slice(&html[pos..]);
            out
        }
        None => html.to_vec(),
    }
}

/// Loosen a Content-Security-Policy so the injected script and its WebSocket
/// are allowed: `'self'` joins `script-src` (directive added if missing) and
/// `ws: wss:` join `connect-src`. Empty input stays empty.
pub fn modify_csp_header(value: &str) -> String {
    if value.trim().is_empty() {
        return String::new();
    }
    let mut out: Vec<String> = Vec::new();
    let mut has_script_src = false;
    let mut has_connect_src = false;
    for directive in value.split(';') {
        let directive = directive.trim();
        if directive.is_empty() {
            continue;
        }
        let mut parts = directive.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or("").trim();
        match name.to_ascii_lowercase().as_str() {
            "script-src" => {
                has_script_src = true;
                if rest.split_whitespace().any(|s| s == "'self'") {
                    out.push(directive.to_string());
                } else if rest.is_empty() {
                    out.push("script-src 'self'".to_string());
                } else {
                    out.push(format!("script-src 'self' {rest}"));
                }
            }
            "connect-src" => {
                has_connect_src = true;
                if rest.is_empty() {
                    out.push("connect-src ws: wss:".to_string());
                } else {
                    out.push(format!("connect-src {rest} ws: wss:"));
                }
            }
            _ => out.push(directive.to_string()),
        }
    }
    if !has_script_src {
        out.push("script-src 'self'".to_string());
    }
    if !has_connect_src {
        out.push("connect-src ws: wss:".to_string());
    }
    out.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(is_hop_by_hop_header("UPGRADE"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Set-Cookie"));
    }

    #[test]
    fn cookie_loses_domain_and_secure() {
        assert_eq!(
            rewrite_set_cookie("sid=abc; Domain=.example.com; Secure; HttpOnly; Path=/"),
            "sid=abc; HttpOnly; Path=/"
        );
        assert_eq!(rewrite_set_cookie("plain=1"), "plain=1");
    }

    #[test]
    fn inject_after_head() {
        let html = b"<html><head></head></html>";
        let out = inject_debug_script(html);
        assert_eq!(
            out,
            format!("<html><head>{INJECT_TAG}</head></html>").as_bytes()
        );
    }

    #[test]
    fn inject_after_head_with_attributes_case_insensitive() {
        let html = b"<HTML><HEAD lang=\"en\"><title>T</title></HEAD></HTML>";
        let out = String::from_utf8(inject_debug_script(html)).unwrap();
        assert!(out.starts_with(&format!("<HTML><HEAD lang=\"en\">{INJECT_TAG}")));
    }

    #[test]
    fn inject_falls_back_to_body() {
        let html = b"<html><body class=\"x\"><p>hi</p></body></html>";
        let out = String::from_utf8(inject_debug_script(html)).unwrap();
        assert!(out.contains(&format!("<body class=\"x\">{INJECT_TAG}<p>hi</p>")));
    }

    #[test]
    fn inject_leaves_headless_bodyless_alone() {
        let html = b"{\"not\": \"html\"}";
        assert_eq!(inject_debug_script(html), html.to_vec());
    }

    #[test]
    fn inject_only_first_head() {
        let html = b"<head></head><head></head>";
        let out = String::from_utf8(inject_debug_script(html)).unwrap();
        assert_eq!(out.matches(INJECT_TAG).count(), 1);
        assert!(out.starts_with(&format!("<head>{INJECT_TAG}")));
    }

    #[test]
    fn csp_gains_self_and_websockets() {
        assert_eq!(
            modify_csp_header("script-src 'unsafe-inline'"),
            "script-src 'self' 'unsafe-inline'; connect-src ws: wss:"
        );
    }

    #[test]
    fn csp_empty_stays_empty() {
        assert_eq!(modify_csp_header(""), "");
        assert_eq!(modify_csp_header("   "), "");
    }

    #[test]
    fn csp_adds_missing_directives() {
        assert_eq!(
            modify_csp_header("default-src 'none'"),
            "default-src 'none'; script-src 'self'; connect-src ws: wss:"
        );
    }

    #[test]
    fn csp_extends_existing_connect_src() {
        assert_eq!(
            modify_csp_header("connect-src https://api.example.com"),
            "connect-src https://api.example.com ws: wss:; script-src 'self'"
        );
    }

    #[test]
    fn csp_does_not_duplicate_self() {
        assert_eq!(
            modify_csp_header("script-src 'self' https://cdn"),
            "script-src 'self' https://cdn; connect-src ws: wss:"
        );
    }

    #[test]
    fn target_defaults_and_overrides() {
        let state = ProxyState::new(3000).unwrap();
        assert_eq!(state.target().to_string(), "http://localhost:3000/");
        state.set_target(Some(Url::parse("http://localhost:5173").unwrap()));
        assert_eq!(state.target().to_string(), "http://localhost:5173/");
        state.set_target(None);
        assert_eq!(state.target().to_string(), "http://localhost:3000/");
    }

    #[test]
    fn gzip_html_roundtrip_through_injection() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let html = b"<!DOCTYPE html><html><head><title>T</title></head><body></body></html>";
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(html).unwrap();
        let gz = enc.finish().unwrap();

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&gz[..])
            .read_to_end(&mut decoded)
            .unwrap();
        let injected = inject_debug_script(&decoded);
        let text = String::from_utf8(injected).unwrap();
        assert!(text.contains(&format!("<head>{INJECT_TAG}<title>T</title>")));
    }
}
