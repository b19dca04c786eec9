//! HTTP surface
//!
//! Serves `/`, `/metrics` and `/health`. The metrics body is whatever
//! rendered snapshot the pipeline delivered last; the server never touches
//! DCGM itself. TLS and basic auth follow the Prometheus web config file
//! format, and the listener can come from systemd socket activation.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::{ExporterError, Result};

/// Per-request deadline, covering handler plus response write.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const INDEX_PAGE: &str = "<html>\
<head><title>GPU Exporter</title></head>\
<body><h1>GPU Exporter</h1><p><a href=\"/metrics\">Metrics</a></p></body>\
</html>";

/// Prometheus-style web configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebConfig {
    pub tls_server_config: Option<TlsServerConfig>,
    #[serde(default)]
    pub basic_auth_users: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsServerConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl WebConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| ExporterError::Config(format!("web config {}: {e}", path.display())))?;
        raw.try_deserialize()
            .map_err(|e| ExporterError::Config(format!("web config {}: {e}", path.display())))
    }
}

/// Latest rendered snapshot, shared between consumer and handlers.
#[derive(Clone, Default)]
pub struct MetricsState {
    latest: Arc<Mutex<Option<String>>>,
}

impl MetricsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, text: String) {
        *self.latest.lock().await = Some(text);
    }

    pub async fn latest(&self) -> Option<String> {
        self.latest.lock().await.clone()
    }
}

/// Consumer half of the pipeline channel: keep only the newest snapshot.
pub async fn consume_snapshots(
    state: MetricsState,
    mut snapshot_rx: mpsc::Receiver<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            received = snapshot_rx.recv() => {
                match received {
                    Some(text) => state.publish(text).await,
                    None => break,
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Prometheus text exposition format, version 0.0.4.
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

async fn metrics(State(state): State<MetricsState>) -> Response {
    let body = state.latest().await.unwrap_or_default();
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body).into_response()
}

async fn health(State(state): State<MetricsState>) -> Response {
    if state.latest().await.is_some() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "KO").into_response()
    }
}

async fn request_timeout(request: Request, next: Next) -> Response {
    match tokio::time::timeout(HTTP_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

async fn basic_auth(
    State(users): State<Arc<HashMap<String, String>>>,
    request: Request,
    next: Next,
) -> Response {
    if authorized(request.headers().get(header::AUTHORIZATION), &users) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics\"")],
            "Unauthorized",
        )
            .into_response()
    }
}

fn authorized(header: Option<&header::HeaderValue>, users: &HashMap<String, String>) -> bool {
    let Some(value) = header.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    use base64::Engine;
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = credentials.split_once(':') else {
        return false;
    };
    match users.get(user) {
        Some(hash) => bcrypt::verify(password, hash).unwrap_or(false),
        None => false,
    }
}

/// Build the router, with basic auth in front when users are configured.
pub fn create_router(state: MetricsState, auth_users: Option<Arc<HashMap<String, String>>>) -> Router {
    let mut router = Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state);
    if let Some(users) = auth_users {
        router = router.layer(middleware::from_fn_with_state(users, basic_auth));
    }
    router.layer(middleware::from_fn(request_timeout))
}

/// How the listener and its security wrappers are set up.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// `host:port`, or `:port` for all interfaces.
    pub address: String,
    pub web_config_path: Option<PathBuf>,
    pub systemd_socket: bool,
}

/// Run the HTTP server until shutdown.
pub async fn serve(
    options: ServerOptions,
    state: MetricsState,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let web_config = match &options.web_config_path {
        Some(path) => WebConfig::load(path)?,
        None => WebConfig::default(),
    };
    let auth_users = if web_config.basic_auth_users.is_empty() {
        None
    } else {
        Some(Arc::new(web_config.basic_auth_users.clone()))
    };
    let app = create_router(state, auth_users);

    let listener = if options.systemd_socket {
        let listener = systemd_listener()?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ExporterError::Config(format!("systemd socket: {e}")))?;
        TcpListener::from_std(listener)
            .map_err(|e| ExporterError::Config(format!("systemd socket: {e}")))?
    } else {
        let address = listen_address(&options.address);
        TcpListener::bind(&address)
            .await
            .map_err(|e| ExporterError::Config(format!("bind {address}: {e}")))?
    };
    info!(
        address = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        tls = web_config.tls_server_config.is_some(),
        "HTTP server listening"
    );

    match web_config.tls_server_config {
        Some(tls) => serve_tls(listener, app, &tls, shutdown).await,
        None => {
            let mut shutdown = shutdown;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
                .map_err(|e| ExporterError::Config(format!("HTTP server: {e}")))
        }
    }
}

// TLS records open with the handshake content type; anything else on the
// TLS listener is a plaintext client.
const TLS_HANDSHAKE_BYTE: u8 = 0x16;

const PLAIN_HTTP_REJECTION: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Answer a plaintext request on the TLS listener with a 400 and close.
async fn reject_plain_http<S>(stream: &mut S)
where
    S: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let _ = stream.write_all(PLAIN_HTTP_REJECTION).await;
    let _ = stream.shutdown().await;
}

/// TLS accept loop: handshake per connection, then hand the stream to the
/// router. Handshake failures only cost the one connection.
async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: &TlsServerConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let acceptor = tls_acceptor(tls)?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, peer) = match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let mut first = [0u8; 1];
                    match stream.peek(&mut first).await {
                        Ok(n) if n > 0 && first[0] != TLS_HANDSHAKE_BYTE => {
                            debug!(peer = %peer, "plaintext request on the TLS listener");
                            reject_plain_http(&mut stream).await;
                            return;
                        }
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "peek failed");
                            return;
                        }
                        _ => {}
                    }
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = TowerToHyperService::new(app);
                    let builder =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    if let Err(e) = builder
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        // Peers closing mid-response land here; never fatal.
                        debug!(peer = %peer, error = %e, "connection closed with error");
                    }
                });
            }
            _ = shutdown.recv() => break,
        }
    }
    Ok(())
}

fn tls_acceptor(tls: &TlsServerConfig) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut open_pem(&tls.cert_file)?)
        .map_err(|e| ExporterError::Config(format!("cert {}: {e}", tls.cert_file.display())))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open_pem(&tls.key_file)?)
        .map_err(|e| ExporterError::Config(format!("key {}: {e}", tls.key_file.display())))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open_pem(&tls.key_file)?)
            .map_err(|e| ExporterError::Config(format!("key {}: {e}", tls.key_file.display())))?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| {
            ExporterError::Config(format!("no private key in {}", tls.key_file.display()))
        })?;
    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ExporterError::Config(format!("TLS config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ExporterError::Config(format!("{}: {e}", path.display())))
}

/// Expand the `:port` shorthand to an all-interfaces bind.
fn listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// Adopt the socket a systemd `.socket` unit passed to this process.
fn systemd_listener() -> Result<std::net::TcpListener> {
    use std::os::fd::FromRawFd;

    // First passed fd sits right after stderr.
    const SD_LISTEN_FDS_START: i32 = 3;

    let pid = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<i32>().ok());
    let fds = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse::<i32>().ok());
    match (pid, fds) {
        (Some(pid), Some(fds)) if pid == unsafe { libc::getpid() } && fds >= 1 => {
            // Safety: systemd owns this fd and passed it to us; nothing else
            // in the process has adopted it.
            Ok(unsafe { std::net::TcpListener::from_raw_fd(SD_LISTEN_FDS_START) })
        }
        _ => Err(ExporterError::Config(
            "systemd socket activation requested but no socket was passed".to_string(),
        )),
    }
}
