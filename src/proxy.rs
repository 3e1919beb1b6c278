//! HTTP and HTTPS listeners and the host router.
//!
//! The same server type runs in two modes. Without TLS it serves ACME
//! HTTP-01 challenges and redirects everything else to HTTPS. With TLS it
//! terminates connections using the SNI resolver and routes each request
//! by its Host header: hostname → domain → project → live process handle,
//! then relays the request to the backend over its Unix socket, websocket
//! upgrades included.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::acme::CertManager;
use crate::db::{DomainStore, ProjectStore};
use crate::error::{json_error_response, RouteErrorCode};
use crate::process::Supervisor;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS.
const MAX_HOSTNAME_LEN: usize = 253;

/// Resolves a request host to the backend socket it should reach.
pub struct Router {
    domains: Arc<DomainStore>,
    projects: Arc<ProjectStore>,
    supervisor: Arc<Supervisor>,
}

/// A successful route: the project and the socket to dial.
#[derive(Debug)]
pub struct Route {
    pub project_id: Uuid,
    pub socket_path: PathBuf,
}

impl Router {
    pub fn new(
        domains: Arc<DomainStore>,
        projects: Arc<ProjectStore>,
        supervisor: Arc<Supervisor>,
    ) -> Arc<Self> {
        Arc::new(Self { domains, projects, supervisor })
    }

    /// Hostname → domain → project → handle. Each missing link maps to
    /// its own status: no domain 404, no project 502, no live handle 503.
    pub fn resolve(&self, hostname: &str) -> Result<Route, (RouteErrorCode, String)> {
        let domain = self.domains.get_by_hostname(hostname).ok_or_else(|| {
            (RouteErrorCode::UnknownHost, format!("no domain for {hostname}"))
        })?;
        let project = self.projects.get(domain.project_id).ok_or_else(|| {
            (
                RouteErrorCode::ProjectMissing,
                format!("domain {hostname} references a missing project"),
            )
        })?;
        let socket_path = self.supervisor.socket_for(project.id).ok_or_else(|| {
            (
                RouteErrorCode::BackendNotRunning,
                format!("backend for {hostname} is not running"),
            )
        })?;
        Ok(Route { project_id: project.id, socket_path })
    }
}

/// A public-facing listener, HTTP or HTTPS depending on configuration.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Arc<Router>,
    cert_manager: Arc<CertManager>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
    /// HTTPS port advertised in redirects, None disables the redirect.
    https_redirect_port: Option<u16>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        router: Arc<Router>,
        cert_manager: Arc<CertManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            router,
            cert_manager,
            shutdown_rx,
            tls_acceptor: None,
            https_redirect_port: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_https_redirect(mut self, port: u16) -> Self {
        self.https_redirect_port = Some(port);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %self.bind_addr, protocol, "listener up");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            let cert_manager = Arc::clone(&self.cert_manager);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let https_redirect_port = self.https_redirect_port;

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = serve_connection(
                                                tls_stream, addr, router, cert_manager, true, None,
                                            ).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = serve_connection(
                                    stream, addr, router, cert_manager, false, https_redirect_port,
                                ).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %self.bind_addr, "listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    router: Arc<Router>,
    cert_manager: Arc<CertManager>,
    is_tls: bool,
    https_redirect_port: Option<u16>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        let cert_manager = Arc::clone(&cert_manager);
        async move { handle_request(req, router, cert_manager, addr, is_tls, https_redirect_port).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    router: Arc<Router>,
    cert_manager: Arc<CertManager>,
    client_addr: SocketAddr,
    is_tls: bool,
    https_redirect_port: Option<u16>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if !is_tls {
        // Challenges are answered before any redirect so the ACME server
        // can always reach them over plain HTTP.
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            return Ok(match cert_manager.challenge_response(token).await {
                Some(key_auth) => {
                    debug!(token, "answering ACME HTTP-01 challenge");
                    Response::builder()
                        .status(StatusCode::OK)
                        .header(hyper::header::CONTENT_TYPE, "text/plain")
                        .body(Full::new(Bytes::from(key_auth)).map_err(|e| match e {}).boxed())
                        .expect("valid response builder")
                }
                None => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::new(Bytes::from_static(b"not found")).map_err(|e| match e {}).boxed())
                    .expect("valid response builder"),
            });
        }

        if let Some(port) = https_redirect_port {
            return Ok(build_https_redirect(&req, port));
        }
    }

    let hostname = match extract_hostname(&req) {
        Some(hostname) => hostname,
        None => {
            return Ok(json_error_response(
                RouteErrorCode::MissingHostHeader,
                "missing or invalid Host header",
            ));
        }
    };

    let route = match router.resolve(&hostname) {
        Ok(route) => route,
        Err((code, message)) => {
            debug!(hostname, code = code.as_header_value(), "request not routable");
            return Ok(json_error_response(code, message));
        }
    };

    set_forwarded_headers(&mut req, client_addr, is_tls);
    debug!(hostname, method = %req.method(), uri = %req.uri(), "routing request");

    if is_upgrade_request(&req) {
        return handle_upgrade(req, route, hostname).await;
    }

    match forward_to_socket(req, &route.socket_path).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(hostname, socket = %route.socket_path.display(), error = %e, "upstream relay failed");
            Ok(json_error_response(
                RouteErrorCode::UpstreamFailed,
                "failed to reach backend",
            ))
        }
    }
}

/// Sets the three forwarding headers, overwriting client-supplied values
/// except `X-Forwarded-For`, whose leftmost inbound entry is trusted as
/// the original client.
fn set_forwarded_headers<B>(req: &mut Request<B>, client_addr: SocketAddr, is_tls: bool) {
    let client_ip = forwarded_for(req.headers(), Some(client_addr));
    let host = req.headers().get(hyper::header::HOST).cloned();

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&client_ip) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}

/// Leftmost inbound `X-Forwarded-For` entry, else the peer address, else
/// `"unknown"`.
fn forwarded_for(headers: &HeaderMap, client_addr: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next().map(str::trim) {
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    client_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Lowercased request hostname with any port stripped.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }
            Some(hostname.to_lowercase())
        })
}

/// 301 to the HTTPS origin, preserving path and query.
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = if https_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{https_port}{path}")
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from_static(b"redirecting to HTTPS"))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Relays one request over the backend's Unix socket.
///
/// The upstream response is returned verbatim except `Transfer-Encoding`,
/// which the connection layer on the return path owns.
pub async fn forward_to_socket<B>(
    req: Request<B>,
    socket_path: &Path,
) -> anyhow::Result<Response<BoxBody<Bytes, hyper::Error>>>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = UnixStream::connect(socket_path).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "backend connection closed with error");
        }
    });

    // Rewrite the URI to origin form; everything else is preserved.
    let (mut parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    parts.uri = path_and_query.parse()?;
    let backend_req = Request::from_parts(parts, body);

    let response = sender.send_request(backend_req).await?;
    let (mut parts, body) = response.into_parts();
    parts.headers.remove(hyper::header::TRANSFER_ENCODING);
    Ok(Response::from_parts(parts, body.boxed()))
}

fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Serializes the upgrade request as raw HTTP/1.1 for the backend socket.
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            raw.push_str(&format!("{name}: {v}\r\n"));
        }
    }
    raw.push_str("\r\n");
    raw.into_bytes()
}

/// Parses the status line and headers of the backend's upgrade response.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response = std::str::from_utf8(data).ok()?;
    let mut lines = response.lines();

    let status_line = lines.next()?;
    let code: u16 = status_line.splitn(3, ' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    route: Route,
    hostname: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    debug!(hostname, "handling upgrade request");

    let raw_request = build_upgrade_request(&req);
    let mut backend = match UnixStream::connect(&route.socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(hostname, error = %e, "failed to dial backend for upgrade");
            return Ok(json_error_response(
                RouteErrorCode::UpstreamFailed,
                "failed to reach backend",
            ));
        }
    };

    if let Err(e) = backend.write_all(&raw_request).await {
        error!(hostname, error = %e, "failed to send upgrade request");
        return Ok(json_error_response(
            RouteErrorCode::UpstreamFailed,
            "failed to reach backend",
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) | Err(_) => {
            error!(hostname, "backend closed before answering upgrade");
            return Ok(json_error_response(
                RouteErrorCode::UpstreamFailed,
                "backend closed connection",
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        warn!(hostname, "unparsable upgrade response from backend");
        return Ok(json_error_response(
            RouteErrorCode::UpgradeFailed,
            "invalid upgrade response from backend",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, %status, "backend declined upgrade");
        return Ok(json_error_response(
            RouteErrorCode::UpgradeFailed,
            format!("backend declined upgrade with status {status}"),
        ));
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let lower = name.to_lowercase();
        if lower == "content-length" || lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = response
        .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
        .expect("valid response builder");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                relay_bidirectional(upgraded, backend, &hostname).await;
            }
            Err(e) => {
                error!(hostname, error = %e, "client upgrade failed");
            }
        }
    });

    Ok(response)
}

/// Relays frames between the upgraded client stream and the backend socket
/// until either side closes.
async fn relay_bidirectional(client: Upgraded, mut backend: UnixStream, hostname: &str) {
    let mut client_io = TokioIo::new(client);
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(hostname, to_backend, to_client, "websocket closed");
        }
        Err(e) => {
            debug!(hostname, error = %e, "websocket closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .uri("/some/path?x=1")
            .header(hyper::header::HOST, host)
            .body(Empty::new())
            .unwrap()
    }

    #[test]
    fn hostname_extraction() {
        assert_eq!(extract_hostname(&request_with_host("A.Test")), Some("a.test".to_string()));
        assert_eq!(
            extract_hostname(&request_with_host("a.test:8443")),
            Some("a.test".to_string())
        );
        assert_eq!(extract_hostname(&request_with_host("bad host")), None);
        assert_eq!(extract_hostname(&request_with_host(&"x".repeat(300))), None);
        let no_host: Request<Empty<Bytes>> = Request::builder().body(Empty::new()).unwrap();
        assert_eq!(extract_hostname(&no_host), None);
    }

    #[test]
    fn forwarded_for_prefers_leftmost_inbound() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4, 5.6.7.8"));
        let addr: SocketAddr = "9.9.9.9:1234".parse().unwrap();
        assert_eq!(forwarded_for(&headers, Some(addr)), "1.2.3.4");
    }

    #[test]
    fn forwarded_for_falls_back_to_peer_then_unknown() {
        let headers = HeaderMap::new();
        let addr: SocketAddr = "9.9.9.9:1234".parse().unwrap();
        assert_eq!(forwarded_for(&headers, Some(addr)), "9.9.9.9");
        assert_eq!(forwarded_for(&headers, None), "unknown");
    }

    #[test]
    fn forwarded_headers_set_and_overwritten() {
        let mut req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "a.test")
            .header(X_FORWARDED_PROTO, "http")
            .header(X_FORWARDED_HOST, "spoofed.test")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let addr: SocketAddr = "10.0.0.1:5555".parse().unwrap();

        set_forwarded_headers(&mut req, addr, true);
        assert_eq!(req.headers().get(X_FORWARDED_FOR).unwrap(), "10.0.0.1");
        assert_eq!(req.headers().get(X_FORWARDED_HOST).unwrap(), "a.test");
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn https_redirect_preserves_path_and_query() {
        let req = request_with_host("a.test");
        let response = build_https_redirect(&req, 443);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://a.test/some/path?x=1"
        );

        let response = build_https_redirect(&req, 8443);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://a.test:8443/some/path?x=1"
        );
    }

    #[test]
    fn upgrade_detection() {
        let plain = request_with_host("a.test");
        assert!(!is_upgrade_request(&plain));

        let ws = Request::builder()
            .uri("/socket")
            .header(hyper::header::HOST, "a.test")
            .header(hyper::header::CONNECTION, "keep-alive, Upgrade")
            .header(hyper::header::UPGRADE, "websocket")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(is_upgrade_request(&ws));
    }

    #[test]
    fn upgrade_request_serialization() {
        let ws = Request::builder()
            .method("GET")
            .uri("/socket?room=7")
            .header(hyper::header::HOST, "a.test")
            .header(hyper::header::UPGRADE, "websocket")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let raw = String::from_utf8(build_upgrade_request(&ws)).unwrap();
        assert!(raw.starts_with("GET /socket?room=7 HTTP/1.1\r\n"));
        assert!(raw.contains("host: a.test\r\n"));
        assert!(raw.contains("upgrade: websocket\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upgrade_response_parsing() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers.iter().any(|(n, v)| n == "Upgrade" && v == "websocket"));

        let rejected = b"HTTP/1.1 403 Forbidden\r\n\r\n";
        let (status, _) = parse_upgrade_response(rejected).unwrap();
        assert_eq!(status, StatusCode::FORBIDDEN);

        assert!(parse_upgrade_response(b"garbage").is_none());
    }
}
