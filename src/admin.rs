//! Administrative REST surface.
//!
//! A loopback HTTP server exposing CRUD over domains and projects,
//! supervisor operations, and certificate issuance. Every endpoint except
//! `/api/health` requires the `X-API-Key` header to match the configured
//! key (constant-time compare). Responses are JSON envelopes:
//! `{"success": bool, "data"?: T, "error"?: string}`.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::acme::CertManager;
use crate::config::Config;
use crate::db::{DbError, DomainStore, DomainUpdate, ProjectStore};
use crate::process::{Supervisor, SupervisorError};

/// Everything a request handler needs.
pub struct AdminState {
    pub config: Config,
    pub domains: Arc<DomainStore>,
    pub projects: Arc<ProjectStore>,
    pub supervisor: Arc<Supervisor>,
    pub cert_manager: Arc<CertManager>,
}

/// JSON envelope for every admin response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()) }
    }
}

#[derive(Debug, Deserialize)]
struct CreateDomainRequest {
    hostname: String,
    project_id: Uuid,
    #[serde(default)]
    ssl_enabled: bool,
}

/// The admin API server.
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AdminState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { bind_addr, state, shutdown_rx }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("admin server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_admin_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("admin connection error: {e}"))?;
    Ok(())
}

fn json_response<T: Serialize>(status: StatusCode, body: &ApiResponse<T>) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{\"success\":false}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .expect("valid response with StatusCode enum and static header")
}

fn ok<T: Serialize>(data: T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &ApiResponse::ok(data))
}

fn created<T: Serialize>(data: T) -> Response<Full<Bytes>> {
    json_response(StatusCode::CREATED, &ApiResponse::ok(data))
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(status, &ApiResponse::<()>::error(message))
}

fn db_error_response(error: DbError) -> Response<Full<Bytes>> {
    let status = match &error {
        DbError::Validation(_) => StatusCode::BAD_REQUEST,
        DbError::NotFound { .. } => StatusCode::NOT_FOUND,
        DbError::DuplicateHostname(_) | DbError::ProjectBusy { .. } => StatusCode::CONFLICT,
        DbError::MalformedRecord { .. } | DbError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %error, "metadata operation failed");
    }
    fail(status, error.to_string())
}

fn supervisor_error_response(error: SupervisorError) -> Response<Full<Bytes>> {
    let status = match &error {
        SupervisorError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SupervisorError::NotRunning(_) | SupervisorError::UnknownProject(_) => StatusCode::NOT_FOUND,
        SupervisorError::Db(DbError::NotFound { .. }) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %error, "supervisor operation failed");
    }
    fail(status, error.to_string())
}

/// Compares the presented key against the configured one without
/// short-circuiting on the first mismatched byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn check_auth<B>(req: &Request<B>, expected: &str) -> bool {
    req.headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|key| constant_time_eq(key.as_bytes(), expected.as_bytes()))
        .unwrap_or(false)
}

/// Routes one admin request. Generic over the body so tests can drive it
/// without a socket.
pub async fn handle_admin_request<B>(
    req: Request<B>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "admin request");

    // Liveness is the one unauthenticated endpoint.
    if method == Method::GET && path == "/api/health" {
        return Ok(ok("ok"));
    }

    if !check_auth(&req, &state.config.admin_api_key) {
        warn!(%path, "admin request with bad or missing API key");
        return Ok(fail(StatusCode::UNAUTHORIZED, "invalid api key"));
    }

    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(fail(StatusCode::BAD_REQUEST, format!("failed to read body: {e}")));
        }
    };

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let response = match (method, segments.as_slice()) {
        (Method::GET, ["api", "domains"]) => ok(state.domains.list()),
        (Method::POST, ["api", "domains"]) => create_domain(&state, &body),
        (Method::GET, ["api", "domains", id]) => match parse_uuid(id) {
            Ok(id) => match state.domains.get(id) {
                Some(domain) => ok(domain),
                None => fail(StatusCode::NOT_FOUND, format!("domain {id} not found")),
            },
            Err(response) => response,
        },
        (Method::PUT, ["api", "domains", id]) => match parse_uuid(id) {
            Ok(id) => update_domain(&state, id, &body),
            Err(response) => response,
        },
        (Method::DELETE, ["api", "domains", id]) => match parse_uuid(id) {
            Ok(id) => match state.domains.delete(id) {
                Ok(()) => ok(serde_json::json!({ "deleted": id })),
                Err(e) => db_error_response(e),
            },
            Err(response) => response,
        },

        (Method::GET, ["api", "projects"]) => ok(state.projects.list()),
        (Method::POST, ["api", "projects"]) => {
            create_project(&state, content_type.as_deref(), &body).await
        }
        (Method::GET, ["api", "projects", id]) => match parse_uuid(id) {
            Ok(id) => match state.projects.get(id) {
                Some(project) => ok(project),
                None => fail(StatusCode::NOT_FOUND, format!("project {id} not found")),
            },
            Err(response) => response,
        },
        (Method::DELETE, ["api", "projects", id]) => match parse_uuid(id) {
            Ok(id) => delete_project(&state, id),
            Err(response) => response,
        },

        (Method::GET, ["api", "processes"]) => ok(state.supervisor.list()),
        (Method::POST, ["api", "processes", id, action]) => match parse_uuid(id) {
            Ok(id) => process_action(&state, id, action).await,
            Err(response) => response,
        },

        (Method::POST, ["api", "ssl", hostname, "generate"]) => {
            generate_certificate(&state, hostname).await
        }

        _ => fail(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn parse_uuid(raw: &str) -> Result<Uuid, Response<Full<Bytes>>> {
    Uuid::parse_str(raw).map_err(|_| fail(StatusCode::BAD_REQUEST, format!("invalid id {raw:?}")))
}

fn create_domain(state: &AdminState, body: &[u8]) -> Response<Full<Bytes>> {
    let request: CreateDomainRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return fail(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")),
    };
    if state.projects.get(request.project_id).is_none() {
        return fail(
            StatusCode::BAD_REQUEST,
            format!("project {} does not exist", request.project_id),
        );
    }
    match state.domains.create(request.hostname, request.project_id, request.ssl_enabled) {
        Ok(domain) => {
            info!(hostname = %domain.hostname, id = %domain.id, "domain created");
            created(domain)
        }
        Err(e) => db_error_response(e),
    }
}

fn update_domain(state: &AdminState, id: Uuid, body: &[u8]) -> Response<Full<Bytes>> {
    let update: DomainUpdate = match serde_json::from_slice(body) {
        Ok(update) => update,
        Err(e) => return fail(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")),
    };
    if let Some(project_id) = update.project_id {
        if state.projects.get(project_id).is_none() {
            return fail(StatusCode::BAD_REQUEST, format!("project {project_id} does not exist"));
        }
    }
    match state.domains.update(id, update) {
        Ok(domain) => ok(domain),
        Err(e) => db_error_response(e),
    }
}

async fn create_project(
    state: &AdminState,
    content_type: Option<&str>,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let Some(content_type) = content_type else {
        return fail(StatusCode::BAD_REQUEST, "expected multipart/form-data");
    };
    let Some(parts) = parse_multipart(content_type, body) else {
        return fail(StatusCode::BAD_REQUEST, "malformed multipart body");
    };

    let name = parts
        .iter()
        .find(|part| part.name == "name")
        .and_then(|part| std::str::from_utf8(&part.data).ok())
        .map(str::trim)
        .map(String::from);
    let binary = parts.iter().find(|part| part.name == "binary");

    let (Some(name), Some(binary)) = (name, binary) else {
        return fail(StatusCode::BAD_REQUEST, "multipart fields 'name' and 'binary' are required");
    };
    if binary.data.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "uploaded binary is empty");
    }

    let id = Uuid::new_v4();
    let binary_path = state.config.binary_path_for(id);
    let socket_path = state.config.socket_path_for(id);

    if let Err(e) = tokio::fs::write(&binary_path, &binary.data).await {
        error!(path = %binary_path.display(), error = %e, "failed to write uploaded binary");
        return fail(StatusCode::INTERNAL_SERVER_ERROR, "failed to store binary");
    }
    if let Err(e) =
        std::fs::set_permissions(&binary_path, std::fs::Permissions::from_mode(0o755))
    {
        error!(path = %binary_path.display(), error = %e, "failed to chmod uploaded binary");
        return fail(StatusCode::INTERNAL_SERVER_ERROR, "failed to store binary");
    }

    match state.projects.create_with_id(id, name, binary_path.clone(), socket_path) {
        Ok(project) => {
            info!(name = %project.name, id = %project.id, "project created");
            created(project)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&binary_path);
            db_error_response(e)
        }
    }
}

fn delete_project(state: &AdminState, id: Uuid) -> Response<Full<Bytes>> {
    if state.supervisor.is_running(id) {
        return fail(StatusCode::CONFLICT, format!("project {id} is running, stop it first"));
    }
    match state.projects.delete(id) {
        Ok(project) => {
            let _ = std::fs::remove_file(&project.binary_path);
            let _ = std::fs::remove_file(&project.socket_path);
            info!(name = %project.name, %id, "project deleted");
            ok(serde_json::json!({ "deleted": id }))
        }
        Err(e) => db_error_response(e),
    }
}

async fn process_action(state: &AdminState, id: Uuid, action: &str) -> Response<Full<Bytes>> {
    let result = match action {
        "start" => state.supervisor.start(id).await,
        "stop" => state.supervisor.stop(id).await,
        "restart" => state.supervisor.restart(id).await,
        other => {
            return fail(StatusCode::NOT_FOUND, format!("unknown action {other:?}"));
        }
    };
    match result {
        Ok(()) => ok(serde_json::json!({ "project_id": id, "action": action })),
        Err(e) => supervisor_error_response(e),
    }
}

async fn generate_certificate(state: &AdminState, hostname: &str) -> Response<Full<Bytes>> {
    let Some(domain) = state.domains.get_by_hostname(hostname) else {
        return fail(StatusCode::NOT_FOUND, format!("no domain for {hostname}"));
    };

    match state.cert_manager.issue(hostname).await {
        Ok(entry) => {
            // Certificate in hand: flip the ssl bit so the bundle rebuild
            // and the next boot both pick this hostname up.
            let update = DomainUpdate { ssl_enabled: Some(true), ..Default::default() };
            if let Err(e) = state.domains.update(domain.id, update) {
                return db_error_response(e);
            }
            ok(serde_json::json!({
                "hostname": hostname,
                "expires_at": entry.expires_at,
            }))
        }
        Err(e) => {
            error!(hostname, error = %e, "certificate issuance failed");
            fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

struct MultipartPart {
    name: String,
    #[allow(dead_code)]
    filename: Option<String>,
    data: Vec<u8>,
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Minimal `multipart/form-data` parser for the project-upload endpoint.
fn parse_multipart(content_type: &str, body: &[u8]) -> Option<Vec<MultipartPart>> {
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))?
        .trim_matches('"');
    if boundary.is_empty() {
        return None;
    }
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut cursor = find_subslice(body, delimiter, 0)? + delimiter.len();

    loop {
        // A trailing "--" after the delimiter closes the body.
        if body[cursor..].starts_with(b"--") {
            break;
        }
        let content_start = find_subslice(body, b"\r\n", cursor)? + 2;

        let headers_end = find_subslice(body, b"\r\n\r\n", content_start)?;
        let headers = std::str::from_utf8(&body[content_start..headers_end]).ok()?;
        let data_start = headers_end + 4;

        let next_delim = find_subslice(body, delimiter, data_start)?;
        // Part data ends before the CRLF that precedes the delimiter.
        let data_end = next_delim.checked_sub(2)?;

        let (name, filename) = parse_content_disposition(headers)?;
        parts.push(MultipartPart {
            name,
            filename,
            data: body[data_start..data_end].to_vec(),
        });

        cursor = next_delim + delimiter.len();
    }

    Some(parts)
}

fn parse_content_disposition(headers: &str) -> Option<(String, Option<String>)> {
    let line = headers
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))?;

    let mut name = None;
    let mut filename = None;
    for param in line.split(';').map(str::trim) {
        if let Some(value) = param.strip_prefix("name=") {
            name = Some(value.trim_matches('"').to_string());
        } else if let Some(value) = param.strip_prefix("filename=") {
            filename = Some(value.trim_matches('"').to_string());
        }
    }
    Some((name?, filename))
}
