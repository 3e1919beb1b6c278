//! Routing error codes and JSON error responses.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Why a request could not be routed to a backend.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteErrorCode {
    /// Missing or invalid Host header.
    MissingHostHeader,
    /// No domain registered for the host.
    UnknownHost,
    /// The domain references a project that no longer exists.
    ProjectMissing,
    /// The project exists but has no live process handle.
    BackendNotRunning,
    /// Dialing the backend socket or relaying the request failed.
    UpstreamFailed,
    /// The backend rejected or broke the upgrade handshake.
    UpgradeFailed,
    /// Internal proxy error.
    InternalError,
}

impl RouteErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouteErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            RouteErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            RouteErrorCode::ProjectMissing => StatusCode::BAD_GATEWAY,
            RouteErrorCode::BackendNotRunning => StatusCode::SERVICE_UNAVAILABLE,
            RouteErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            RouteErrorCode::UpgradeFailed => StatusCode::BAD_REQUEST,
            RouteErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the `X-Proxy-Error` header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RouteErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            RouteErrorCode::UnknownHost => "UNKNOWN_HOST",
            RouteErrorCode::ProjectMissing => "PROJECT_MISSING",
            RouteErrorCode::BackendNotRunning => "BACKEND_NOT_RUNNING",
            RouteErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            RouteErrorCode::UpgradeFailed => "UPGRADE_FAILED",
            RouteErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON document describing one routing failure.
fn error_document(code: RouteErrorCode, message: &str) -> serde_json::Value {
    serde_json::json!({
        "code": code,
        "message": message,
        "status": code.status_code().as_u16(),
    })
}

/// Builds the error response: JSON body plus an `X-Proxy-Error` header
/// carrying the machine-readable code.
pub fn json_error_response(
    code: RouteErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = error_document(code, &message.into()).to_string();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(hyper::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-proxy-error", HeaderValue::from_static(code.as_header_value()));
    response
}
