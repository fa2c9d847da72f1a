//! Proxy-side failures and the JSON error responses they become
//!
//! A request the proxy answers itself (instead of the backend) always gets a
//! JSON body, an `X-Proxy-Error` code header and the request id it was
//! handled under. The underlying cause is only logged.

use crate::pool::{ForwardError, ProxyBody};
use crate::recorder::RecordError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const X_PROXY_ERROR: &str = "x-proxy-error";
const X_REQUEST_ID: &str = "x-request-id";

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request could not be recorded and capture is fail-closed
    RecordingFailed,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RecordingFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RecordingFailed => "RECORDING_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// Why a request was answered by the proxy rather than the backend
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request could not be recorded: {0}")]
    Recording(#[from] RecordError),
    #[error("failed to forward request: {0}")]
    Forward(#[from] ForwardError),
    #[error("backend did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::Recording(_) => ProxyErrorCode::RecordingFailed,
            ProxyError::Forward(_) => ProxyErrorCode::ConnectionFailed,
            ProxyError::Timeout(_) => ProxyErrorCode::RequestTimeout,
        }
    }

    /// Message returned to the client; store paths and backend addresses
    /// stay in the logs
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::Recording(_) => "Request could not be recorded".to_string(),
            ProxyError::Forward(_) => "Failed to connect to backend".to_string(),
            ProxyError::Timeout(timeout) => {
                format!("Request timed out after {} seconds", timeout.as_secs())
            }
        }
    }

    pub fn into_response(self, request_id: &str) -> Response<ProxyBody> {
        json_error_response(self.code(), self.public_message(), Some(request_id))
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>, request_id: Option<&str>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            request_id: request_id.map(String::from),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Build a JSON error response carrying `X-Proxy-Error` and, when known,
/// `X-Request-Id`
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
    request_id: Option<&str>,
) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message, request_id).to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_PROXY_ERROR, HeaderValue::from_static(code.as_header_value()));
    if let Some(value) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(X_REQUEST_ID, value);
    }
    response
}
