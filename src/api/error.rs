use crate::{engine::EngineError, fs::FsError};
use axum::{
    Json,
    body::Body,
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct ApiErrorEnvelope {
    pub(crate) code: u16,
    pub(crate) message: String,
}

pub(crate) fn message_for_status(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad request",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not found",
        StatusCode::METHOD_NOT_ALLOWED => "method not allowed",
        StatusCode::RANGE_NOT_SATISFIABLE => "range not satisfiable",
        StatusCode::BAD_GATEWAY => "engine command failed",
        StatusCode::SERVICE_UNAVAILABLE => "service unavailable",
        StatusCode::GATEWAY_TIMEOUT => "gateway timeout",
        StatusCode::INTERNAL_SERVER_ERROR => "internal server error",
        _ => "request failed",
    }
}

/// Handler failure rendered as a JSON envelope.
#[derive(Debug)]
pub(crate) struct HttpError {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
}

impl HttpError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn timeout(what: &str) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, format!("{what} timed out"))
    }
}

pub(crate) fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NoDownload | EngineError::UnknownFile(_) => StatusCode::NOT_FOUND,
        EngineError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::CommandFailed { .. } | EngineError::Io(_) => StatusCode::BAD_GATEWAY,
    }
}

pub(crate) fn fs_status(err: &FsError) -> StatusCode {
    match err {
        FsError::NotReady | FsError::Deselected => StatusCode::SERVICE_UNAVAILABLE,
        FsError::NotFound(_) => StatusCode::NOT_FOUND,
        FsError::Engine(inner) => engine_status(inner),
        FsError::Disconnected | FsError::Closed | FsError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        Self::new(engine_status(&err), err.to_string())
    }
}

impl From<FsError> for HttpError {
    fn from(err: FsError) -> Self {
        Self::new(fs_status(&err), err.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = self.status.as_u16(), error = %self.message, "request failed");
        } else {
            tracing::debug!(status = self.status.as_u16(), error = %self.message, "request rejected");
        }
        let mut resp = (
            self.status,
            Json(ApiErrorEnvelope {
                code: self.status.as_u16(),
                message: self.message,
            }),
        )
            .into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        resp
    }
}

pub(crate) fn status_with_message(status: StatusCode) -> (StatusCode, Json<ApiErrorEnvelope>) {
    (
        status,
        Json(ApiErrorEnvelope {
            code: status.as_u16(),
            message: message_for_status(status).to_string(),
        }),
    )
}

/// Gives bodyless or non-JSON error responses (router 404/405, extractor rejections) the same
/// `{code, message}` shape handlers produce.
pub(crate) async fn error_envelope_mw(req: Request<Body>, next: Next) -> Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.is_success() || status.is_redirection() {
        return resp;
    }
    let has_json_body = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if has_json_body {
        return resp;
    }

    let envelope_resp = status_with_message(status).into_response();
    let (mut orig_parts, _orig_body) = resp.into_parts();
    let (envelope_parts, envelope_body) = envelope_resp.into_parts();
    orig_parts.headers.remove(header::CONTENT_LENGTH);
    orig_parts.headers.extend(envelope_parts.headers);
    Response::from_parts(orig_parts, envelope_body)
}
