//! Maps `ErrorKind` onto the HTTP surface's status/body pair (§7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use relay_protocol::{ErrorBody, ErrorKind};

pub fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorBody::new(kind, message))).into_response()
}
