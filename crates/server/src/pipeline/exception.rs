use std::any::Any;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::request_id::RequestId;
use tracing::error;

use crate::routes::home::error_document;

/// Replace any 5xx body with the generic error document.
pub async fn mask_server_errors(req: Request, next: Next) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .and_then(|id| id.header_value().to_str().ok())
        .map(str::to_string);
    let path = req.uri().path().to_string();

    let response = next.run(req).await;
    let status = response.status();
    if !status.is_server_error() {
        return response;
    }

    error!(status = status.as_u16(), %path, ?request_id, "Masking server error");
    (status, error_document(request_id)).into_response()
}

pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(%detail, "Request handler panicked");

    (StatusCode::INTERNAL_SERVER_ERROR, error_document(None)).into_response()
}
