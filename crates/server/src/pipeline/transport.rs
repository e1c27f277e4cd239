//! HSTS and the plain-HTTP to HTTPS redirect.

use std::sync::Once;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::{AppState, cookies::is_secure_request};

/// 30 days.
pub const HSTS_VALUE: &str = "max-age=2592000";

static MISSING_HTTPS_PORT: Once = Once::new();

pub async fn hsts(req: Request, next: Next) -> Response {
    let secure = is_secure_request(req.headers(), req.uri());
    let mut response = next.run(req).await;
    if secure {
        response.headers_mut().insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS_VALUE),
        );
    }
    response
}

pub async fn https_redirect(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if is_secure_request(req.headers(), req.uri()) {
        return next.run(req).await;
    }

    let Some(https_port) = state.config().https_port else {
        MISSING_HTTPS_PORT.call_once(|| {
            warn!("No HTTPS port configured, plain HTTP requests are not redirected");
        });
        return next.run(req).await;
    };

    match https_location(&req, https_port) {
        Some(location) => {
            debug!(%location, "Redirecting to HTTPS");
            (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, location)],
            )
                .into_response()
        }
        None => next.run(req).await,
    }
}

fn https_location(req: &Request, https_port: u16) -> Option<String> {
    let authority = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })?;
    let host = match authority.rsplit_once(':') {
        // Keep bracketed IPv6 literals intact.
        Some((host, port)) if !port.contains(']') => host.to_string(),
        _ => authority,
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Some(if https_port == 443 {
        format!("https://{host}{path_and_query}")
    } else {
        format!("https://{host}:{https_port}{path_and_query}")
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;

    use super::*;

    fn request(uri: &str, host: &str) -> Request {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn location_keeps_path_and_query() {
        let req = request("/Account/Me?tab=logins", "broker.example:5000");
        assert_eq!(
            https_location(&req, 5001).as_deref(),
            Some("https://broker.example:5001/Account/Me?tab=logins")
        );
    }

    #[test]
    fn default_port_is_omitted() {
        let req = request("/", "broker.example");
        assert_eq!(
            https_location(&req, 443).as_deref(),
            Some("https://broker.example/")
        );
    }

    #[test]
    fn ipv6_host_is_preserved() {
        let req = request("/", "[::1]");
        assert_eq!(https_location(&req, 8443).as_deref(), Some("https://[::1]:8443/"));
    }

    #[test]
    fn no_host_means_no_redirect() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(https_location(&req, 443), None);
    }
}
