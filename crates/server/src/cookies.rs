//! Cookie attributes for the ticket, session and handshake correlation
//! cookies.

use axum::{
    http::{HeaderMap, HeaderValue, Uri, header},
    response::Response,
};
use axum_extra::extract::{
    CookieJar,
    cookie::{Cookie, SameSite},
};

/// Ties an external-login callback to the browser that started it.
pub const CORRELATION_COOKIE: &str = ".Broker.Correlation";

/// True when the request reached us over HTTPS, directly or via a proxy that
/// sets `X-Forwarded-Proto`.
pub fn is_secure_request(headers: &HeaderMap, uri: &Uri) -> bool {
    if uri.scheme_str() == Some("https") {
        return true;
    }
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

/// `HttpOnly; SameSite=Strict; Path=/`, `Secure` on HTTPS requests.
pub fn ticket_cookie(name: &str, token: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_string(), token))
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .secure(secure)
        .build()
}

/// `HttpOnly; SameSite=Lax; Path=/`. Essential, so it is set without consent.
pub fn session_cookie(name: &str, id: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_string(), id))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .secure(secure)
        .build()
}

/// `HttpOnly; SameSite=Lax`, so it rides along on the provider's top-level
/// redirect back to the callback. Browser-session scoped; the pending state
/// it pairs with expires server side.
pub fn correlation_cookie(value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((CORRELATION_COOKIE, value))
        .http_only(true)
        .same_site(SameSite::Lax)
        .path("/")
        .secure(secure)
        .build()
}

/// Expired cookie that makes the browser drop `name`.
pub fn removal_cookie(name: &str) -> Cookie<'static> {
    let mut cookie = Cookie::build((name.to_string(), String::new()))
        .path("/")
        .http_only(true)
        .build();
    cookie.make_removal();
    cookie
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

pub fn append_cookie(response: &mut Response, cookie: &Cookie<'_>) {
    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => tracing::warn!(cookie = cookie.name(), error = %e, "Unencodable cookie"),
    }
}

/// Whether a handler already wrote `name` on this response.
pub fn response_sets_cookie(response: &Response, name: &str) -> bool {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split_once('=')
                .is_some_and(|(cookie_name, _)| cookie_name.trim() == name)
        })
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, response::IntoResponse};

    use super::*;

    #[test]
    fn ticket_cookie_attributes() {
        let rendered = ticket_cookie("Broker.Auth", "tok".into(), true).to_string();
        assert!(rendered.starts_with("Broker.Auth=tok"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("SameSite=Strict"));
        assert!(rendered.contains("Path=/"));
        assert!(rendered.contains("Secure"));

        let plain = ticket_cookie("Broker.Auth", "tok".into(), false).to_string();
        assert!(!plain.contains("Secure"));
    }

    #[test]
    fn session_cookie_is_lax() {
        let rendered = session_cookie(".Broker.Session", "sid".into(), false).to_string();
        assert!(rendered.starts_with(".Broker.Session=sid"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("SameSite=Lax"));
    }

    #[test]
    fn correlation_cookie_survives_cross_site_redirect() {
        let rendered = correlation_cookie("digest".into(), true).to_string();
        assert!(rendered.starts_with(".Broker.Correlation=digest"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(rendered.contains("Secure"));
    }

    #[test]
    fn removal_cookie_expires_immediately() {
        let rendered = removal_cookie("Broker.Auth").to_string();
        assert!(rendered.starts_with("Broker.Auth="));
        assert!(rendered.contains("Max-Age=0"));
    }

    #[test]
    fn secure_detection() {
        let mut headers = HeaderMap::new();
        let uri: Uri = "/Account/Me".parse().unwrap();
        assert!(!is_secure_request(&headers, &uri));

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https, http"));
        assert!(is_secure_request(&headers, &uri));

        let absolute: Uri = "https://broker.example/Account/Me".parse().unwrap();
        assert!(is_secure_request(&HeaderMap::new(), &absolute));
    }

    #[test]
    fn read_cookie_finds_named_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; Broker.Auth=abc.def; .Broker.Session=s1"),
        );
        assert_eq!(read_cookie(&headers, "Broker.Auth").as_deref(), Some("abc.def"));
        assert_eq!(read_cookie(&headers, ".Broker.Session").as_deref(), Some("s1"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn detects_cookie_already_written() {
        let mut response = Body::empty().into_response();
        assert!(!response_sets_cookie(&response, "Broker.Auth"));

        append_cookie(&mut response, &removal_cookie("Broker.Auth"));
        assert!(response_sets_cookie(&response, "Broker.Auth"));
        assert!(!response_sets_cookie(&response, "Broker"));
    }
}
