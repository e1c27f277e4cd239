use axum::{
    Router,
    http::{HeaderMap, Method, Uri},
    routing::get,
};
use axum_extra::extract::cookie::Cookie;
use chrono::Utc;
use services::services::{oauth::ProviderRegistry, ticket::AuthPrincipal};

use crate::{
    AppState,
    config::ConfigError,
    cookies::{is_secure_request, ticket_cookie},
    error::ApiError,
    pipeline::route_table::{AccessPolicy, RouteTable},
};

pub mod account;
pub mod admin;
pub mod external;
pub mod health;
pub mod home;

pub const ADMIN_ROLE: &str = "Admin";

fn base_table() -> RouteTable {
    use AccessPolicy::{Anonymous, Authenticated};

    RouteTable::new()
        .route(Method::GET, "/", Anonymous)
        .route(Method::GET, "/health", Anonymous)
        .route(Method::GET, "/Home/Error", Anonymous)
        .route(Method::GET, "/AccessDenied", Anonymous)
        .route(Method::GET, "/Login", Anonymous)
        .route(Method::POST, "/Login", Anonymous)
        .route(Method::POST, "/Register", Anonymous)
        .route(Method::POST, "/Logout", Anonymous)
        .route(Method::GET, "/ExternalLogin/{provider}", Anonymous)
        .route(Method::GET, "/Account/Me", Authenticated)
        .route(Method::GET, "/Account/Logins", Authenticated)
        .route(Method::DELETE, "/Account/Logins/{provider}", Authenticated)
        .route(Method::GET, "/Account/Link/{provider}", Authenticated)
        .route(
            Method::GET,
            "/Admin/Accounts/{id}",
            AccessPolicy::roles([ADMIN_ROLE]),
        )
        .route(
            Method::POST,
            "/Admin/Accounts/{id}/Roles",
            AccessPolicy::roles([ADMIN_ROLE]),
        )
}

/// Access policies for every route [`router`] mounts, including one
/// anonymous callback per provider.
pub fn route_table(registry: &ProviderRegistry) -> Result<RouteTable, ConfigError> {
    let mut table = base_table();
    for provider in registry.iter() {
        let path = &provider.callback_path;
        let collides = table.resolve(&Method::GET, path).pattern.is_some();
        if collides || path.contains(['{', '}', '*']) {
            return Err(ConfigError::InvalidValue {
                key: format!("callback path of provider `{}`", provider.name),
                reason: format!("`{path}` collides with another route"),
            });
        }
        table = table.route(Method::GET, path, AccessPolicy::Anonymous);
    }
    Ok(table)
}

pub fn router(state: &AppState) -> Router<AppState> {
    let mut router = Router::new()
        .route("/", get(home::index))
        .route("/health", get(health::health_check))
        .route("/Home/Error", get(home::error))
        .route("/AccessDenied", get(home::access_denied))
        .merge(account::router())
        .merge(external::router())
        .merge(admin::router());

    for provider in state.oauth.registry().iter() {
        router = router.route(&provider.callback_path, get(external::callback));
    }
    router
}

/// Only same-site relative paths are honoured as post-login destinations.
pub fn local_return_url(candidate: Option<&str>) -> Option<String> {
    let candidate = candidate?.trim();
    let is_local = candidate.starts_with('/')
        && !candidate.starts_with("//")
        && !candidate.starts_with("/\\")
        && !candidate.chars().any(char::is_control);
    is_local.then(|| candidate.to_string())
}

/// Issue a ticket for `principal` as a cookie matching the request's scheme.
pub fn ticket_cookie_for(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
    principal: &AuthPrincipal,
) -> Result<Cookie<'static>, ApiError> {
    let issued = state.tickets().issue(principal, Utc::now())?;
    Ok(ticket_cookie(
        &state.config().auth_cookie_name,
        issued.token,
        is_secure_request(headers, uri),
    ))
}
