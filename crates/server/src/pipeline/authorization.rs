use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::route_table::{AccessDecision, AccessPolicy, ResolvedRoute};
use crate::{AppState, context::Principal};

/// Apply the resolved route's policy. A missing principal is sent to the
/// login path, a principal without the required role to the access-denied
/// path; both carry `ReturnUrl`.
pub async fn authorize(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let policy = req
        .extensions()
        .get::<ResolvedRoute>()
        .map(|route| route.policy.clone())
        .unwrap_or(AccessPolicy::Anonymous);

    let decision = policy.evaluate(req.extensions().get::<Principal>());
    let return_url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match decision {
        AccessDecision::Allow => next.run(req).await,
        AccessDecision::Challenge => {
            debug!(%return_url, "Unauthenticated request to protected route");
            redirect_with_return_url(&state.config().login_path, return_url)
        }
        AccessDecision::Forbid => {
            debug!(%return_url, ?policy, "Principal lacks a required role");
            redirect_with_return_url(&state.config().access_denied_path, return_url)
        }
    }
}

pub fn redirect_with_return_url(target: &str, return_url: &str) -> Response {
    let location = format!("{target}?ReturnUrl={}", urlencoding::encode(return_url));
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_url_is_encoded() {
        let response = redirect_with_return_url("/Login", "/Account/Me?tab=a&b=c");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/Login?ReturnUrl=%2FAccount%2FMe%3Ftab%3Da%26b%3Dc"
        );
    }
}
