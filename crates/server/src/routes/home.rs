use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use super::external::ProviderLink;
use crate::{AppState, REQUEST_ID_HEADER, context::RequestContext};

const VISITS_KEY: &str = "home.visits";

#[derive(Debug, Serialize)]
pub struct HomeResponse {
    pub authenticated: bool,
    pub user_name: Option<String>,
    pub display_name: Option<String>,
    /// Per-session counter, reset whenever the session idles out.
    pub visits: u64,
    pub providers: Vec<ProviderLink>,
}

pub async fn index(State(state): State<AppState>, ctx: RequestContext) -> Json<HomeResponse> {
    let visits = ctx.session.get_as::<u64>(VISITS_KEY).unwrap_or(0) + 1;
    if let Err(e) = ctx.session.insert(VISITS_KEY, visits) {
        tracing::warn!(error = %e, "Failed to record visit in session");
    }

    Json(HomeResponse {
        authenticated: ctx.is_authenticated(),
        user_name: ctx.account.as_ref().map(|a| a.user_name.clone()),
        display_name: ctx.account.as_ref().and_then(|a| a.display_name.clone()),
        visits,
        providers: ProviderLink::all(&state, None),
    })
}

/// What callers see instead of a failure's details.
#[derive(Debug, Serialize)]
pub struct ErrorDocument {
    pub error: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

pub fn error_document(request_id: Option<String>) -> Json<ErrorDocument> {
    Json(ErrorDocument {
        error: "internal_error",
        message: "An error occurred while processing your request.",
        request_id,
    })
}

pub async fn error(headers: HeaderMap) -> Json<ErrorDocument> {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    error_document(request_id)
}

#[derive(Debug, Deserialize)]
pub struct ReturnUrlQuery {
    #[serde(rename = "ReturnUrl")]
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccessDeniedResponse {
    error: &'static str,
    message: &'static str,
    return_url: Option<String>,
}

pub async fn access_denied(Query(query): Query<ReturnUrlQuery>) -> impl IntoResponse {
    (
        StatusCode::FORBIDDEN,
        Json(AccessDeniedResponse {
            error: "access_denied",
            message: "You do not have access to this resource.",
            return_url: super::local_return_url(query.return_url.as_deref()),
        }),
    )
}
