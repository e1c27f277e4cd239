//! Local credentials, logout and the signed-in account's own data.

use axum::{
    Json, Router,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use db::models::{CreateAccount, ExternalLoginLink, IdentityAccount};
use serde::{Deserialize, Serialize};
use services::services::{
    password::{hash_password_blocking, verify_password_blocking},
    ticket::AuthMethod,
};
use tracing::{info, warn};

use super::{
    external::{EXTERNAL_LOGIN_FAILED, ProviderLink},
    local_return_url, ticket_cookie_for,
};
use crate::{
    AppState,
    context::{Principal, RequestContext, ticket_principal},
    cookies::{append_cookie, removal_cookie},
    error::ApiError,
};

const INVALID_CREDENTIALS: &str = "invalid user name or password";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/Login", get(login_page).post(login))
        .route("/Register", post(register))
        .route("/Logout", post(logout))
        .route("/Account/Me", get(me))
        .route("/Account/Logins", get(logins))
        .route("/Account/Logins/{provider}", delete(unlink))
}

#[derive(Debug, Deserialize)]
pub struct LoginPageQuery {
    #[serde(rename = "ReturnUrl")]
    pub return_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginPage {
    pub return_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    pub local_login: bool,
    pub providers: Vec<ProviderLink>,
}

async fn login_page(
    State(state): State<AppState>,
    Query(query): Query<LoginPageQuery>,
) -> Json<LoginPage> {
    let return_url = local_return_url(query.return_url.as_deref());
    // Only known codes are echoed back.
    let error = (query.error.as_deref() == Some(EXTERNAL_LOGIN_FAILED))
        .then_some("Sign-in with the external provider failed.");
    Json(LoginPage {
        error,
        providers: ProviderLink::all(&state, return_url.as_deref()),
        return_url,
        local_login: true,
    })
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignedIn {
    pub account: IdentityAccount,
    pub roles: Vec<String>,
    pub return_url: String,
}

async fn login(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let store = state.store();
    let account = store
        .find_account_by_user_name(payload.user_name.trim())
        .await?;

    // Unknown user names still pay for a hash check.
    let hash = account.as_ref().and_then(|a| a.password_hash.clone());
    let verified = verify_password_blocking(hash, payload.password).await;

    let Some(account) = account.filter(|_| verified) else {
        warn!(user_name = %payload.user_name.trim(), "Failed local login");
        return Err(ApiError::Unauthorized(INVALID_CREDENTIALS.into()));
    };

    let roles = store.roles_for(account.id).await?;
    let principal = ticket_principal(&account, &roles, AuthMethod::Password);
    let cookie = ticket_cookie_for(&state, &headers, &uri, &principal)?;
    info!(account_id = %account.id, "Local sign-in");

    let mut response = Json(SignedIn {
        account,
        roles,
        return_url: local_return_url(payload.return_url.as_deref()).unwrap_or_else(|| "/".into()),
    })
    .into_response();
    append_cookie(&mut response, &cookie);
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub user_name: String,
    pub password: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

async fn register(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Json(payload): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    let user_name = payload.user_name.trim();
    if user_name.is_empty() {
        return Err(ApiError::BadRequest("user name is required".into()));
    }
    // `provider:subject` names are reserved for federated accounts.
    if user_name.contains(':') {
        return Err(ApiError::BadRequest("user name may not contain `:`".into()));
    }

    let password_hash = hash_password_blocking(payload.password).await?;
    let account = state
        .store()
        .create_account(&CreateAccount {
            user_name: user_name.to_string(),
            display_name: payload.display_name.filter(|v| !v.trim().is_empty()),
            email: payload.email.filter(|v| !v.trim().is_empty()),
            password_hash: Some(password_hash),
        })
        .await?;
    info!(account_id = %account.id, "Registered local account");

    let principal = ticket_principal(&account, &[], AuthMethod::Password);
    let cookie = ticket_cookie_for(&state, &headers, &uri, &principal)?;

    let mut response = (
        StatusCode::CREATED,
        Json(SignedIn {
            account,
            roles: Vec::new(),
            return_url: "/".into(),
        }),
    )
        .into_response();
    append_cookie(&mut response, &cookie);
    Ok(response)
}

#[derive(Debug, Serialize)]
struct SignedOut {
    signed_out: bool,
}

async fn logout(State(state): State<AppState>, ctx: RequestContext) -> Response {
    ctx.session.destroy();
    if let Some(account) = &ctx.account {
        info!(account_id = %account.id, "Signed out");
    }

    let mut response = Json(SignedOut { signed_out: true }).into_response();
    append_cookie(
        &mut response,
        &removal_cookie(&state.config().auth_cookie_name),
    );
    response
}

#[derive(Debug, Serialize)]
pub struct AccountSummary {
    pub account: IdentityAccount,
    pub roles: Vec<String>,
    pub auth_method: AuthMethod,
    pub logins: Vec<ExternalLoginLink>,
}

async fn me(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<AccountSummary>, ApiError> {
    let logins = state.federation().logins(principal.account.id).await?;
    Ok(Json(AccountSummary {
        account: principal.account,
        roles: principal.roles,
        auth_method: principal.auth_method,
        logins,
    }))
}

async fn logins(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<ExternalLoginLink>>, ApiError> {
    Ok(Json(state.federation().logins(principal.account.id).await?))
}

async fn unlink(
    State(state): State<AppState>,
    principal: Principal,
    Path(provider): Path<String>,
) -> Result<StatusCode, ApiError> {
    let account = &principal.account;
    if !account.has_password() {
        let logins = state.federation().logins(account.id).await?;
        if logins.len() <= 1 {
            return Err(ApiError::Conflict(
                "cannot remove the only way to sign in to this account".into(),
            ));
        }
    }

    state.federation().unlink(account.id, &provider).await?;
    info!(account_id = %account.id, %provider, "Unlinked external login");
    Ok(StatusCode::NO_CONTENT)
}
