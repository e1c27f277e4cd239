//! External sign-in: handshake start, provider callbacks and linking.

use axum::{
    Router,
    extract::{OriginalUri, Path, Query, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use services::services::{
    federation::FederationError,
    oauth::{AuthorizationRequest, HandshakeError, HandshakeIntent},
    ticket::AuthMethod,
};
use tracing::{info, warn};

use super::{home::ReturnUrlQuery, local_return_url, ticket_cookie_for};
use crate::{
    AppState,
    context::{Principal, RequestContext, ticket_principal},
    cookies::{
        CORRELATION_COOKIE, append_cookie, correlation_cookie, is_secure_request, read_cookie,
        removal_cookie,
    },
    error::ApiError,
    pipeline::authorization::redirect_with_return_url,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ExternalLogin/{provider}", get(begin_sign_in))
        .route("/Account/Link/{provider}", get(begin_link))
}

/// A provider as offered on the login page.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderLink {
    pub name: String,
    pub display_name: String,
    pub url: String,
}

impl ProviderLink {
    pub fn all(state: &AppState, return_url: Option<&str>) -> Vec<ProviderLink> {
        let query = return_url
            .map(|url| format!("?ReturnUrl={}", urlencoding::encode(url)))
            .unwrap_or_default();
        state
            .oauth
            .registry()
            .iter()
            .map(|provider| ProviderLink {
                name: provider.name.clone(),
                display_name: provider.display_name.clone(),
                url: format!("/ExternalLogin/{}{}", provider.name, query),
            })
            .collect()
    }
}

/// Query value the login page is sent with when a handshake fails.
pub const EXTERNAL_LOGIN_FAILED: &str = "external_login_failed";

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Redirect to the provider, pinning the handshake to this browser.
fn to_provider(request: &AuthorizationRequest, headers: &HeaderMap, uri: &Uri) -> Response {
    let mut response = found(&request.url);
    append_cookie(
        &mut response,
        &correlation_cookie(request.correlation.clone(), is_secure_request(headers, uri)),
    );
    response
}

async fn begin_sign_in(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Query(query): Query<ReturnUrlQuery>,
) -> Result<Response, ApiError> {
    let request = state.oauth.begin(
        &provider,
        local_return_url(query.return_url.as_deref()),
        HandshakeIntent::SignIn,
    )?;
    Ok(to_provider(&request, &headers, &uri))
}

async fn begin_link(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    principal: Principal,
    Path(provider): Path<String>,
    Query(query): Query<ReturnUrlQuery>,
) -> Result<Response, ApiError> {
    let request = state.oauth.begin(
        &provider,
        local_return_url(query.return_url.as_deref()),
        HandshakeIntent::Link(principal.account.id),
    )?;
    Ok(to_provider(&request, &headers, &uri))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Mounted once per provider at its callback path.
///
/// A handshake that fails for any reason the browser or provider caused
/// lands on the login page with `?error=external_login_failed`. The
/// correlation cookie is cleared whatever the outcome.
pub async fn callback(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    ctx: RequestContext,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(provider) = state
        .oauth
        .registry()
        .by_callback_path(uri.path())
        .map(|p| p.name.clone())
    else {
        return ApiError::NotFound(format!("no provider at {}", uri.path())).into_response();
    };
    let correlation = read_cookie(&headers, CORRELATION_COOKIE);

    let mut response = match finish_handshake(
        &state,
        &uri,
        &headers,
        &ctx,
        &provider,
        query,
        correlation.as_deref(),
    )
    .await
    {
        Ok(response) => response,
        Err(e) if is_external_login_failure(&e) => {
            warn!(provider = %provider, error = %e, "External login failed");
            found(&format!(
                "{}?error={EXTERNAL_LOGIN_FAILED}",
                state.config().login_path
            ))
        }
        Err(e) => e.into_response(),
    };
    append_cookie(&mut response, &removal_cookie(CORRELATION_COOKIE));
    response
}

/// Failures of the handshake itself, as opposed to local faults such as an
/// unreachable store.
fn is_external_login_failure(error: &ApiError) -> bool {
    matches!(
        error,
        ApiError::Handshake(_) | ApiError::Federation(FederationError::InvalidIdentity(_))
    )
}

async fn finish_handshake(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    ctx: &RequestContext,
    provider: &str,
    query: CallbackQuery,
    correlation: Option<&str>,
) -> Result<Response, ApiError> {
    if let Some(error) = query.error {
        let detail = match query.error_description {
            Some(description) => format!("{error}: {description}"),
            None => error,
        };
        return Err(HandshakeError::Denied(detail).into());
    }
    let (Some(code), Some(handshake_state)) = (query.code, query.state) else {
        return Err(HandshakeError::InvalidState.into());
    };

    let completed = state
        .oauth
        .complete(provider, &code, &handshake_state, correlation)
        .await?;

    match completed.intent {
        HandshakeIntent::SignIn => {
            let signed_in = state.federation().sign_in(&completed.identity).await?;
            info!(
                account_id = %signed_in.account.id,
                provider = %provider,
                created = signed_in.created,
                "External sign-in"
            );

            let principal = ticket_principal(
                &signed_in.account,
                &signed_in.roles,
                AuthMethod::External(provider.to_string()),
            );
            let cookie = ticket_cookie_for(state, headers, uri, &principal)?;

            let mut response = found(completed.return_url.as_deref().unwrap_or("/"));
            append_cookie(&mut response, &cookie);
            Ok(response)
        }
        HandshakeIntent::Link(account_id) => {
            // The link must be finished by the account that started it.
            if ctx.account.as_ref().map(|a| a.id) != Some(account_id) {
                return Ok(redirect_with_return_url(
                    &state.config().access_denied_path,
                    "/Account/Logins",
                ));
            }
            state
                .federation()
                .link(account_id, &completed.identity)
                .await?;
            Ok(found(
                completed.return_url.as_deref().unwrap_or("/Account/Logins"),
            ))
        }
    }
}
