use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use services::services::ticket::{IssuedTicket, TicketClaims};
use tracing::debug;

use crate::{
    AppState,
    context::Principal,
    cookies::{
        append_cookie, is_secure_request, read_cookie, removal_cookie, response_sets_cookie,
        ticket_cookie,
    },
    error::ApiError,
};

enum TicketOutcome {
    Absent,
    Valid(Option<IssuedTicket>),
    Rejected,
}

/// Turn the ticket cookie into a [`Principal`].
///
/// A renewed ticket is written back on the response. A ticket that fails
/// validation, or whose account no longer exists, is cleared. Neither case
/// rejects the request here; that is the authorization stage's call.
pub async fn authenticate(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let cookie_name = state.config().auth_cookie_name.clone();
    let secure = is_secure_request(req.headers(), req.uri());

    let outcome = match read_cookie(req.headers(), &cookie_name) {
        None => TicketOutcome::Absent,
        Some(token) => match state.tickets().validate(&token, Utc::now()) {
            Ok(check) => match load_principal(&state, &check.claims).await {
                Ok(Some(principal)) => {
                    req.extensions_mut().insert(principal);
                    TicketOutcome::Valid(check.renewed)
                }
                Ok(None) => {
                    debug!(account_id = %check.claims.sub, "Ticket names a missing account");
                    TicketOutcome::Rejected
                }
                Err(e) => return e.into_response(),
            },
            Err(e) => {
                debug!(error = %e, "Discarding authentication ticket");
                TicketOutcome::Rejected
            }
        },
    };

    let mut response = next.run(req).await;
    if response_sets_cookie(&response, &cookie_name) {
        // Login and logout handlers own the cookie on their responses.
        return response;
    }

    match outcome {
        TicketOutcome::Valid(Some(renewed)) => {
            debug!(expires_at = %renewed.expires_at, "Renewed authentication ticket");
            append_cookie(
                &mut response,
                &ticket_cookie(&cookie_name, renewed.token, secure),
            );
        }
        TicketOutcome::Rejected => append_cookie(&mut response, &removal_cookie(&cookie_name)),
        TicketOutcome::Absent | TicketOutcome::Valid(None) => {}
    }
    response
}

async fn load_principal(
    state: &AppState,
    claims: &TicketClaims,
) -> Result<Option<Principal>, ApiError> {
    let store = state.store();
    let Some(account) = store.find_account(claims.sub).await? else {
        return Ok(None);
    };
    let roles = store.roles_for(account.id).await?;

    Ok(Some(Principal {
        account,
        roles,
        auth_method: claims.auth_method.clone(),
    }))
}
