use axum::{extract::FromRequestParts, http::request::Parts};
use db::models::IdentityAccount;
use services::services::{
    session::SessionHandle,
    ticket::{AuthMethod, AuthPrincipal},
};

use crate::{AppState, error::ApiError};

/// The signed-in caller, attached by the authentication stage.
#[derive(Debug, Clone)]
pub struct Principal {
    pub account: IdentityAccount,
    pub roles: Vec<String>,
    pub auth_method: AuthMethod,
}

impl Principal {
    pub fn is_in_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Claims to put in a freshly issued ticket.
pub fn ticket_principal(
    account: &IdentityAccount,
    roles: &[String],
    auth_method: AuthMethod,
) -> AuthPrincipal {
    AuthPrincipal {
        account_id: account.id,
        user_name: account.user_name.clone(),
        email: account.email.clone(),
        roles: roles.to_vec(),
        auth_method,
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("authentication required".into()))
    }
}

/// What application code sees of the caller: the account, if signed in, and
/// the session.
#[derive(Clone)]
pub struct RequestContext {
    pub account: Option<IdentityAccount>,
    pub roles: Vec<String>,
    pub session: SessionHandle,
}

impl RequestContext {
    pub fn is_authenticated(&self) -> bool {
        self.account.is_some()
    }
}

impl FromRequestParts<AppState> for RequestContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let principal = parts.extensions.get::<Principal>().cloned();
        // Handlers mounted outside the pipeline still get a usable session.
        let session = parts
            .extensions
            .get::<SessionHandle>()
            .cloned()
            .unwrap_or_else(|| SessionHandle::detached(state.sessions().clone()));

        let (account, roles) = match principal {
            Some(p) => (Some(p.account), p.roles),
            None => (None, Vec::new()),
        };
        Ok(RequestContext {
            account,
            roles,
            session,
        })
    }
}
