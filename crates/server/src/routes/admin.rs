use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use db::models::{ExternalLoginLink, IdentityAccount};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{AppState, context::Principal, error::ApiError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/Admin/Accounts/{id}", get(get_account))
        .route("/Admin/Accounts/{id}/Roles", post(grant_role))
}

#[derive(Debug, Serialize)]
pub struct AdminAccountView {
    pub account: IdentityAccount,
    pub has_password: bool,
    pub roles: Vec<String>,
    pub logins: Vec<ExternalLoginLink>,
}

async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AdminAccountView>, ApiError> {
    let store = state.store();
    let account = store
        .find_account(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("account {id} not found")))?;
    let roles = store.roles_for(id).await?;
    let logins = state.federation().logins(id).await?;

    Ok(Json(AdminAccountView {
        has_password: account.has_password(),
        account,
        roles,
        logins,
    }))
}

#[derive(Debug, Deserialize)]
pub struct GrantRole {
    pub role: String,
}

async fn grant_role(
    State(state): State<AppState>,
    admin: Principal,
    Path(id): Path<Uuid>,
    Json(payload): Json<GrantRole>,
) -> Result<StatusCode, ApiError> {
    let role = payload.role.trim();
    if role.is_empty() {
        return Err(ApiError::BadRequest("role is required".into()));
    }

    let store = state.store();
    if store.find_account(id).await?.is_none() {
        return Err(ApiError::NotFound(format!("account {id} not found")));
    }
    store.create_role(role).await?;
    store.add_to_role(id, role).await?;

    info!(account_id = %id, %role, granted_by = %admin.account.id, "Granted role");
    Ok(StatusCode::NO_CONTENT)
}
