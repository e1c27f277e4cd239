use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use services::services::session::SessionHandle;

use crate::{
    AppState,
    cookies::{append_cookie, is_secure_request, read_cookie, removal_cookie, session_cookie},
};

/// Attach a [`SessionHandle`]. The cookie is (re)sent whenever the session
/// was created or touched so its idle window slides with the server's.
pub async fn attach_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let cookie_name = state.config().session_cookie_name.clone();
    let secure = is_secure_request(req.headers(), req.uri());
    let sessions = state.sessions().clone();

    let loaded = read_cookie(req.headers(), &cookie_name)
        .and_then(|id| sessions.load(&id, Utc::now()));
    let touched = loaded.is_some();
    let handle = match loaded {
        Some(record) => SessionHandle::existing(sessions, record.id),
        None => SessionHandle::detached(sessions),
    };

    req.extensions_mut().insert(handle.clone());
    let mut response = next.run(req).await;

    if handle.was_destroyed() {
        append_cookie(&mut response, &removal_cookie(&cookie_name));
    } else if let Some(id) = handle.id()
        && (touched || handle.was_created())
    {
        append_cookie(&mut response, &session_cookie(&cookie_name, id.to_string(), secure));
    }
    response
}
