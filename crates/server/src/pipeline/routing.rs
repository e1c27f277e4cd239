use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::AppState;

/// Attach the [`ResolvedRoute`](super::route_table::ResolvedRoute) for this
/// method and path. Unmatched requests continue as anonymous and end in 404.
pub async fn resolve_route(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let resolved = state
        .route_table()
        .resolve(req.method(), req.uri().path());
    if resolved.pattern.is_none() {
        tracing::trace!(path = %req.uri().path(), "No route matched");
    }
    req.extensions_mut().insert(resolved);
    next.run(req).await
}
