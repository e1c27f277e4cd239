pub mod config;
pub mod context;
pub mod cookies;
pub mod error;
pub mod file_logging;
pub mod pipeline;
pub mod routes;
pub mod state;

use axum::{
    Router,
    http::{Request, header::HeaderName},
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, field};

pub use state::AppState;

use crate::pipeline::Pipeline;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The full application: routes wrapped in the environment's pipeline, with
/// request ids and tracing outside of it.
pub fn app(state: AppState) -> Router {
    let pipeline = Pipeline::for_environment(state.config().environment);
    app_with_pipeline(state, &pipeline)
}

pub fn app_with_pipeline(state: AppState, pipeline: &Pipeline) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .and_then(|id| id.header_value().to_str().ok());
            let span = tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = field::Empty
            );
            if let Some(request_id) = request_id {
                span.record("request_id", field::display(request_id));
            }
            span
        })
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let routes = routes::router(&state);
    pipeline
        .build(routes, state)
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            REQUEST_ID_HEADER,
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static(REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
}
