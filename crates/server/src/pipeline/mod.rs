//! The ordered request pipeline.
//!
//! Stages are plain descriptors checked when the [`Pipeline`] is constructed;
//! [`Pipeline::build`] then turns them into axum middleware so that the first
//! descriptor is the outermost layer. Authentication must see the routing
//! result, authorization must see the principal, and session state is only
//! attached to requests that were allowed through.

use axum::{Router, middleware};
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;

use crate::{AppState, config::Environment};

pub mod authentication;
pub mod authorization;
pub mod exception;
pub mod route_table;
pub mod routing;
pub mod session;
pub mod static_files;
pub mod transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    ExceptionHandler,
    Hsts,
    HttpsRedirection,
    StaticFiles,
    Routing,
    Authentication,
    Authorization,
    Session,
}

impl StageKind {
    /// Canonical order, outermost first.
    pub const CANONICAL: [StageKind; 8] = [
        StageKind::ExceptionHandler,
        StageKind::Hsts,
        StageKind::HttpsRedirection,
        StageKind::StaticFiles,
        StageKind::Routing,
        StageKind::Authentication,
        StageKind::Authorization,
        StageKind::Session,
    ];

    pub const REQUIRED: [StageKind; 4] = [
        StageKind::Routing,
        StageKind::Authentication,
        StageKind::Authorization,
        StageKind::Session,
    ];

    fn rank(self) -> usize {
        self as usize
    }

    pub fn production_only(self) -> bool {
        matches!(self, StageKind::ExceptionHandler | StageKind::Hsts)
    }

    fn apply(self, router: Router<AppState>, state: &AppState) -> Router<AppState> {
        match self {
            StageKind::ExceptionHandler => router
                .layer(middleware::from_fn(exception::mask_server_errors))
                .layer(CatchPanicLayer::custom(exception::panic_response)),
            StageKind::Hsts => router.layer(middleware::from_fn(transport::hsts)),
            StageKind::HttpsRedirection => router.layer(middleware::from_fn_with_state(
                state.clone(),
                transport::https_redirect,
            )),
            StageKind::StaticFiles => router.layer(middleware::from_fn_with_state(
                state.clone(),
                static_files::serve_static,
            )),
            StageKind::Routing => router.layer(middleware::from_fn_with_state(
                state.clone(),
                routing::resolve_route,
            )),
            StageKind::Authentication => router.layer(middleware::from_fn_with_state(
                state.clone(),
                authentication::authenticate,
            )),
            StageKind::Authorization => router.layer(middleware::from_fn_with_state(
                state.clone(),
                authorization::authorize,
            )),
            StageKind::Session => router.layer(middleware::from_fn_with_state(
                state.clone(),
                session::attach_session,
            )),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("stage {0:?} appears more than once")]
    Duplicate(StageKind),
    #[error("required stage {0:?} is missing")]
    Missing(StageKind),
    #[error("stage {stage:?} must come before {after:?}")]
    OutOfOrder { stage: StageKind, after: StageKind },
    #[error("stage {0:?} is only allowed in Production")]
    ProductionOnly(StageKind),
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    environment: Environment,
    stages: Vec<StageKind>,
}

impl Pipeline {
    /// The canonical stage list for `environment`. Outside production the
    /// exception handler and HSTS are left out so raw diagnostics surface.
    pub fn for_environment(environment: Environment) -> Self {
        let stages = StageKind::CANONICAL
            .into_iter()
            .filter(|stage| environment.is_production() || !stage.production_only())
            .collect();
        Self {
            environment,
            stages,
        }
    }

    /// Validate an explicit stage list.
    pub fn new(environment: Environment, stages: Vec<StageKind>) -> Result<Self, PipelineError> {
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].contains(stage) {
                return Err(PipelineError::Duplicate(*stage));
            }
            if stage.production_only() && !environment.is_production() {
                return Err(PipelineError::ProductionOnly(*stage));
            }
        }

        for required in StageKind::REQUIRED {
            if !stages.contains(&required) {
                return Err(PipelineError::Missing(required));
            }
        }

        for pair in stages.windows(2) {
            if pair[0].rank() > pair[1].rank() {
                return Err(PipelineError::OutOfOrder {
                    stage: pair[1],
                    after: pair[0],
                });
            }
        }

        Ok(Self {
            environment,
            stages,
        })
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    /// Wrap `router` in the stages and bind the state.
    pub fn build(&self, router: Router<AppState>, state: AppState) -> Router {
        let router = self
            .stages
            .iter()
            .rev()
            .fold(router, |router, stage| stage.apply(router, &state));
        router.with_state(state)
    }
}
