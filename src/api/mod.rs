//! Operator HTTP API.

pub mod error;
pub mod v1;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ApiConfig;
use crate::gateway::Gateway;

pub fn router(state: Arc<Gateway>, cfg: &ApiConfig) -> Router {
    Router::new()
        .nest("/api/v1", v1::router(state))
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    cfg.request_timeout_secs.max(1),
                ))),
        )
        .layer(TraceLayer::new_for_http())
}
