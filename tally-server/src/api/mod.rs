//! HTTP routes

pub mod health;

use axum::Router;
use axum::routing::get;

use crate::engine::Engine;

pub fn create_router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .with_state(engine)
}
