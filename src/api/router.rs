use axum::{Router, middleware, routing::get};

use crate::api::{
    ApiState, cors,
    error::error_envelope_mw,
    handlers::{file, health, ls, root_redirect, shutdown, status},
};

pub(crate) fn build_app(state: ApiState) -> Router<()> {
    Router::new()
        .route("/", get(root_redirect))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/ls", get(ls))
        .route("/files/*path", get(file))
        .route("/shutdown", get(shutdown).post(shutdown))
        .with_state(state)
        .layer(middleware::from_fn(cors::cors_mw))
        .layer(middleware::from_fn(error_envelope_mw))
}
