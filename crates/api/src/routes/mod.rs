//! HTTP routes

pub mod health;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/iyzico-webhook", post(webhook::iyzico_webhook))
        .with_state(state)
}
