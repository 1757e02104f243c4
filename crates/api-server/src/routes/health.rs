//! Health check endpoint

use axum::{routing::get, Router};

use crate::state::AppState;

async fn health_check() -> &'static str {
    "Agent Relay is running!"
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
