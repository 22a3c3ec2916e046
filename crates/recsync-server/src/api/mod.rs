//! Status endpoint
//!
//! - `GET /health`: 200 when both the records database and the broker answer,
//!   503 otherwise
//! - `GET /stats`: queue message counts and the local consumer's state

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use sqlx::PgPool;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::db;
use crate::error::AppError;
use crate::queue::{ConsumerStatus, QueueHandle};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: QueueHandle,
    pub consumer: ConsumerStatus,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(tracing_layer())
        .with_state(state)
}

/// Request logging with tracing
pub fn tracing_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(
            DefaultOnResponse::new()
                .level(Level::INFO)
                .latency_unit(tower_http::LatencyUnit::Micros),
        )
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    db::health_check(&state.db)
        .await
        .map_err(|e| AppError::Unavailable(format!("Database is unavailable: {e}")))?;
    state.queue.broker().ping().await?;

    Ok(Json(json!({
        "status": "healthy",
        "database": "up",
        "broker": "up",
    })))
}

async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let messages = state.queue.stats().await?;
    let consumer = &state.consumer;

    Ok(Json(json!({
        "queue": state.queue.name(),
        "messages": messages,
        "consumer": {
            "name": consumer.name(),
            "state": consumer.state(),
            "in_flight": consumer.in_flight(),
            "prefetch_limit": consumer.prefetch_limit(),
        },
    })))
}
