//! HTTP surface (axum). Thin adapter: validate, call Repository, serialize.
//!
//! Grounded on the daemon's `rest::build_router`/`start_rest_server` shape
//! (`Router::new().route(...).with_state(ctx)`) and `rest/routes/health.rs`'s
//! thin-handler style. The streaming endpoint departs from `rest/sse.rs`'s
//! broadcast-subscribe `Sse` framing — it instead polls the Repository and
//! emits bare NDJSON lines, per the durable-queue's polling contract.

pub mod envelope;
mod routes;
mod run_stream;

use crate::GatewayState;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/tasks/queue", post(routes::queue_task))
        .route("/tasks/run", post(run_stream::run_task))
        .route("/tasks", get(routes::list_tasks))
        .route("/tasks/{id}", get(routes::get_task))
        .route("/tasks/{id}/attempts", get(routes::list_attempts))
        .route(
            "/tasks/{id}/events",
            get(routes::list_task_events).post(routes::post_event),
        )
        .route("/tasks/lease", post(routes::lease_task))
        .route("/tasks/{id}/heartbeat", post(routes::heartbeat))
        .route("/tasks/{id}/complete", post(routes::complete_task))
        .route("/events", get(routes::list_events))
        .route(
            "/state/{key}",
            get(routes::get_state).post(routes::set_state),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(state: GatewayState) -> Result<()> {
    let port = state.config.api_port;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let router = build_router(state);

    info!("gateway listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
