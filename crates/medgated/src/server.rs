//! HTTP server for medgated

use crate::mediator::Mediator;
use crate::routes;
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub mediator: Arc<Mediator>,
    pub start_time: Instant,
    /// Largest batch accepted by /v1/batch
    pub max_batch_size: usize,
}

impl AppState {
    pub fn new(mediator: Arc<Mediator>, max_batch_size: usize) -> Self {
        Self {
            mediator,
            start_time: Instant::now(),
            max_batch_size,
        }
    }
}

/// Full router with tracing and a panic catcher, used by `run` and by tests
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::process_routes())
        .merge(routes::workflow_routes())
        .merge(routes::audit_routes())
        .merge(routes::health_routes())
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server
pub async fn run(state: AppState, addr: &str) -> Result<()> {
    let app = app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
