//! polyfier-api: HTTP surface of the Polyfier dispatcher.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/ws` | WebSocket upgrade; text frames carry envelopes |
//! | GET | `/api/v1/status` | Current registry snapshot |
//! | GET | `/api/v1/configs/{kind}/{hash}` | Stored configuration by content hash |
//! | GET | `/api/v1/workers/{key}/results` | Durable results of a worker |

pub mod handlers;
pub mod ws;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use axum::Router;
use axum::routing::get;
use polyfier_session::JobOrchestrator;
use polyfier_state::Persistence;

/// Shared state for handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<JobOrchestrator>,
    pub store: Arc<dyn Persistence>,
    next_session: Arc<AtomicU64>,
}

impl ApiState {
    pub fn new(orchestrator: Arc<JobOrchestrator>, store: Arc<dyn Persistence>) -> Self {
        Self {
            orchestrator,
            store,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Build the complete router (message channel + status API).
pub fn build_router(orchestrator: Arc<JobOrchestrator>, store: Arc<dyn Persistence>) -> Router {
    let state = ApiState::new(orchestrator, store);

    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/configs/{kind}/{hash}", get(handlers::get_config))
        .route("/workers/{key}/results", get(handlers::list_results))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws", get(ws::upgrade).with_state(state))
}
