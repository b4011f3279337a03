//! HTTP router module
//!
//! Exposes the RPC surface: container lifecycle, execution, mounts,
//! capabilities, plus a websocket stream of asynchronous events.

pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::agent::Agent;
use crate::config::Configuration;
use crate::events::EventBus;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// The agent; the mutex serializes RPC handlers
    pub agent: Arc<Mutex<Agent>>,

    /// Event bus for asynchronous notifications
    pub events: EventBus,

    /// Global configuration
    pub config: Arc<Configuration>,
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // System routes
        .route("/system", get(handlers::system::system_info))
        .route("/events", get(handlers::events::ws_handler))

        // Capabilities
        .route("/capabilities", get(handlers::containers::list_capabilities))

        // Container collection routes
        .route("/containers", get(handlers::containers::list_containers))
        .route("/containers", post(handlers::containers::create_container))

        // Individual container routes
        .nest("/containers/:container_id", container_routes());

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Routes for individual container operations
fn container_routes() -> Router<AppState> {
    Router::new()
        .route("/", delete(handlers::containers::destroy_container))
        .route("/execute", post(handlers::containers::execute))
        .route("/suspend", post(handlers::containers::suspend_container))
        .route("/resume", post(handlers::containers::resume_container))
        .route("/mounts", post(handlers::containers::bind_mount))
        .route(
            "/capabilities",
            post(handlers::containers::set_capabilities),
        )
}
