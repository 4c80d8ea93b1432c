//! comfy-relay: a thin proxy in front of a headless ComfyUI instance that
//! tracks job lifecycles, detects finished outputs, and delivers them to
//! durable object storage.
//!
//! The binary in `main.rs` wires these modules together; the library split
//! exists so integration tests can drive the pipeline against mock storage
//! and stub engine servers.

pub mod api;
pub mod config;
pub mod engine;
pub mod events;
pub mod models;
pub mod notify;
pub mod registry;
pub mod shutdown;
pub mod storage;
pub mod upload;
pub mod watcher;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
pub struct AppState {
    pub config: config::Config,
    pub registry: registry::JobRegistry,
    pub engine: engine::EngineClient,
    pub watcher: watcher::CompletionWatcher,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/system_stats", get(api::system_stats))
        .route("/prompt", post(api::submit_prompt))
        .route("/object_info", get(api::object_info))
        .route("/queue", get(api::queue))
        .route("/history", get(api::history_all))
        .route("/history/{prompt_id}", get(api::history))
        .route("/view", get(api::view))
        .route("/progress-status", get(api::progress_status))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
