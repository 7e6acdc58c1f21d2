use axum::{routing::get, Router};

use crate::api::handlers::{self, AppState};
use crate::store::RecordStore;

pub fn create_router<S: RecordStore + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check::<S>))
        // Sync runs
        .route(
            "/syncs",
            get(handlers::list_syncs::<S>).post(handlers::trigger_sync::<S>),
        )
        .route("/syncs/:sync_id", get(handlers::get_sync::<S>))
}
