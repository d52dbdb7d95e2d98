//! HTTP/JSON API and SSE live delivery.

pub mod error;
pub mod routes;
pub mod stream;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

pub use error::ApiError;
pub use routes::AppState;

/// Build the daemon's router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/features",
            post(routes::create_feature).get(routes::list_features),
        )
        .route(
            "/features/{id}",
            get(routes::get_feature).patch(routes::update_feature),
        )
        .route("/features/{id}/promote", post(routes::promote_feature))
        .route("/features/{id}/runs", get(routes::list_runs))
        .route("/queue", post(routes::enqueue))
        .route("/queue/summary", get(routes::queue_summary))
        .route("/agents/{agent}/queue", get(routes::list_queue))
        .route(
            "/agents/{agent}/queue/{job}",
            axum::routing::delete(routes::remove_job),
        )
        .route(
            "/agents/{agent}/queue/{job}/reorder",
            post(routes::reorder_job),
        )
        .route(
            "/sessions",
            post(routes::dispatch).get(routes::list_sessions),
        )
        .route("/sessions/{id}", axum::routing::delete(routes::end_session))
        .route("/sessions/{id}/messages", post(routes::send_turn))
        .route("/threads/{id}/messages", get(routes::thread_messages))
        .route("/streams/run/{id}", get(stream::run_stream))
        .route("/streams/thread/{id}", get(stream::thread_stream))
        .route("/streams/feed", get(stream::feed_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
