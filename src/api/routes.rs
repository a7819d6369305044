use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;
use super::AppState;
use crate::middleware::{make_span_with_request_id, request_id_middleware};

/// Creates the application router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(make_span_with_request_id))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
}

/// API routes under /api/v1
fn api_routes() -> Router<AppState> {
    Router::new()
        // Recommendations
        .route(
            "/users/:user_id/recommendations",
            post(handlers::recommend).get(handlers::recommend_by_kind),
        )
        // Taste data
        .route("/users/:user_id/survey", put(handlers::submit_survey))
        .route("/users/:user_id/profile", get(handlers::get_profile))
        .route("/users/:user_id/similar", get(handlers::get_similar_users))
        .route(
            "/restaurants/:restaurant_id/clusters/:cluster_id/rating",
            get(handlers::get_cluster_rating),
        )
        // Maintenance
        .route("/maintenance/similarity", post(handlers::refresh_similarities))
}
