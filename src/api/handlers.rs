use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    jobs::RefreshStats,
    models::{
        ClusterId, Location, Recommendation, RecommendationFilters, RecommendationKind,
        RecommendationRequest, RestaurantId, SimilarUser, SurveySubmission, UserId, UserProfile,
        WeightedRatingCell,
    },
    services::survey::SurveySummary,
};

use super::AppState;

const DEFAULT_LIMIT: usize = 10;
const DEFAULT_SIMILAR_LIMIT: usize = 20;

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_similar_limit() -> usize {
    DEFAULT_SIMILAR_LIMIT
}

// Request/Response types

#[derive(Debug, Deserialize)]
pub struct RecommendationBody {
    pub location: Option<Location>,
    #[serde(default)]
    pub filters: RecommendationFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default, rename = "type")]
    pub kind: RecommendationKind,
}

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    #[serde(default, rename = "type")]
    pub kind: RecommendationKind,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub max_distance_km: Option<f64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl RecommendationQuery {
    fn location(&self) -> AppResult<Option<Location>> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Ok(Some(Location { lat, lng })),
            (None, None) => Ok(None),
            _ => Err(AppError::InvalidInput(
                "lat and lng must be given together".to_string(),
            )),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RecommendationsResponse {
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: RecommendationKind,
    pub count: usize,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    #[serde(default = "default_similar_limit")]
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct SimilarUsersResponse {
    pub user_id: UserId,
    pub similar_users: Vec<SimilarUser>,
}

// Handlers

/// Health check endpoint
pub async fn health_check() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

fn validate_location(location: Option<Location>) -> AppResult<()> {
    if let Some(Location { lat, lng }) = location {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return Err(AppError::InvalidInput(
                "location is outside valid coordinates".to_string(),
            ));
        }
    }
    Ok(())
}

async fn run_recommendations(
    state: &AppState,
    request: RecommendationRequest,
) -> AppResult<Json<RecommendationsResponse>> {
    validate_location(request.location)?;
    let user_id = request.user_id;
    let kind = request.kind;

    let recommendations = state.engine.get_recommendations(request).await?;
    Ok(Json(RecommendationsResponse {
        user_id,
        kind,
        count: recommendations.len(),
        recommendations,
    }))
}

/// Recommendations with location, filters and limit in the body
pub async fn recommend(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(body): Json<RecommendationBody>,
) -> AppResult<Json<RecommendationsResponse>> {
    let request = RecommendationRequest {
        user_id,
        location: body.location,
        filters: body.filters,
        limit: body.limit,
        kind: body.kind,
    };
    run_recommendations(&state, request).await
}

/// `for-you`, `trending` or `favorites` list driven by query parameters
pub async fn recommend_by_kind(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<RecommendationQuery>,
) -> AppResult<Json<RecommendationsResponse>> {
    let request = RecommendationRequest {
        user_id,
        location: query.location()?,
        filters: RecommendationFilters {
            max_distance_km: query.max_distance_km,
            ..Default::default()
        },
        limit: query.limit,
        kind: query.kind,
    };
    run_recommendations(&state, request).await
}

/// Stores a bubble survey submission
pub async fn submit_survey(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(submission): Json<SurveySubmission>,
) -> AppResult<Json<SurveySummary>> {
    let summary = state.engine.submit_survey(user_id, submission).await?;
    Ok(Json(summary))
}

/// Taste profile diagnostics
pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> AppResult<Json<UserProfile>> {
    state
        .engine
        .get_user_profile(user_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no ratings for user {}", user_id)))
}

pub async fn get_similar_users(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<SimilarQuery>,
) -> AppResult<Json<SimilarUsersResponse>> {
    let similar_users = state.engine.get_similar_users(user_id, query.limit).await?;
    Ok(Json(SimilarUsersResponse {
        user_id,
        similar_users,
    }))
}

pub async fn get_cluster_rating(
    State(state): State<AppState>,
    Path((restaurant_id, cluster_id)): Path<(RestaurantId, ClusterId)>,
) -> AppResult<Json<WeightedRatingCell>> {
    state
        .engine
        .get_cluster_weighted_rating(restaurant_id, cluster_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no current rating for restaurant {} in cluster {}",
                restaurant_id, cluster_id
            ))
        })
}

/// Runs the similarity refresh now and reports what it did
pub async fn refresh_similarities(State(state): State<AppState>) -> Json<RefreshStats> {
    Json(state.refresh_job.run().await)
}
