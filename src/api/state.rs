use std::sync::Arc;

use crate::{jobs::SimilarityRefreshJob, services::RecommendationEngine};

/// Shared application state, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RecommendationEngine>,
    pub refresh_job: Arc<SimilarityRefreshJob>,
}

impl AppState {
    pub fn new(engine: Arc<RecommendationEngine>, refresh_job: Arc<SimilarityRefreshJob>) -> Self {
        Self {
            engine,
            refresh_job,
        }
    }
}
