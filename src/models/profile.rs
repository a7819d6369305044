use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use super::{RestaurantId, SurveyVector, UserId};

/// How a user rates restaurants at one price level
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceSensitivity {
    pub avg_rating: f64,
    pub count: usize,
    /// `avg_rating / 5 * min(count / 5, 1)`
    pub preference_score: f64,
}

/// Snapshot of a user's taste, rebuilt on demand from rating history
///
/// Never persisted. Any new rating or survey makes it stale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    pub user_id: UserId,
    /// Keyed by the restaurant's cuisine label
    pub cuisine_affinities: BTreeMap<String, f64>,
    /// Keyed by price level (1-4)
    pub price_sensitivity: BTreeMap<i16, PriceSensitivity>,
    /// Mean of (user rating - restaurant average); positive means a generous rater
    pub quality_standards: f64,
    /// Distinct cuisines rated / total ratings
    pub exploration_ratio: f64,
    pub survey: Option<SurveyVector>,
    pub total_ratings: usize,
    pub avg_personal_rating: f64,
    pub rating_variance: f64,
    pub rated_restaurants: BTreeSet<RestaurantId>,
    pub built_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn cuisine_affinity(&self, cuisine: Option<&str>) -> f64 {
        cuisine
            .and_then(|c| self.cuisine_affinities.get(c))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn price_preference(&self, price_level: Option<i16>) -> f64 {
        price_level
            .and_then(|p| self.price_sensitivity.get(&p))
            .map(|p| p.preference_score)
            .unwrap_or(0.0)
    }
}
