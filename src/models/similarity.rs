use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClusterId, RestaurantId, UserId};

/// Stored similarity between two users
///
/// The pair is always kept ordered (`user_a < user_b`) so each unordered pair
/// has exactly one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSimilarityEdge {
    pub user_a: UserId,
    pub user_b: UserId,
    pub rating_similarity: f64,
    pub preference_similarity: f64,
    pub overall_similarity: f64,
    pub common_restaurants: i32,
    pub last_computed: DateTime<Utc>,
}

impl UserSimilarityEdge {
    pub fn new(
        first: UserId,
        second: UserId,
        rating_similarity: f64,
        preference_similarity: f64,
        overall_similarity: f64,
        common_restaurants: i32,
        last_computed: DateTime<Utc>,
    ) -> Self {
        Self {
            user_a: first.min(second),
            user_b: first.max(second),
            rating_similarity,
            preference_similarity,
            overall_similarity,
            common_restaurants,
            last_computed,
        }
    }

    /// The other end of the edge, if `user_id` is on it
    pub fn other(&self, user_id: UserId) -> Option<UserId> {
        if self.user_a == user_id {
            Some(self.user_b)
        } else if self.user_b == user_id {
            Some(self.user_a)
        } else {
            None
        }
    }
}

/// A similar user as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarUser {
    pub user_id: UserId,
    pub similarity_score: f64,
    pub rating_similarity: f64,
    pub preference_similarity: f64,
    pub common_restaurants: i32,
}

/// Cluster-level weighted rating for one restaurant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedRatingCell {
    pub restaurant_id: RestaurantId,
    pub cluster_id: ClusterId,
    /// 1.0 - 5.0
    pub weighted_avg_rating: f64,
    /// 0.0 - 1.0, from the effective sample size
    pub confidence: f64,
    pub total_ratings: i32,
    pub rating_variance: f64,
    /// Mean of the last 60 days minus mean of everything older
    pub recent_trend: f64,
    pub last_computed: DateTime<Utc>,
}
