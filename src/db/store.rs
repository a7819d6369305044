//! Persistence seam for the recommendation engine
//!
//! The live path only reads through this trait; the similarity refresh job is
//! the only caller of the write methods. Implementations must make every write
//! an idempotent upsert keyed by user pair, (restaurant, cluster) or user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::AppResult,
    models::{
        ClusterId, RestaurantFeatures, RestaurantId, SurveyVector, UserId, UserRating,
        UserSimilarityEdge, WeightedRatingCell,
    },
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    /// All ratings left by one user, newest first
    async fn get_ratings(&self, user_id: UserId) -> AppResult<Vec<UserRating>>;

    async fn get_restaurant_features(
        &self,
        restaurant_id: RestaurantId,
    ) -> AppResult<Option<RestaurantFeatures>>;

    /// Every active restaurant
    async fn list_restaurant_features(&self) -> AppResult<Vec<RestaurantFeatures>>;

    async fn get_survey_vector(&self, user_id: UserId) -> AppResult<Option<SurveyVector>>;

    async fn save_survey_vector(&self, user_id: UserId, vector: SurveyVector) -> AppResult<()>;

    /// Survey vectors for whichever of `user_ids` have one
    async fn survey_vectors(&self, user_ids: &[UserId]) -> AppResult<Vec<(UserId, SurveyVector)>>;

    /// Users with at least one rating created after `since`, ascending
    async fn active_user_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<UserId>>;

    /// Ratings by any of `user_ids`, optionally restricted to those after `since`
    async fn ratings_for_users(
        &self,
        user_ids: &[UserId],
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<UserRating>>;

    /// Ratings of any of `restaurant_ids`, by anyone
    async fn ratings_for_restaurants(
        &self,
        restaurant_ids: &[RestaurantId],
    ) -> AppResult<Vec<UserRating>>;

    /// Deletes edges computed before `older_than`, returning how many went
    async fn purge_similarity_edges(&self, older_than: DateTime<Utc>) -> AppResult<u64>;

    async fn upsert_similarity_edges(&self, edges: &[UserSimilarityEdge]) -> AppResult<()>;

    /// Edges touching any of `user_ids`
    async fn read_similarity_edges(&self, user_ids: &[UserId])
        -> AppResult<Vec<UserSimilarityEdge>>;

    async fn set_user_cluster(&self, user_id: UserId, cluster_id: ClusterId) -> AppResult<()>;

    async fn get_user_cluster(&self, user_id: UserId) -> AppResult<Option<ClusterId>>;

    async fn cluster_members(&self, cluster_id: ClusterId) -> AppResult<Vec<UserId>>;

    async fn upsert_weighted_rating_cells(&self, cells: &[WeightedRatingCell]) -> AppResult<()>;

    async fn read_weighted_rating_cell(
        &self,
        restaurant_id: RestaurantId,
        cluster_id: ClusterId,
    ) -> AppResult<Option<WeightedRatingCell>>;

    /// Every cell computed for one cluster
    async fn cluster_cells(&self, cluster_id: ClusterId) -> AppResult<Vec<WeightedRatingCell>>;
}
