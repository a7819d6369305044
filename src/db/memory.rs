use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::{
    db::RecommendationStore,
    error::AppResult,
    models::{
        ClusterId, RestaurantFeatures, RestaurantId, SurveyVector, UserId, UserRating,
        UserSimilarityEdge, WeightedRatingCell,
    },
};

/// Store kept entirely in process memory
///
/// Used by the test suites and for running the service without Postgres.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    restaurants: BTreeMap<RestaurantId, RestaurantFeatures>,
    inactive: BTreeSet<RestaurantId>,
    ratings: Vec<UserRating>,
    surveys: HashMap<UserId, SurveyVector>,
    edges: BTreeMap<(UserId, UserId), UserSimilarityEdge>,
    clusters: BTreeMap<UserId, ClusterId>,
    cells: BTreeMap<(RestaurantId, ClusterId), WeightedRatingCell>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_restaurant(&self, restaurant: RestaurantFeatures) {
        let mut inner = self.inner.write().await;
        inner.restaurants.insert(restaurant.id, restaurant);
    }

    /// Keeps the restaurant but hides it from candidate lists
    pub async fn deactivate_restaurant(&self, restaurant_id: RestaurantId) {
        let mut inner = self.inner.write().await;
        inner.inactive.insert(restaurant_id);
    }

    /// Records a rating, replacing any earlier rating of the same restaurant
    pub async fn insert_rating(&self, rating: UserRating) {
        let mut inner = self.inner.write().await;
        inner
            .ratings
            .retain(|r| !(r.user_id == rating.user_id && r.restaurant_id == rating.restaurant_id));
        inner.ratings.push(rating);
    }

    pub async fn similarity_edges(&self) -> Vec<UserSimilarityEdge> {
        let inner = self.inner.read().await;
        inner.edges.values().cloned().collect()
    }

    pub async fn cluster_assignments(&self) -> BTreeMap<UserId, ClusterId> {
        let inner = self.inner.read().await;
        inner.clusters.clone()
    }

    pub async fn weighted_rating_cells(&self) -> Vec<WeightedRatingCell> {
        let inner = self.inner.read().await;
        inner.cells.values().cloned().collect()
    }
}

#[async_trait]
impl RecommendationStore for InMemoryStore {
    async fn get_ratings(&self, user_id: UserId) -> AppResult<Vec<UserRating>> {
        let inner = self.inner.read().await;
        let mut ratings: Vec<UserRating> = inner
            .ratings
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        ratings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ratings)
    }

    async fn get_restaurant_features(
        &self,
        restaurant_id: RestaurantId,
    ) -> AppResult<Option<RestaurantFeatures>> {
        let inner = self.inner.read().await;
        Ok(inner.restaurants.get(&restaurant_id).cloned())
    }

    async fn list_restaurant_features(&self) -> AppResult<Vec<RestaurantFeatures>> {
        let inner = self.inner.read().await;
        Ok(inner
            .restaurants
            .values()
            .filter(|r| !inner.inactive.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn get_survey_vector(&self, user_id: UserId) -> AppResult<Option<SurveyVector>> {
        let inner = self.inner.read().await;
        Ok(inner.surveys.get(&user_id).cloned())
    }

    async fn save_survey_vector(&self, user_id: UserId, vector: SurveyVector) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.surveys.insert(user_id, vector);
        Ok(())
    }

    async fn survey_vectors(&self, user_ids: &[UserId]) -> AppResult<Vec<(UserId, SurveyVector)>> {
        let inner = self.inner.read().await;
        let mut vectors: Vec<(UserId, SurveyVector)> = user_ids
            .iter()
            .filter_map(|id| inner.surveys.get(id).map(|v| (*id, v.clone())))
            .collect();
        vectors.sort_by_key(|(id, _)| *id);
        vectors.dedup_by_key(|(id, _)| *id);
        Ok(vectors)
    }

    async fn active_user_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<UserId>> {
        let inner = self.inner.read().await;
        let users: BTreeSet<UserId> = inner
            .ratings
            .iter()
            .filter(|r| r.created_at > since)
            .map(|r| r.user_id)
            .collect();
        Ok(users.into_iter().collect())
    }

    async fn ratings_for_users(
        &self,
        user_ids: &[UserId],
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<UserRating>> {
        let inner = self.inner.read().await;
        let wanted: BTreeSet<UserId> = user_ids.iter().copied().collect();
        Ok(inner
            .ratings
            .iter()
            .filter(|r| wanted.contains(&r.user_id))
            .filter(|r| since.map(|s| r.created_at > s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn ratings_for_restaurants(
        &self,
        restaurant_ids: &[RestaurantId],
    ) -> AppResult<Vec<UserRating>> {
        let inner = self.inner.read().await;
        let wanted: BTreeSet<RestaurantId> = restaurant_ids.iter().copied().collect();
        Ok(inner
            .ratings
            .iter()
            .filter(|r| wanted.contains(&r.restaurant_id))
            .cloned()
            .collect())
    }

    async fn purge_similarity_edges(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.edges.len();
        inner.edges.retain(|_, e| e.last_computed >= older_than);
        Ok((before - inner.edges.len()) as u64)
    }

    async fn upsert_similarity_edges(&self, edges: &[UserSimilarityEdge]) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        for edge in edges {
            inner
                .edges
                .insert((edge.user_a, edge.user_b), edge.clone());
        }
        Ok(())
    }

    async fn read_similarity_edges(
        &self,
        user_ids: &[UserId],
    ) -> AppResult<Vec<UserSimilarityEdge>> {
        let inner = self.inner.read().await;
        let wanted: BTreeSet<UserId> = user_ids.iter().copied().collect();
        Ok(inner
            .edges
            .values()
            .filter(|e| wanted.contains(&e.user_a) || wanted.contains(&e.user_b))
            .cloned()
            .collect())
    }

    async fn set_user_cluster(&self, user_id: UserId, cluster_id: ClusterId) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        inner.clusters.insert(user_id, cluster_id);
        Ok(())
    }

    async fn get_user_cluster(&self, user_id: UserId) -> AppResult<Option<ClusterId>> {
        let inner = self.inner.read().await;
        Ok(inner.clusters.get(&user_id).copied())
    }

    async fn cluster_members(&self, cluster_id: ClusterId) -> AppResult<Vec<UserId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .clusters
            .iter()
            .filter(|(_, c)| **c == cluster_id)
            .map(|(u, _)| *u)
            .collect())
    }

    async fn upsert_weighted_rating_cells(&self, cells: &[WeightedRatingCell]) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        for cell in cells {
            inner
                .cells
                .insert((cell.restaurant_id, cell.cluster_id), cell.clone());
        }
        Ok(())
    }

    async fn read_weighted_rating_cell(
        &self,
        restaurant_id: RestaurantId,
        cluster_id: ClusterId,
    ) -> AppResult<Option<WeightedRatingCell>> {
        let inner = self.inner.read().await;
        Ok(inner.cells.get(&(restaurant_id, cluster_id)).cloned())
    }

    async fn cluster_cells(&self, cluster_id: ClusterId) -> AppResult<Vec<WeightedRatingCell>> {
        let inner = self.inner.read().await;
        Ok(inner
            .cells
            .values()
            .filter(|c| c.cluster_id == cluster_id)
            .cloned()
            .collect())
    }
}
