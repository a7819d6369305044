//! The live recommendation pipeline
//!
//! [`RecommendationEngine`] is built once at startup and shared by every
//! request. It owns the store handle, the optional Redis cache and the engine
//! settings; nothing in it is mutated after construction.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::{
    cached,
    config::EngineSettings,
    db::{Cache, CacheKey, RecommendationStore},
    error::{AppError, AppResult},
    models::{
        ClusterId, Location, Recommendation, RecommendationFilters, RecommendationKind,
        RecommendationRequest, RestaurantFeatures, RestaurantId, SimilarUser, SurveySubmission,
        UserId, UserProfile, UserRating, WeightedRatingCell,
    },
    services::{
        diversity, geo,
        profile,
        scoring::{self, BlendWeights, Candidate, ComponentScores, ScoreMap, ScoredCandidate},
        similarity,
        survey::{self, SurveySummary},
    },
};

pub const MAX_LIMIT: usize = 100;
/// Stored edges at or below this are not reported as similar users
pub const SIMILAR_USER_THRESHOLD: f64 = 0.2;
/// Cluster cells older than this are treated as missing
pub const CELL_FRESHNESS_DAYS: i64 = 7;

/// Output of one pipeline run, as stored in the cache
#[derive(Debug, Serialize, Deserialize)]
struct ComputedList {
    recommendations: Vec<Recommendation>,
    /// Network scorers were dropped; never cached
    #[serde(default)]
    degraded: bool,
}

impl ComputedList {
    fn complete(recommendations: Vec<Recommendation>) -> Self {
        Self {
            recommendations,
            degraded: false,
        }
    }

    fn cacheable(&self) -> bool {
        !self.degraded
    }
}

pub struct RecommendationEngine {
    store: Arc<dyn RecommendationStore>,
    cache: Option<Cache>,
    settings: EngineSettings,
}

impl RecommendationEngine {
    pub fn new(
        store: Arc<dyn RecommendationStore>,
        cache: Option<Cache>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    /// Ranked recommendations for one request
    ///
    /// Only an invalid limit is reported as an error. Store or cache trouble
    /// degrades to the cold-start list and, failing that, to an empty list.
    ///
    /// When the collaborative and social scorers fail or exceed the latency
    /// budget, `for-you` and `favorites` lists are blended from content and
    /// temporal scores only, while `trending` is served the cold-start list
    /// minus restaurants the user already rated.
    /// Such degraded lists are returned but never cached.
    pub async fn get_recommendations(
        &self,
        request: RecommendationRequest,
    ) -> AppResult<Vec<Recommendation>> {
        if request.limit == 0 || request.limit > MAX_LIMIT {
            return Err(AppError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }

        let result = match &self.cache {
            Some(cache) => {
                let key = CacheKey::for_request(&request);
                cached!(
                    cache,
                    key,
                    self.settings.cache_ttl_secs,
                    self.compute(&request),
                    keep_if = ComputedList::cacheable
                )
            }
            None => self.compute(&request).await,
        }
        .map(|list| list.recommendations);

        match result {
            Ok(recommendations) => Ok(recommendations),
            Err(e) => {
                tracing::warn!(
                    user_id = request.user_id,
                    error = %e,
                    "Personalized recommendations failed, falling back to cold start"
                );
                match self.cold_start_from_store(&request).await {
                    Ok(recommendations) => Ok(recommendations),
                    Err(e) => {
                        tracing::error!(
                            user_id = request.user_id,
                            error = %e,
                            "Cold start fallback failed, returning no recommendations"
                        );
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    fn location(&self, request: &RecommendationRequest) -> Location {
        request.location.unwrap_or(Location {
            lat: self.settings.default_lat,
            lng: self.settings.default_lng,
        })
    }

    fn max_distance(&self, filters: &RecommendationFilters) -> f64 {
        filters
            .max_distance_km
            .unwrap_or(self.settings.default_max_distance_km)
    }

    /// Active restaurants that pass the filters and the hard radius, minus `exclude`
    fn gather_candidates(
        &self,
        catalog: &[RestaurantFeatures],
        request: &RecommendationRequest,
        exclude: &BTreeSet<RestaurantId>,
    ) -> Vec<Candidate> {
        let origin = self.location(request);
        let max_distance = self.max_distance(&request.filters);

        catalog
            .iter()
            .filter(|r| !exclude.contains(&r.id))
            .filter(|r| request.filters.admits(r))
            .filter_map(|r| {
                let distance_km = geo::haversine_km(
                    origin,
                    Location {
                        lat: r.latitude,
                        lng: r.longitude,
                    },
                );
                (distance_km <= max_distance).then(|| Candidate {
                    restaurant: r.clone(),
                    distance_km,
                })
            })
            .collect()
    }

    async fn cold_start_from_store(
        &self,
        request: &RecommendationRequest,
    ) -> AppResult<Vec<Recommendation>> {
        let catalog = self.store.list_restaurant_features().await?;
        Ok(self.cold_start(&catalog, request, &BTreeSet::new()))
    }

    fn cold_start(
        &self,
        catalog: &[RestaurantFeatures],
        request: &RecommendationRequest,
        exclude: &BTreeSet<RestaurantId>,
    ) -> Vec<Recommendation> {
        let candidates = self.gather_candidates(catalog, request, exclude);
        scoring::cold_start(candidates, request.limit)
            .into_iter()
            .map(|c| {
                let reasoning = match c.restaurant.cuisine_type.as_deref() {
                    Some(cuisine) => format!("Highly rated {} restaurant", cuisine),
                    None => "Highly rated restaurant".to_string(),
                };
                Recommendation {
                    restaurant_id: c.restaurant.id,
                    name: c.restaurant.name,
                    cuisine_type: c.restaurant.cuisine_type,
                    price_level: c.restaurant.price_level,
                    score: c.restaurant.avg_rating,
                    avg_rating: c.restaurant.avg_rating,
                    distance_km: Some(c.distance_km),
                    reasoning,
                    breakdown: None,
                }
            })
            .collect()
    }

    async fn compute(&self, request: &RecommendationRequest) -> AppResult<ComputedList> {
        let now = Utc::now();
        let user_id = request.user_id;

        let catalog = self.store.list_restaurant_features().await?;
        let by_id: HashMap<RestaurantId, RestaurantFeatures> =
            catalog.iter().map(|r| (r.id, r.clone())).collect();

        let history = profile::load_history(self.store.as_ref(), user_id, &by_id).await?;
        let survey = if history.is_empty() {
            None
        } else {
            self.store.get_survey_vector(user_id).await?
        };

        let Some(profile) = profile::build_profile(user_id, &history, survey, now) else {
            tracing::debug!(user_id, "No rating history, serving cold start list");
            return Ok(ComputedList::complete(self.cold_start(
                &catalog,
                request,
                &BTreeSet::new(),
            )));
        };

        let candidates = self.gather_candidates(&catalog, request, &profile.rated_restaurants);
        if candidates.is_empty() {
            tracing::info!(user_id, "No candidate restaurants after filtering");
            return Ok(ComputedList::complete(Vec::new()));
        }

        let base_weights = BlendWeights::for_profile(&profile);
        let mut weights = base_weights.for_kind(request.kind);

        let mut scores = ComponentScores {
            content: scoring::content_scores(&profile, &candidates),
            temporal: scoring::temporal_scores(&history, &candidates, now),
            ..Default::default()
        };

        let mut degraded = false;
        if weights.uses_network() {
            let budget = self.settings.scoring_budget;
            match tokio::time::timeout(budget, self.network_scores(&profile, &candidates, now)).await
            {
                Ok(Ok((collaborative, social))) => {
                    scores.collaborative = collaborative;
                    scores.social = social;
                }
                Ok(Err(e)) => {
                    tracing::warn!(user_id, error = %e, "Network scoring failed, using content and temporal only");
                    degraded = true;
                }
                Err(_) => {
                    tracing::warn!(
                        user_id,
                        budget_ms = budget.as_millis() as u64,
                        "Network scoring exceeded latency budget, using content and temporal only"
                    );
                    degraded = true;
                }
            }
        }

        if degraded {
            if request.kind == RecommendationKind::Trending {
                tracing::info!(user_id, "Trending list has no local scorers, serving cold start list");
                return Ok(ComputedList {
                    recommendations: self.cold_start(&catalog, request, &profile.rated_restaurants),
                    degraded,
                });
            }
            weights = base_weights.without_network();
        }

        let ranked = scoring::blend(&scores, weights, candidates);
        let selected = diversity::select_diverse(ranked, request.limit);

        tracing::debug!(user_id, kind = %request.kind, count = selected.len(), "Computed recommendations");

        Ok(ComputedList {
            recommendations: selected
                .into_iter()
                .map(|item| to_recommendation(item, weights, &profile))
                .collect(),
            degraded,
        })
    }

    /// Collaborative and social-proof maps, fetched concurrently
    async fn network_scores(
        &self,
        profile: &UserProfile,
        candidates: &[Candidate],
        now: DateTime<Utc>,
    ) -> AppResult<(ScoreMap, ScoreMap)> {
        let (collaborative, social) = tokio::join!(
            self.collaborative(profile.user_id, candidates),
            self.social(profile, candidates, now)
        );
        Ok((collaborative?, social?))
    }

    async fn collaborative(&self, user_id: UserId, candidates: &[Candidate]) -> AppResult<ScoreMap> {
        let edges = self.store.read_similarity_edges(&[user_id]).await?;
        let neighbours = scoring::top_neighbours(user_id, &edges);
        if neighbours.is_empty() {
            return Ok(ScoreMap::new());
        }

        let ids: Vec<UserId> = neighbours.iter().map(|(id, _)| *id).collect();
        let ratings = self.store.ratings_for_users(&ids, None).await?;
        Ok(scoring::collaborative_scores(&neighbours, &ratings, candidates))
    }

    async fn social(
        &self,
        profile: &UserProfile,
        candidates: &[Candidate],
        now: DateTime<Utc>,
    ) -> AppResult<ScoreMap> {
        let rated: Vec<RestaurantId> = profile.rated_restaurants.iter().copied().collect();
        let co_ratings = self.store.ratings_for_restaurants(&rated).await?;
        let matrix = similarity::rating_matrix(&co_ratings);
        let target_row = matrix.get(&profile.user_id).cloned().unwrap_or_default();
        let neighbours = similarity::social_neighbours(profile.user_id, &target_row, &matrix);

        let neighbour_ratings: Vec<UserRating> = if neighbours.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<UserId> = neighbours.iter().map(|(id, _)| *id).collect();
            self.store.ratings_for_users(&ids, None).await?
        };

        let cells = match self.store.get_user_cluster(profile.user_id).await? {
            Some(cluster) => {
                let cutoff = now - Duration::days(CELL_FRESHNESS_DAYS);
                let mut cells = self.store.cluster_cells(cluster).await?;
                cells.retain(|c| c.last_computed > cutoff);
                cells
            }
            None => Vec::new(),
        };

        Ok(scoring::social_scores(&neighbours, &neighbour_ratings, &cells, candidates))
    }

    /// Taste profile diagnostics; `None` for a user with no ratings
    pub async fn get_user_profile(&self, user_id: UserId) -> AppResult<Option<UserProfile>> {
        profile::load_profile(self.store.as_ref(), user_id, Utc::now()).await
    }

    /// Most similar users from the stored graph
    pub async fn get_similar_users(&self, user_id: UserId, limit: usize) -> AppResult<Vec<SimilarUser>> {
        let edges = self.store.read_similarity_edges(&[user_id]).await?;

        let mut best: BTreeMap<UserId, SimilarUser> = BTreeMap::new();
        for edge in edges.iter().filter(|e| e.overall_similarity > SIMILAR_USER_THRESHOLD) {
            let Some(other) = edge.other(user_id) else {
                continue;
            };
            best.entry(other).or_insert(SimilarUser {
                user_id: other,
                similarity_score: edge.overall_similarity,
                rating_similarity: edge.rating_similarity,
                preference_similarity: edge.preference_similarity,
                common_restaurants: edge.common_restaurants,
            });
        }

        let mut similar: Vec<SimilarUser> = best.into_values().collect();
        similar.sort_by(|a, b| {
            b.similarity_score
                .total_cmp(&a.similarity_score)
                .then(a.user_id.cmp(&b.user_id))
        });
        similar.truncate(limit);
        Ok(similar)
    }

    /// A cluster's weighted rating for a restaurant, if computed in the last week
    pub async fn get_cluster_weighted_rating(
        &self,
        restaurant_id: RestaurantId,
        cluster_id: ClusterId,
    ) -> AppResult<Option<WeightedRatingCell>> {
        let cutoff = Utc::now() - Duration::days(CELL_FRESHNESS_DAYS);
        let cell = self
            .store
            .read_weighted_rating_cell(restaurant_id, cluster_id)
            .await?;
        Ok(cell.filter(|c| c.last_computed > cutoff))
    }

    /// Stores a bubble survey and drops the user's cached lists
    pub async fn submit_survey(
        &self,
        user_id: UserId,
        submission: SurveySubmission,
    ) -> AppResult<SurveySummary> {
        submission.validate()?;
        let vector = survey::build_vector(&submission)?;
        let summary = survey::summarize(&submission, &vector);

        self.store.save_survey_vector(user_id, vector).await?;
        self.invalidate_user(user_id).await;

        tracing::info!(
            user_id,
            strength = summary.preference_strength,
            confidence = summary.profile_confidence,
            "Stored survey preferences"
        );
        Ok(summary)
    }

    /// Drops cached lists for a user; cache failures are only logged
    pub async fn invalidate_user(&self, user_id: UserId) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate_user(user_id).await {
                tracing::warn!(user_id, error = %e, "Failed to invalidate cached recommendations");
            }
        }
    }
}

fn to_recommendation(item: ScoredCandidate, weights: BlendWeights, profile: &UserProfile) -> Recommendation {
    let reasoning = reasoning(&item, weights, profile);
    let restaurant = item.candidate.restaurant;
    Recommendation {
        restaurant_id: restaurant.id,
        name: restaurant.name,
        cuisine_type: restaurant.cuisine_type,
        price_level: restaurant.price_level,
        avg_rating: restaurant.avg_rating,
        score: item.score,
        distance_km: Some(item.candidate.distance_km),
        reasoning,
        breakdown: Some(item.breakdown),
    }
}

/// Human-readable explanation built from the strongest signal
pub fn reasoning(item: &ScoredCandidate, weights: BlendWeights, profile: &UserProfile) -> String {
    let restaurant = &item.candidate.restaurant;
    let b = &item.breakdown;
    let mut parts: Vec<String> = Vec::new();

    let contributions = [
        ("collaborative", b.collaborative * weights.collaborative),
        ("content", b.content * weights.content),
        ("social", b.social * weights.social),
        ("temporal", b.temporal * weights.temporal),
    ];
    let dominant = contributions
        .iter()
        .filter(|(_, v)| *v > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1));

    if let Some((component, _)) = dominant {
        let phrase = match *component {
            "collaborative" => "Loved by diners with similar taste".to_string(),
            "social" => "Popular with people like you".to_string(),
            "temporal" => "In line with what you've enjoyed lately".to_string(),
            _ => match restaurant.cuisine_type.as_deref() {
                Some(cuisine) if profile.cuisine_affinity(Some(cuisine)) > 0.0 => {
                    format!("Matches your taste for {}", cuisine)
                }
                _ => "Matches your preferences".to_string(),
            },
        };
        parts.push(phrase);
    }

    if restaurant.avg_rating > 4.0 {
        parts.push(format!("Highly rated ({:.1}/5)", restaurant.avg_rating));
    }
    if item.candidate.distance_km < 1.0 {
        parts.push("Close to you".to_string());
    }

    if parts.is_empty() {
        "New restaurant to explore".to_string()
    } else {
        parts.join(" · ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_redis_client, InMemoryStore, MockRecommendationStore};
    use crate::models::{Cuisine, ScoreBreakdown, SurveyAnswer, SurveyVector, UserSimilarityEdge};
    use crate::services::profile::{tests::restaurant, RatedRestaurant};
    use async_trait::async_trait;

    const HERE: Location = Location {
        lat: 35.9132,
        lng: -79.0558,
    };

    fn request(user_id: UserId, limit: usize) -> RecommendationRequest {
        RecommendationRequest {
            user_id,
            location: Some(HERE),
            filters: RecommendationFilters::default(),
            limit,
            kind: RecommendationKind::ForYou,
        }
    }

    fn rating(user_id: UserId, restaurant_id: RestaurantId, stars: f64) -> UserRating {
        UserRating {
            user_id,
            restaurant_id,
            rating: stars,
            created_at: Utc::now() - Duration::days(1),
        }
    }

    async fn seeded_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        let cuisines = ["Italian", "Thai", "Mexican", "Korean", "Indian"];
        for id in 1..=20 {
            let mut r = restaurant(id, cuisines[id as usize % 5], (id % 4 + 1) as i16, 3.5 + (id % 4) as f64 * 0.4);
            r.latitude += id as f64 * 0.001;
            store.insert_restaurant(r).await;
        }
        // user 1 and 2 agree closely, user 3 is their opposite
        for (restaurant_id, stars) in [(1, 5.0), (2, 4.0), (3, 5.0), (4, 2.0)] {
            store.insert_rating(rating(1, restaurant_id, stars)).await;
            store.insert_rating(rating(2, restaurant_id, stars)).await;
        }
        for (restaurant_id, stars) in [(5, 5.0), (6, 5.0), (7, 4.0)] {
            store.insert_rating(rating(2, restaurant_id, stars)).await;
        }
        store
    }

    fn engine(store: Arc<dyn RecommendationStore>) -> RecommendationEngine {
        RecommendationEngine::new(store, None, EngineSettings::default())
    }

    #[tokio::test]
    async fn test_invalid_limit() {
        let engine = engine(seeded_store().await);
        assert!(matches!(
            engine.get_recommendations(request(1, 0)).await,
            Err(AppError::InvalidInput(_))
        ));
        tokio_test::assert_err!(engine.get_recommendations(request(1, MAX_LIMIT + 1)).await);
    }

    #[tokio::test]
    async fn test_zero_rating_user_gets_cold_start() {
        let engine = engine(seeded_store().await);
        let recs = engine.get_recommendations(request(99, 5)).await.unwrap();

        assert!(!recs.is_empty());
        assert!(recs.iter().all(|r| r.avg_rating >= 4.0));
        assert!(recs.iter().all(|r| r.breakdown.is_none()));
        assert!(recs.iter().all(|r| r.reasoning.starts_with("Highly rated")));
        assert!(recs.windows(2).all(|w| w[0].avg_rating >= w[1].avg_rating));
    }

    #[tokio::test]
    async fn test_rated_restaurants_never_recommended() {
        let store = seeded_store().await;
        store
            .upsert_similarity_edges(&[UserSimilarityEdge::new(1, 2, 1.0, 0.0, 0.7, 4, Utc::now())])
            .await
            .unwrap();
        let engine = engine(store);

        let recs = engine.get_recommendations(request(1, 10)).await.unwrap();
        assert!(!recs.is_empty());
        assert!(recs.iter().all(|r| ![1, 2, 3, 4].contains(&r.restaurant_id)));
        assert!(recs.iter().all(|r| !r.reasoning.is_empty()));
        assert!(recs.iter().all(|r| r.breakdown.is_some()));

        // restaurants only the neighbour has rated carry collaborative signal
        assert!(recs
            .iter()
            .any(|r| r.breakdown.unwrap().collaborative > 0.0));
    }

    #[tokio::test]
    async fn test_variants_only_use_their_components() {
        let store = seeded_store().await;
        store
            .upsert_similarity_edges(&[UserSimilarityEdge::new(1, 2, 1.0, 0.0, 0.7, 4, Utc::now())])
            .await
            .unwrap();
        let engine = engine(store);

        let mut trending = request(1, 10);
        trending.kind = RecommendationKind::Trending;
        let recs = engine.get_recommendations(trending).await.unwrap();
        assert!(!recs.is_empty());
        let personal = ["Matches your", "In line with"];
        assert!(recs
            .iter()
            .all(|r| personal.iter().all(|p| !r.reasoning.starts_with(p))));

        let mut favorites = request(1, 10);
        favorites.kind = RecommendationKind::SimilarToFavorites;
        let recs = engine.get_recommendations(favorites).await.unwrap();
        assert!(!recs.is_empty());
    }

    #[tokio::test]
    async fn test_filters_and_radius_apply() {
        let engine = engine(seeded_store().await);
        let mut req = request(1, 10);
        req.filters.cuisines = vec!["thai".to_string()];
        req.filters.max_distance_km = Some(1.0);

        let recs = engine.get_recommendations(req).await.unwrap();
        assert!(recs.iter().all(|r| r.cuisine_type.as_deref() == Some("Thai")));
        assert!(recs.iter().all(|r| r.distance_km.unwrap() <= 1.0));
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_cold_start() {
        let mut store = MockRecommendationStore::new();
        store
            .expect_list_restaurant_features()
            .returning(|| Ok(vec![restaurant(1, "Thai", 1, 4.5), restaurant(2, "Thai", 1, 3.0)]));
        store
            .expect_get_ratings()
            .returning(|_| Err(AppError::Internal("connection reset".to_string())));

        let engine = engine(Arc::new(store));
        let recs = engine.get_recommendations(request(1, 5)).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].restaurant_id, 1);
    }

    #[tokio::test]
    async fn test_total_store_failure_gives_empty_list() {
        let mut store = MockRecommendationStore::new();
        store
            .expect_list_restaurant_features()
            .returning(|| Err(AppError::Internal("database unavailable".to_string())));

        let engine = engine(Arc::new(store));
        let recs = engine.get_recommendations(request(1, 5)).await.unwrap();
        assert!(recs.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_cache_still_serves() {
        let client = create_redis_client("redis://127.0.0.1:1").unwrap();
        let (cache, _handle) = Cache::new(client, std::time::Duration::from_millis(50)).await;
        let engine = RecommendationEngine::new(seeded_store().await, Some(cache), EngineSettings::default());

        let recs = engine.get_recommendations(request(1, 5)).await.unwrap();
        assert!(!recs.is_empty());
    }

    /// Delegates to an in-memory store but stalls on similarity reads
    struct SlowEdges {
        inner: Arc<InMemoryStore>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl RecommendationStore for SlowEdges {
        async fn get_ratings(&self, user_id: UserId) -> AppResult<Vec<UserRating>> {
            self.inner.get_ratings(user_id).await
        }
        async fn get_restaurant_features(&self, id: RestaurantId) -> AppResult<Option<RestaurantFeatures>> {
            self.inner.get_restaurant_features(id).await
        }
        async fn list_restaurant_features(&self) -> AppResult<Vec<RestaurantFeatures>> {
            self.inner.list_restaurant_features().await
        }
        async fn get_survey_vector(&self, user_id: UserId) -> AppResult<Option<SurveyVector>> {
            self.inner.get_survey_vector(user_id).await
        }
        async fn save_survey_vector(&self, user_id: UserId, vector: SurveyVector) -> AppResult<()> {
            self.inner.save_survey_vector(user_id, vector).await
        }
        async fn survey_vectors(&self, ids: &[UserId]) -> AppResult<Vec<(UserId, SurveyVector)>> {
            self.inner.survey_vectors(ids).await
        }
        async fn active_user_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<UserId>> {
            self.inner.active_user_ids(since).await
        }
        async fn ratings_for_users(
            &self,
            ids: &[UserId],
            since: Option<DateTime<Utc>>,
        ) -> AppResult<Vec<UserRating>> {
            self.inner.ratings_for_users(ids, since).await
        }
        async fn ratings_for_restaurants(&self, ids: &[RestaurantId]) -> AppResult<Vec<UserRating>> {
            self.inner.ratings_for_restaurants(ids).await
        }
        async fn purge_similarity_edges(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
            self.inner.purge_similarity_edges(older_than).await
        }
        async fn upsert_similarity_edges(&self, edges: &[UserSimilarityEdge]) -> AppResult<()> {
            self.inner.upsert_similarity_edges(edges).await
        }
        async fn read_similarity_edges(&self, ids: &[UserId]) -> AppResult<Vec<UserSimilarityEdge>> {
            tokio::time::sleep(self.delay).await;
            self.inner.read_similarity_edges(ids).await
        }
        async fn set_user_cluster(&self, user_id: UserId, cluster_id: ClusterId) -> AppResult<()> {
            self.inner.set_user_cluster(user_id, cluster_id).await
        }
        async fn get_user_cluster(&self, user_id: UserId) -> AppResult<Option<ClusterId>> {
            self.inner.get_user_cluster(user_id).await
        }
        async fn cluster_members(&self, cluster_id: ClusterId) -> AppResult<Vec<UserId>> {
            self.inner.cluster_members(cluster_id).await
        }
        async fn upsert_weighted_rating_cells(&self, cells: &[WeightedRatingCell]) -> AppResult<()> {
            self.inner.upsert_weighted_rating_cells(cells).await
        }
        async fn read_weighted_rating_cell(
            &self,
            restaurant_id: RestaurantId,
            cluster_id: ClusterId,
        ) -> AppResult<Option<WeightedRatingCell>> {
            self.inner.read_weighted_rating_cell(restaurant_id, cluster_id).await
        }
        async fn cluster_cells(&self, cluster_id: ClusterId) -> AppResult<Vec<WeightedRatingCell>> {
            self.inner.cluster_cells(cluster_id).await
        }
    }

    #[tokio::test]
    async fn test_latency_budget_drops_network_scores() {
        let inner = seeded_store().await;
        inner
            .upsert_similarity_edges(&[UserSimilarityEdge::new(1, 2, 1.0, 0.0, 0.7, 4, Utc::now())])
            .await
            .unwrap();
        let store = SlowEdges {
            inner,
            delay: std::time::Duration::from_millis(500),
        };
        let settings = EngineSettings {
            scoring_budget: std::time::Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let engine = RecommendationEngine::new(Arc::new(store), None, settings);

        let recs = engine.get_recommendations(request(1, 10)).await.unwrap();
        assert!(!recs.is_empty());
        assert!(recs.iter().all(|r| {
            let b = r.breakdown.unwrap();
            b.collaborative == 0.0 && b.social == 0.0
        }));
    }

    async fn slow_engine() -> RecommendationEngine {
        let inner = seeded_store().await;
        inner
            .upsert_similarity_edges(&[UserSimilarityEdge::new(1, 2, 1.0, 0.0, 0.7, 4, Utc::now())])
            .await
            .unwrap();
        let store = SlowEdges {
            inner,
            delay: std::time::Duration::from_millis(500),
        };
        let settings = EngineSettings {
            scoring_budget: std::time::Duration::from_millis(20),
            ..EngineSettings::default()
        };
        RecommendationEngine::new(Arc::new(store), None, settings)
    }

    #[tokio::test]
    async fn test_budget_overrun_marks_list_uncacheable() {
        let engine = slow_engine().await;

        let list = engine.compute(&request(1, 10)).await.unwrap();
        assert!(list.degraded);
        assert!(!list.cacheable());
        assert!(!list.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_full_pipeline_is_cacheable() {
        let engine = engine(seeded_store().await);
        let list = engine.compute(&request(1, 10)).await.unwrap();
        assert!(list.cacheable());
    }

    #[tokio::test]
    async fn test_trending_budget_overrun_serves_unrated_cold_start() {
        let engine = slow_engine().await;
        let mut trending = request(1, 10);
        trending.kind = RecommendationKind::Trending;

        let list = engine.compute(&trending).await.unwrap();
        assert!(list.degraded);
        assert!(!list.recommendations.is_empty());

        let rated: BTreeSet<RestaurantId> = engine
            .store
            .get_ratings(1)
            .await
            .unwrap()
            .iter()
            .map(|r| r.restaurant_id)
            .collect();
        for rec in &list.recommendations {
            assert!(rec.breakdown.is_none());
            assert!(rec.avg_rating >= scoring::COLD_START_MIN_RATING);
            assert!(!rated.contains(&rec.restaurant_id));
        }
    }

    #[tokio::test]
    async fn test_similar_users_and_cluster_rating() {
        let store = seeded_store().await;
        let now = Utc::now();
        store
            .upsert_similarity_edges(&[
                UserSimilarityEdge::new(1, 2, 0.9, 0.5, 0.78, 4, now),
                UserSimilarityEdge::new(3, 1, 0.2, 0.0, 0.16, 2, now),
                UserSimilarityEdge::new(4, 1, 0.6, 0.0, 0.42, 3, now),
            ])
            .await
            .unwrap();
        store
            .upsert_weighted_rating_cells(&[
                WeightedRatingCell {
                    restaurant_id: 5,
                    cluster_id: 1,
                    weighted_avg_rating: 4.4,
                    confidence: 0.6,
                    total_ratings: 5,
                    rating_variance: 0.3,
                    recent_trend: 0.1,
                    last_computed: now,
                },
                WeightedRatingCell {
                    restaurant_id: 6,
                    cluster_id: 1,
                    weighted_avg_rating: 3.1,
                    confidence: 0.6,
                    total_ratings: 5,
                    rating_variance: 0.3,
                    recent_trend: 0.0,
                    last_computed: now - Duration::days(8),
                },
            ])
            .await
            .unwrap();
        let engine = engine(store);

        let similar = engine.get_similar_users(1, 10).await.unwrap();
        let ids: Vec<UserId> = similar.iter().map(|s| s.user_id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(engine.get_similar_users(1, 1).await.unwrap().len(), 1);

        assert!(engine.get_cluster_weighted_rating(5, 1).await.unwrap().is_some());
        assert!(engine.get_cluster_weighted_rating(6, 1).await.unwrap().is_none());
        assert!(engine.get_cluster_weighted_rating(5, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_survey_feeds_content_score() {
        let store = seeded_store().await;
        let engine = engine(store.clone());

        let mut submission = SurveySubmission {
            total_rounds_completed: 3,
            ..Default::default()
        };
        submission.cuisine_preferences.insert(
            Cuisine::Korean,
            SurveyAnswer {
                weight: 9.0,
                round_survived: 3,
                selection_order: 1,
            },
        );

        let summary = engine.submit_survey(1, submission).await.unwrap();
        assert!((summary.profile_confidence - 1.0 / 6.0).abs() < 1e-9);
        assert!(store.get_survey_vector(1).await.unwrap().is_some());

        let profile = engine.get_user_profile(1).await.unwrap().unwrap();
        assert!(profile.survey.is_some());
        assert_eq!(profile.total_ratings, 4);
    }

    #[tokio::test]
    async fn test_invalid_survey_rejected() {
        let engine = engine(seeded_store().await);
        let submission = SurveySubmission {
            total_rounds_completed: 0,
            ..Default::default()
        };
        assert!(matches!(
            engine.submit_survey(1, submission).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_reasoning_never_empty() {
        let now = Utc::now();
        let profile = profile::build_profile(
            1,
            &[RatedRestaurant {
                rating: UserRating {
                    user_id: 1,
                    restaurant_id: 1,
                    rating: 5.0,
                    created_at: now,
                },
                restaurant: restaurant(1, "Thai", 1, 4.0),
            }],
            None,
            now,
        )
        .unwrap();

        let item = |breakdown: ScoreBreakdown, avg: f64, distance: f64| ScoredCandidate {
            candidate: Candidate {
                restaurant: restaurant(2, "Thai", 2, avg),
                distance_km: distance,
            },
            score: 0.0,
            breakdown,
        };
        let weights = BlendWeights::new(0.4, 0.3, 0.2, 0.1);

        let quiet = reasoning(&item(Default::default(), 3.0, 5.0), weights, &profile);
        assert_eq!(quiet, "New restaurant to explore");

        let content = ScoreBreakdown {
            content: 1.0,
            ..Default::default()
        };
        let text = reasoning(&item(content, 4.6, 0.3), weights, &profile);
        assert_eq!(text, "Matches your taste for Thai · Highly rated (4.6/5) · Close to you");
    }
}
