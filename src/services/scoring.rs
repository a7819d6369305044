//! Scorer: the four component score maps, the profile-dependent blend and the
//! cold-start popularity list.
//!
//! Every map is keyed only by candidate restaurants, which never include
//! restaurants the user has already rated.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::{
    models::{
        PreferenceCategory, RecommendationKind, RestaurantFeatures, RestaurantId, ScoreBreakdown,
        SurveyVector, UserId, UserProfile, UserRating, UserSimilarityEdge, WeightedRatingCell,
    },
    services::{geo, profile::RatedRestaurant},
};

pub const COLLABORATIVE_NEIGHBOURS: usize = 20;
pub const COLLABORATIVE_MIN_SIMILARITY: f64 = 0.1;
pub const COLD_START_MIN_RATING: f64 = 4.0;

const TEMPORAL_WINDOW_DAYS: i64 = 180;
const TEMPORAL_DECAY_DAYS: f64 = 30.0;

pub type ScoreMap = HashMap<RestaurantId, f64>;

/// A restaurant that passed the filters, with its distance from the request
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub restaurant: RestaurantFeatures,
    pub distance_km: f64,
}

/// Weights applied to (collaborative, content, social, temporal)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendWeights {
    pub collaborative: f64,
    pub content: f64,
    pub social: f64,
    pub temporal: f64,
}

impl BlendWeights {
    pub const fn new(collaborative: f64, content: f64, social: f64, temporal: f64) -> Self {
        Self {
            collaborative,
            content,
            social,
            temporal,
        }
    }

    /// New raters lean on content and social proof, explorers on content,
    /// everyone else on collaborative filtering.
    pub fn for_profile(profile: &UserProfile) -> Self {
        if profile.total_ratings < 5 {
            Self::new(0.1, 0.4, 0.4, 0.1)
        } else if profile.exploration_ratio > 0.7 {
            Self::new(0.3, 0.4, 0.2, 0.1)
        } else {
            Self::new(0.4, 0.3, 0.2, 0.1)
        }
    }

    pub fn total(&self) -> f64 {
        self.collaborative + self.content + self.social + self.temporal
    }

    /// Zeroes the disabled components and rescales the rest to sum to 1
    fn restrict(self, collaborative: bool, content: bool, social: bool, temporal: bool) -> Self {
        let kept = Self::new(
            if collaborative { self.collaborative } else { 0.0 },
            if content { self.content } else { 0.0 },
            if social { self.social } else { 0.0 },
            if temporal { self.temporal } else { 0.0 },
        );
        let total = kept.total();
        if total <= 0.0 {
            return kept;
        }
        Self::new(
            kept.collaborative / total,
            kept.content / total,
            kept.social / total,
            kept.temporal / total,
        )
    }

    /// Weights for one recommendation list variant
    pub fn for_kind(self, kind: RecommendationKind) -> Self {
        match kind {
            RecommendationKind::ForYou => self,
            RecommendationKind::Trending => self.restrict(true, false, true, false),
            RecommendationKind::SimilarToFavorites => self.restrict(false, true, false, true),
        }
    }

    /// Content and temporal only, for when the network scorers ran out of time
    pub fn without_network(self) -> Self {
        self.restrict(false, true, false, true)
    }

    pub fn uses_network(&self) -> bool {
        self.collaborative > 0.0 || self.social > 0.0
    }
}

/// The user's strongest stored neighbours for collaborative filtering
pub fn top_neighbours(user_id: UserId, edges: &[UserSimilarityEdge]) -> Vec<(UserId, f64)> {
    let mut neighbours: Vec<(UserId, f64)> = edges
        .iter()
        .filter(|e| e.overall_similarity >= COLLABORATIVE_MIN_SIMILARITY)
        .filter_map(|e| e.other(user_id).map(|other| (other, e.overall_similarity)))
        .collect();
    neighbours.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    neighbours.dedup_by_key(|(user, _)| *user);
    neighbours.truncate(COLLABORATIVE_NEIGHBOURS);
    neighbours
}

/// Similarity-weighted average rating of each candidate among the neighbours,
/// scaled by how many of them rated it
pub fn collaborative_scores(
    neighbours: &[(UserId, f64)],
    neighbour_ratings: &[UserRating],
    candidates: &[Candidate],
) -> ScoreMap {
    let similarity: HashMap<UserId, f64> = neighbours.iter().copied().collect();
    let wanted: BTreeSet<RestaurantId> = candidates.iter().map(|c| c.restaurant.id).collect();

    // restaurant -> (sum rating*sim, sum sim, contributors)
    let mut acc: HashMap<RestaurantId, (f64, f64, usize)> = HashMap::new();
    for rating in neighbour_ratings {
        let Some(sim) = similarity.get(&rating.user_id) else {
            continue;
        };
        if !wanted.contains(&rating.restaurant_id) {
            continue;
        }
        let slot = acc.entry(rating.restaurant_id).or_insert((0.0, 0.0, 0));
        slot.0 += rating.rating * sim;
        slot.1 += sim;
        slot.2 += 1;
    }

    acc.into_iter()
        .filter(|(_, (_, weights, _))| *weights > 0.0)
        .map(|(restaurant, (sum, weights, contributors))| {
            let confidence = contributors as f64 / COLLABORATIVE_NEIGHBOURS as f64;
            (restaurant, sum / weights * confidence)
        })
        .collect()
}

/// Share of the user's survey weight, within the categories a restaurant
/// touches, that lands on slots the restaurant satisfies
pub fn survey_match(survey: &SurveyVector, restaurant: &RestaurantFeatures) -> f64 {
    let slots = restaurant.survey_slots();
    if slots.is_empty() {
        return 0.0;
    }

    let matched: f64 = slots.iter().map(|slot| survey.weight(*slot)).sum();
    let categories: Vec<PreferenceCategory> = PreferenceCategory::ALL
        .into_iter()
        .filter(|c| slots.iter().any(|s| s.category() == *c))
        .collect();
    let available: f64 = categories
        .iter()
        .map(|c| survey.segment(*c).iter().sum::<f64>())
        .sum();

    if available > 0.0 {
        matched / available
    } else {
        0.0
    }
}

/// 0.4 * cuisine affinity + 0.3 * price preference + 0.3 * survey match
pub fn content_score(profile: &UserProfile, restaurant: &RestaurantFeatures) -> f64 {
    let survey = profile
        .survey
        .as_ref()
        .map(|s| survey_match(s, restaurant))
        .unwrap_or(0.0);

    0.4 * profile.cuisine_affinity(restaurant.cuisine_type.as_deref())
        + 0.3 * profile.price_preference(restaurant.price_level)
        + 0.3 * survey
}

pub fn content_scores(profile: &UserProfile, candidates: &[Candidate]) -> ScoreMap {
    candidates
        .iter()
        .map(|c| (c.restaurant.id, content_score(profile, &c.restaurant)))
        .collect()
}

/// Social proof from live neighbours, with the user's cluster as backup
///
/// A candidate no live neighbour has rated falls back to its cluster cell,
/// scored as `weighted_avg / 5 * confidence`.
pub fn social_scores(
    neighbours: &[(UserId, f64)],
    neighbour_ratings: &[UserRating],
    cluster_cells: &[WeightedRatingCell],
    candidates: &[Candidate],
) -> ScoreMap {
    let similarity: HashMap<UserId, f64> = neighbours.iter().copied().collect();
    let cells: HashMap<RestaurantId, &WeightedRatingCell> =
        cluster_cells.iter().map(|c| (c.restaurant_id, c)).collect();

    let mut weighted: HashMap<RestaurantId, Vec<f64>> = HashMap::new();
    for rating in neighbour_ratings {
        if let Some(sim) = similarity.get(&rating.user_id) {
            weighted
                .entry(rating.restaurant_id)
                .or_default()
                .push(rating.rating * sim);
        }
    }

    candidates
        .iter()
        .filter_map(|c| {
            let id = c.restaurant.id;
            match weighted.get(&id) {
                Some(values) if !values.is_empty() => {
                    let mean = values.iter().sum::<f64>() / values.len() as f64;
                    let confidence = (values.len() as f64 / 10.0).min(1.0);
                    Some((id, mean / 5.0 * confidence))
                }
                _ => cells
                    .get(&id)
                    .map(|cell| (id, cell.weighted_avg_rating / 5.0 * cell.confidence)),
            }
        })
        .collect()
}

/// Recent-taste score from the user's last 180 days of ratings
pub fn temporal_scores(
    history: &[RatedRestaurant],
    candidates: &[Candidate],
    now: DateTime<Utc>,
) -> ScoreMap {
    let cutoff = now - chrono::Duration::days(TEMPORAL_WINDOW_DAYS);
    let mut by_cuisine: HashMap<&str, Vec<f64>> = HashMap::new();
    let mut by_price: HashMap<i16, Vec<f64>> = HashMap::new();

    for entry in history.iter().filter(|h| h.rating.created_at > cutoff) {
        let decayed = entry.rating.rating * (-entry.age_days(now) / TEMPORAL_DECAY_DAYS).exp();
        if let Some(cuisine) = entry.restaurant.cuisine_type.as_deref() {
            by_cuisine.entry(cuisine).or_default().push(decayed);
        }
        if let Some(price) = entry.restaurant.price_level {
            by_price.entry(price).or_default().push(decayed);
        }
    }

    if by_cuisine.is_empty() && by_price.is_empty() {
        return ScoreMap::new();
    }

    let mean = |values: &Vec<f64>| values.iter().sum::<f64>() / values.len() as f64;

    candidates
        .iter()
        .filter_map(|c| {
            let cuisine = c
                .restaurant
                .cuisine_type
                .as_deref()
                .and_then(|k| by_cuisine.get(k))
                .map(|v| mean(v) / 5.0 * 0.6);
            let price = c
                .restaurant
                .price_level
                .and_then(|p| by_price.get(&p))
                .map(|v| mean(v) / 5.0 * 0.4);
            match (cuisine, price) {
                (None, None) => None,
                (c_score, p_score) => Some((
                    c.restaurant.id,
                    c_score.unwrap_or(0.0) + p_score.unwrap_or(0.0),
                )),
            }
        })
        .collect()
}

/// All four component maps for one request
#[derive(Debug, Clone, Default)]
pub struct ComponentScores {
    pub collaborative: ScoreMap,
    pub content: ScoreMap,
    pub social: ScoreMap,
    pub temporal: ScoreMap,
}

impl ComponentScores {
    pub fn breakdown(&self, restaurant_id: RestaurantId) -> ScoreBreakdown {
        let get = |map: &ScoreMap| map.get(&restaurant_id).copied().unwrap_or(0.0);
        ScoreBreakdown {
            collaborative: get(&self.collaborative),
            content: get(&self.content),
            social: get(&self.social),
            temporal: get(&self.temporal),
        }
    }
}

/// A candidate with its blended, location-adjusted score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Blends the component maps and applies the location factor
///
/// Output is sorted by score descending, ties by restaurant id.
pub fn blend(
    scores: &ComponentScores,
    weights: BlendWeights,
    candidates: Vec<Candidate>,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|candidate| {
            let breakdown = scores.breakdown(candidate.restaurant.id);
            let raw = breakdown.collaborative * weights.collaborative
                + breakdown.content * weights.content
                + breakdown.social * weights.social
                + breakdown.temporal * weights.temporal;
            let score = raw * geo::location_factor(candidate.distance_km);
            ScoredCandidate {
                candidate,
                score,
                breakdown,
            }
        })
        .collect();

    sort_scored(&mut scored);
    scored
}

pub fn sort_scored(scored: &mut [ScoredCandidate]) {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.candidate.restaurant.id.cmp(&b.candidate.restaurant.id))
    });
}

/// Popularity list for users without a profile
///
/// Highly rated restaurants ordered by rating, then rating count, then distance.
pub fn cold_start(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    candidates.retain(|c| c.restaurant.avg_rating >= COLD_START_MIN_RATING);
    candidates.sort_by(|a, b| {
        b.restaurant
            .avg_rating
            .total_cmp(&a.restaurant.avg_rating)
            .then(b.restaurant.rating_count.cmp(&a.restaurant.rating_count))
            .then(a.distance_km.total_cmp(&b.distance_km))
            .then(a.restaurant.id.cmp(&b.restaurant.id))
    });
    candidates.truncate(limit);
    candidates
}
