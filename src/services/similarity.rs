//! Similarity Computer
//!
//! Two similarity searches live here. The batch one ([`compute_edges`]) feeds
//! the stored similarity graph and the clusters. The live one
//! ([`social_neighbours`]) runs per request for the social-proof score with
//! stricter overlap and threshold parameters.
//!
//! NOTE: the two searches duplicate each other. Folding the live one into the
//! stored graph would change social-proof rankings, so both stay for now.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::models::{RestaurantId, SurveyVector, UserId, UserRating, UserSimilarityEdge};

/// Co-rated restaurants needed before a rating similarity means anything
pub const MIN_CO_RATED: usize = 2;
pub const RATING_SIMILARITY_FLOOR: f64 = 0.1;
pub const PREFERENCE_SIMILARITY_FLOOR: f64 = 0.2;
/// Edges at or below this overall similarity are never stored
pub const STORE_THRESHOLD: f64 = 0.15;
pub const RATING_WEIGHT: f64 = 0.7;
pub const PREFERENCE_WEIGHT: f64 = 0.3;

pub const SOCIAL_MIN_CO_RATED: usize = 3;
pub const SOCIAL_SIMILARITY_FLOOR: f64 = 0.3;
pub const SOCIAL_NEIGHBOUR_LIMIT: usize = 50;

/// Sparse user x restaurant matrix; unrated cells are absent
pub type RatingMatrix = BTreeMap<UserId, BTreeMap<RestaurantId, f64>>;

pub fn rating_matrix(ratings: &[UserRating]) -> RatingMatrix {
    let mut matrix = RatingMatrix::new();
    for rating in ratings {
        matrix
            .entry(rating.user_id)
            .or_default()
            .insert(rating.restaurant_id, rating.rating);
    }
    matrix
}

fn norm<'a>(values: impl Iterator<Item = &'a f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}

/// Cosine similarity of two full rating rows and the number of co-rated restaurants
///
/// Unrated cells count as zero, so the norms cover every rating in each row.
/// Fewer than [`MIN_CO_RATED`] shared restaurants gives 0.
pub fn rating_similarity(
    a: &BTreeMap<RestaurantId, f64>,
    b: &BTreeMap<RestaurantId, f64>,
) -> (f64, usize) {
    let mut dot = 0.0;
    let mut common = 0;
    for (restaurant, ra) in a {
        if let Some(rb) = b.get(restaurant) {
            dot += ra * rb;
            common += 1;
        }
    }

    if common < MIN_CO_RATED {
        return (0.0, common);
    }

    let denom = norm(a.values()) * norm(b.values());
    if denom == 0.0 {
        return (0.0, common);
    }
    (dot / denom, common)
}

/// Cosine similarity of two survey vectors, 0 if either is empty
pub fn preference_similarity(a: &SurveyVector, b: &SurveyVector) -> f64 {
    let dot: f64 = a
        .weights()
        .iter()
        .zip(b.weights())
        .map(|(x, y)| x * y)
        .sum();
    let denom = norm(a.weights().iter()) * norm(b.weights().iter());
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

pub fn overall_similarity(rating: f64, preference: f64) -> f64 {
    RATING_WEIGHT * rating + PREFERENCE_WEIGHT * preference
}

/// Result of one pairwise pass
#[derive(Debug, Default)]
pub struct EdgeComputation {
    pub edges: Vec<UserSimilarityEdge>,
    /// Pairs with any rating or preference signal, stored or not
    pub pairs_with_signal: usize,
}

/// Pairwise similarity over every user in `matrix`
///
/// Dense O(U^2 * R) pass. Preference similarity only takes part when at least
/// two users have survey vectors. Only edges above [`STORE_THRESHOLD`] are returned.
pub fn compute_edges(
    matrix: &RatingMatrix,
    surveys: &BTreeMap<UserId, SurveyVector>,
    now: DateTime<Utc>,
) -> EdgeComputation {
    let users: Vec<UserId> = matrix.keys().copied().collect();
    let use_preferences = surveys.len() >= 2;
    let mut result = EdgeComputation::default();

    for (i, &a) in users.iter().enumerate() {
        for &b in &users[i + 1..] {
            let (raw_rating, common) = rating_similarity(&matrix[&a], &matrix[&b]);
            let rating = if raw_rating > RATING_SIMILARITY_FLOOR {
                raw_rating
            } else {
                0.0
            };

            let preference = match (use_preferences, surveys.get(&a), surveys.get(&b)) {
                (true, Some(va), Some(vb)) => {
                    let p = preference_similarity(va, vb);
                    if p > PREFERENCE_SIMILARITY_FLOOR {
                        p
                    } else {
                        0.0
                    }
                }
                _ => 0.0,
            };

            if rating == 0.0 && preference == 0.0 {
                continue;
            }
            result.pairs_with_signal += 1;

            let overall = overall_similarity(rating, preference);
            if overall > STORE_THRESHOLD {
                result.edges.push(UserSimilarityEdge::new(
                    a,
                    b,
                    rating,
                    preference,
                    overall,
                    common as i32,
                    now,
                ));
            }
        }
    }

    result
}

/// Live search for users whose ratings track the target's
///
/// Cosine is taken over the co-rated restaurants only. Returns at most
/// [`SOCIAL_NEIGHBOUR_LIMIT`] users, most similar first.
pub fn social_neighbours(
    target: UserId,
    target_ratings: &BTreeMap<RestaurantId, f64>,
    others: &RatingMatrix,
) -> Vec<(UserId, f64)> {
    let mut neighbours: Vec<(UserId, f64)> = others
        .iter()
        .filter(|(user, _)| **user != target)
        .filter_map(|(user, row)| {
            let (dot, na, nb, common) = target_ratings.iter().fold(
                (0.0, 0.0, 0.0, 0usize),
                |(dot, na, nb, common), (restaurant, ra)| match row.get(restaurant) {
                    Some(rb) => (dot + ra * rb, na + ra * ra, nb + rb * rb, common + 1),
                    None => (dot, na, nb, common),
                },
            );
            if common < SOCIAL_MIN_CO_RATED || na == 0.0 || nb == 0.0 {
                return None;
            }
            let similarity = dot / (na.sqrt() * nb.sqrt());
            (similarity > SOCIAL_SIMILARITY_FLOOR).then_some((*user, similarity))
        })
        .collect();

    neighbours.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    neighbours.truncate(SOCIAL_NEIGHBOUR_LIMIT);
    neighbours
}
