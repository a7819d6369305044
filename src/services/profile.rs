//! Profile Builder: turns a user's rating history and survey into a
//! [`UserProfile`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    db::RecommendationStore,
    error::AppResult,
    models::{PriceSensitivity, RestaurantFeatures, RestaurantId, SurveyVector, UserId, UserProfile, UserRating},
};

/// Days over which a cuisine rating loses 1/e of its weight
const AFFINITY_DECAY_DAYS: f64 = 90.0;

/// A rating joined with the restaurant it was left on
#[derive(Debug, Clone, PartialEq)]
pub struct RatedRestaurant {
    pub rating: UserRating,
    pub restaurant: RestaurantFeatures,
}

impl RatedRestaurant {
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.rating.created_at).num_days().max(0) as f64
    }
}

/// Loads a user's rating history joined with restaurant features
///
/// Features are taken from `catalog` when present and fetched from the store
/// otherwise, so ratings on restaurants that have since been deactivated still
/// count. Ratings on restaurants the store no longer knows are dropped.
pub async fn load_history(
    store: &dyn RecommendationStore,
    user_id: UserId,
    catalog: &HashMap<RestaurantId, RestaurantFeatures>,
) -> AppResult<Vec<RatedRestaurant>> {
    let ratings = store.get_ratings(user_id).await?;
    let mut fetched: HashMap<RestaurantId, Option<RestaurantFeatures>> = HashMap::new();
    let mut history = Vec::with_capacity(ratings.len());

    for rating in ratings {
        let restaurant = match catalog.get(&rating.restaurant_id) {
            Some(r) => Some(r.clone()),
            None => {
                if !fetched.contains_key(&rating.restaurant_id) {
                    let features = store.get_restaurant_features(rating.restaurant_id).await?;
                    fetched.insert(rating.restaurant_id, features);
                }
                fetched.get(&rating.restaurant_id).cloned().flatten()
            }
        };

        match restaurant {
            Some(restaurant) => history.push(RatedRestaurant { rating, restaurant }),
            None => {
                tracing::debug!(
                    user_id,
                    restaurant_id = rating.restaurant_id,
                    "Skipping rating on unknown restaurant"
                );
            }
        }
    }

    Ok(history)
}

/// Builds a profile from an already loaded history
///
/// Returns `None` for a user with no ratings; callers fall back to cold start.
pub fn build_profile(
    user_id: UserId,
    history: &[RatedRestaurant],
    survey: Option<SurveyVector>,
    now: DateTime<Utc>,
) -> Option<UserProfile> {
    if history.is_empty() {
        return None;
    }

    let total = history.len();
    let ratings: Vec<f64> = history.iter().map(|h| h.rating.rating).collect();
    let avg_personal_rating = ratings.iter().sum::<f64>() / total as f64;
    let rating_variance = if total < 2 {
        0.0
    } else {
        ratings
            .iter()
            .map(|r| (r - avg_personal_rating).powi(2))
            .sum::<f64>()
            / (total - 1) as f64
    };

    let quality_standards = history
        .iter()
        .map(|h| h.rating.rating - h.restaurant.avg_rating)
        .sum::<f64>()
        / total as f64;

    let cuisine_affinities = cuisine_affinities(history, now);
    let exploration_ratio = (cuisine_affinities.len() as f64 / total as f64).min(1.0);

    Some(UserProfile {
        user_id,
        price_sensitivity: price_sensitivity(history),
        cuisine_affinities,
        quality_standards,
        exploration_ratio,
        survey,
        total_ratings: total,
        avg_personal_rating,
        rating_variance,
        rated_restaurants: history.iter().map(|h| h.rating.restaurant_id).collect::<BTreeSet<_>>(),
        built_at: now,
    })
}

/// Loads everything a profile needs and builds it
pub async fn load_profile(
    store: &dyn RecommendationStore,
    user_id: UserId,
    now: DateTime<Utc>,
) -> AppResult<Option<UserProfile>> {
    let history = load_history(store, user_id, &HashMap::new()).await?;
    if history.is_empty() {
        return Ok(None);
    }
    let survey = store.get_survey_vector(user_id).await?;
    Ok(build_profile(user_id, &history, survey, now))
}

fn cuisine_affinities(history: &[RatedRestaurant], now: DateTime<Utc>) -> BTreeMap<String, f64> {
    // cuisine -> (weighted sum, weight total, count)
    let mut acc: BTreeMap<String, (f64, f64, usize)> = BTreeMap::new();

    for entry in history {
        let Some(cuisine) = entry.restaurant.cuisine_type.as_ref() else {
            continue;
        };
        let weight = (-entry.age_days(now) / AFFINITY_DECAY_DAYS).exp();
        let slot = acc.entry(cuisine.clone()).or_insert((0.0, 0.0, 0));
        slot.0 += entry.rating.rating * weight;
        slot.1 += weight;
        slot.2 += 1;
    }

    acc.into_iter()
        .map(|(cuisine, (sum, weights, count))| {
            let weighted_avg = if weights > 0.0 { sum / weights } else { 0.0 };
            let frequency_bonus = (count as f64 / 10.0).min(1.0);
            (cuisine, weighted_avg / 5.0 * (1.0 + frequency_bonus))
        })
        .collect()
}

fn price_sensitivity(history: &[RatedRestaurant]) -> BTreeMap<i16, PriceSensitivity> {
    let mut acc: BTreeMap<i16, (f64, usize)> = BTreeMap::new();
    for entry in history {
        if let Some(price) = entry.restaurant.price_level {
            let slot = acc.entry(price).or_insert((0.0, 0));
            slot.0 += entry.rating.rating;
            slot.1 += 1;
        }
    }

    acc.into_iter()
        .map(|(price, (sum, count))| {
            let avg_rating = sum / count as f64;
            let preference_score = avg_rating / 5.0 * (count as f64 / 5.0).min(1.0);
            (
                price,
                PriceSensitivity {
                    avg_rating,
                    count,
                    preference_score,
                },
            )
        })
        .collect()
}
