use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub mod profile;
pub mod similarity;
pub mod survey;

pub use profile::{PriceSensitivity, UserProfile};
pub use similarity::{SimilarUser, UserSimilarityEdge, WeightedRatingCell};
pub use survey::{
    Adventure, Atmosphere, Cuisine, Dietary, PreferenceCategory, PricePreference, ServiceStyle,
    SurveyAnswer, SurveySlot, SurveySubmission, SurveyVector, SURVEY_VECTOR_LEN,
};

pub type UserId = i64;
pub type RestaurantId = i64;
pub type ClusterId = i32;

/// A single star rating left by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRating {
    pub user_id: UserId,
    pub restaurant_id: RestaurantId,
    /// 1.0 - 5.0, decimals allowed
    pub rating: f64,
    pub created_at: DateTime<Utc>,
}

/// Restaurant attributes the scorers read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantFeatures {
    pub id: RestaurantId,
    pub name: String,
    pub cuisine_type: Option<String>,
    /// 1-4 scale ($ to $$$$)
    pub price_level: Option<i16>,
    pub avg_rating: f64,
    pub rating_count: i32,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RestaurantFeatures {
    /// Survey slots this restaurant satisfies, from its cuisine and tags
    ///
    /// Tags that have no survey counterpart are ignored.
    pub fn survey_slots(&self) -> Vec<SurveySlot> {
        let mut slots: Vec<SurveySlot> = self
            .cuisine_type
            .as_deref()
            .and_then(Cuisine::from_label)
            .map(SurveySlot::Cuisine)
            .into_iter()
            .collect();

        for tag in &self.tags {
            if let Some(slot) = SurveySlot::from_tag(tag) {
                if !slots.contains(&slot) {
                    slots.push(slot);
                }
            }
        }

        slots
    }
}

/// A latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Caller-supplied narrowing of the candidate set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationFilters {
    /// Hard radius around the request location, in kilometres
    #[serde(default)]
    pub max_distance_km: Option<f64>,
    #[serde(default)]
    pub cuisines: Vec<String>,
    #[serde(default)]
    pub price_levels: Vec<i16>,
}

impl RecommendationFilters {
    pub fn admits(&self, restaurant: &RestaurantFeatures) -> bool {
        let cuisine_ok = self.cuisines.is_empty()
            || restaurant
                .cuisine_type
                .as_deref()
                .map(|c| self.cuisines.iter().any(|f| f.eq_ignore_ascii_case(c)))
                .unwrap_or(false);

        let price_ok = self.price_levels.is_empty()
            || restaurant
                .price_level
                .map(|p| self.price_levels.contains(&p))
                .unwrap_or(false);

        cuisine_ok && price_ok
    }
}

/// A complete recommendation request as seen by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationRequest {
    pub user_id: UserId,
    pub location: Option<Location>,
    pub filters: RecommendationFilters,
    pub limit: usize,
    pub kind: RecommendationKind,
}

/// Which recommendation list is being asked for
///
/// The variants differ only in which scorer components take part in the blend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendationKind {
    #[default]
    ForYou,
    Trending,
    #[serde(alias = "favorites")]
    SimilarToFavorites,
}

impl Display for RecommendationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecommendationKind::ForYou => write!(f, "for-you"),
            RecommendationKind::Trending => write!(f, "trending"),
            RecommendationKind::SimilarToFavorites => write!(f, "favorites"),
        }
    }
}

/// Per-component scores behind a blended recommendation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub collaborative: f64,
    pub content: f64,
    pub social: f64,
    pub temporal: f64,
}

/// A single ranked restaurant returned to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub restaurant_id: RestaurantId,
    pub name: String,
    pub cuisine_type: Option<String>,
    pub price_level: Option<i16>,
    pub avg_rating: f64,
    pub score: f64,
    pub distance_km: Option<f64>,
    pub reasoning: String,
    /// Absent for cold-start lists, which are not blended
    pub breakdown: Option<ScoreBreakdown>,
}
