//! Bubble-survey preference categories
//!
//! Every category is a closed enum so that survey keys and restaurant tags are
//! validated when they enter the system instead of silently matching nothing.
//! The flattened vector layout is fixed: each category owns a segment of
//! [`PreferenceCategory::slot_count`] slots starting at [`PreferenceCategory::offset`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};

/// Total length of a flattened survey vector
pub const SURVEY_VECTOR_LEN: usize = 55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceCategory {
    Cuisine,
    Atmosphere,
    Price,
    Service,
    Dietary,
    Adventure,
}

impl PreferenceCategory {
    pub const ALL: [PreferenceCategory; 6] = [
        PreferenceCategory::Cuisine,
        PreferenceCategory::Atmosphere,
        PreferenceCategory::Price,
        PreferenceCategory::Service,
        PreferenceCategory::Dietary,
        PreferenceCategory::Adventure,
    ];

    /// Number of slots reserved for this category
    pub fn slot_count(self) -> usize {
        match self {
            PreferenceCategory::Cuisine => 20,
            PreferenceCategory::Atmosphere => 10,
            PreferenceCategory::Price => 6,
            PreferenceCategory::Service => 6,
            PreferenceCategory::Dietary => 8,
            PreferenceCategory::Adventure => 5,
        }
    }

    /// First slot of this category in the flattened vector
    pub fn offset(self) -> usize {
        Self::ALL
            .iter()
            .take_while(|c| **c != self)
            .map(|c| c.slot_count())
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cuisine {
    Italian,
    Mexican,
    Chinese,
    Japanese,
    Indian,
    Thai,
    American,
    French,
    Mediterranean,
    Korean,
    Vietnamese,
    MiddleEastern,
}

impl Cuisine {
    /// Parses a free-form cuisine label such as `"Middle Eastern"`
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace([' ', '-'], "_");
        let cuisine = match normalized.as_str() {
            "italian" => Cuisine::Italian,
            "mexican" => Cuisine::Mexican,
            "chinese" => Cuisine::Chinese,
            "japanese" => Cuisine::Japanese,
            "indian" => Cuisine::Indian,
            "thai" => Cuisine::Thai,
            "american" => Cuisine::American,
            "french" => Cuisine::French,
            "mediterranean" => Cuisine::Mediterranean,
            "korean" => Cuisine::Korean,
            "vietnamese" => Cuisine::Vietnamese,
            "middle_eastern" => Cuisine::MiddleEastern,
            _ => return None,
        };
        Some(cuisine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Atmosphere {
    Romantic,
    Casual,
    Upscale,
    FamilyFriendly,
    Lively,
    Quiet,
    Outdoor,
    Cozy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricePreference {
    BudgetFriendly,
    Moderate,
    UpscaleWorthIt,
    PriceNoObject,
    HappyHour,
    DealSeeker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStyle {
    FastCasual,
    FullService,
    Takeout,
    Buffet,
    FoodTruck,
    FineDining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dietary {
    VegetarianFriendly,
    VeganOptions,
    GlutenFree,
    KetoFriendly,
    HealthyOptions,
    ComfortFood,
    NoRestrictions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adventure {
    StickToFavorites,
    MildAdventurer,
    FoodExplorer,
    ExtremeFoodie,
    TryAnythingOnce,
}

/// One position in the flattened survey vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurveySlot {
    Cuisine(Cuisine),
    Atmosphere(Atmosphere),
    Price(PricePreference),
    Service(ServiceStyle),
    Dietary(Dietary),
    Adventure(Adventure),
}

impl SurveySlot {
    pub fn category(self) -> PreferenceCategory {
        match self {
            SurveySlot::Cuisine(_) => PreferenceCategory::Cuisine,
            SurveySlot::Atmosphere(_) => PreferenceCategory::Atmosphere,
            SurveySlot::Price(_) => PreferenceCategory::Price,
            SurveySlot::Service(_) => PreferenceCategory::Service,
            SurveySlot::Dietary(_) => PreferenceCategory::Dietary,
            SurveySlot::Adventure(_) => PreferenceCategory::Adventure,
        }
    }

    /// Absolute index into a [`SurveyVector`]
    pub fn position(self) -> usize {
        let within = match self {
            SurveySlot::Cuisine(v) => v as usize,
            SurveySlot::Atmosphere(v) => v as usize,
            SurveySlot::Price(v) => v as usize,
            SurveySlot::Service(v) => v as usize,
            SurveySlot::Dietary(v) => v as usize,
            SurveySlot::Adventure(v) => v as usize,
        };
        self.category().offset() + within
    }

    /// Maps a restaurant tag onto the survey slot it satisfies
    pub fn from_tag(tag: &str) -> Option<Self> {
        let slot = match tag.trim().to_lowercase().as_str() {
            "romantic" => SurveySlot::Atmosphere(Atmosphere::Romantic),
            "casual" => SurveySlot::Atmosphere(Atmosphere::Casual),
            "upscale" => SurveySlot::Atmosphere(Atmosphere::Upscale),
            "family_friendly" => SurveySlot::Atmosphere(Atmosphere::FamilyFriendly),
            "lively" => SurveySlot::Atmosphere(Atmosphere::Lively),
            "quiet" => SurveySlot::Atmosphere(Atmosphere::Quiet),
            "outdoor" | "outdoor_seating" => SurveySlot::Atmosphere(Atmosphere::Outdoor),
            "cozy" => SurveySlot::Atmosphere(Atmosphere::Cozy),
            "fast_casual" => SurveySlot::Service(ServiceStyle::FastCasual),
            "full_service" => SurveySlot::Service(ServiceStyle::FullService),
            "takeout" => SurveySlot::Service(ServiceStyle::Takeout),
            "buffet" => SurveySlot::Service(ServiceStyle::Buffet),
            "food_truck" => SurveySlot::Service(ServiceStyle::FoodTruck),
            "fine_dining" => SurveySlot::Service(ServiceStyle::FineDining),
            "vegetarian_friendly" => SurveySlot::Dietary(Dietary::VegetarianFriendly),
            "vegan_options" => SurveySlot::Dietary(Dietary::VeganOptions),
            "gluten_free" => SurveySlot::Dietary(Dietary::GlutenFree),
            "keto_friendly" => SurveySlot::Dietary(Dietary::KetoFriendly),
            "healthy_options" => SurveySlot::Dietary(Dietary::HealthyOptions),
            "comfort_food" => SurveySlot::Dietary(Dietary::ComfortFood),
            _ => return None,
        };
        Some(slot)
    }
}

/// A single survey answer: how strongly an option survived the bubble rounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurveyAnswer {
    /// 0.0 - 10.0
    pub weight: f64,
    /// 1 - 6
    pub round_survived: u8,
    /// 1-based
    pub selection_order: u32,
}

impl SurveyAnswer {
    fn validate(&self, key: &str) -> AppResult<()> {
        if !(0.0..=10.0).contains(&self.weight) || !self.weight.is_finite() {
            return Err(AppError::InvalidInput(format!(
                "weight for '{}' must be between 0 and 10",
                key
            )));
        }
        if !(1..=6).contains(&self.round_survived) {
            return Err(AppError::InvalidInput(format!(
                "round_survived for '{}' must be between 1 and 6",
                key
            )));
        }
        if self.selection_order < 1 {
            return Err(AppError::InvalidInput(format!(
                "selection_order for '{}' must be at least 1",
                key
            )));
        }
        Ok(())
    }
}

/// A completed bubble survey
///
/// Unknown option keys fail deserialization, so every answer here maps onto a
/// real vector slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurveySubmission {
    #[serde(default)]
    pub cuisine_preferences: BTreeMap<Cuisine, SurveyAnswer>,
    #[serde(default)]
    pub atmosphere_preferences: BTreeMap<Atmosphere, SurveyAnswer>,
    #[serde(default)]
    pub price_preferences: BTreeMap<PricePreference, SurveyAnswer>,
    #[serde(default)]
    pub service_preferences: BTreeMap<ServiceStyle, SurveyAnswer>,
    #[serde(default)]
    pub dietary_preferences: BTreeMap<Dietary, SurveyAnswer>,
    #[serde(default)]
    pub adventure_preferences: BTreeMap<Adventure, SurveyAnswer>,
    pub total_rounds_completed: u8,
    #[serde(default)]
    pub final_score: i32,
}

impl SurveySubmission {
    /// All answers flattened to their vector slots
    pub fn answers(&self) -> Vec<(SurveySlot, SurveyAnswer)> {
        let mut answers = Vec::new();
        answers.extend(
            self.cuisine_preferences
                .iter()
                .map(|(k, v)| (SurveySlot::Cuisine(*k), *v)),
        );
        answers.extend(
            self.atmosphere_preferences
                .iter()
                .map(|(k, v)| (SurveySlot::Atmosphere(*k), *v)),
        );
        answers.extend(
            self.price_preferences
                .iter()
                .map(|(k, v)| (SurveySlot::Price(*k), *v)),
        );
        answers.extend(
            self.service_preferences
                .iter()
                .map(|(k, v)| (SurveySlot::Service(*k), *v)),
        );
        answers.extend(
            self.dietary_preferences
                .iter()
                .map(|(k, v)| (SurveySlot::Dietary(*k), *v)),
        );
        answers.extend(
            self.adventure_preferences
                .iter()
                .map(|(k, v)| (SurveySlot::Adventure(*k), *v)),
        );
        answers
    }

    /// Number of categories with at least one answer
    pub fn answered_categories(&self) -> usize {
        [
            self.cuisine_preferences.is_empty(),
            self.atmosphere_preferences.is_empty(),
            self.price_preferences.is_empty(),
            self.service_preferences.is_empty(),
            self.dietary_preferences.is_empty(),
            self.adventure_preferences.is_empty(),
        ]
        .iter()
        .filter(|empty| !**empty)
        .count()
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(1..=6).contains(&self.total_rounds_completed) {
            return Err(AppError::InvalidInput(
                "total_rounds_completed must be between 1 and 6".to_string(),
            ));
        }
        if self.final_score < 0 {
            return Err(AppError::InvalidInput(
                "final_score must not be negative".to_string(),
            ));
        }
        for (slot, answer) in self.answers() {
            answer.validate(&format!("{:?}", slot))?;
        }
        Ok(())
    }
}

/// Flattened, L1-normalised survey preferences
///
/// Only constructed through [`SurveyVector::new`], so the slot count always
/// matches [`SURVEY_VECTOR_LEN`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyVector {
    weights: Vec<f64>,
    /// How many distinct preferences back this vector, 0.0 - 1.0
    pub strength: f64,
}

impl SurveyVector {
    /// Wraps stored weights, rejecting vectors of the wrong shape
    pub fn new(weights: Vec<f64>, strength: f64) -> AppResult<Self> {
        if weights.len() != SURVEY_VECTOR_LEN {
            return Err(AppError::InvalidInput(format!(
                "survey vector must have {} slots, got {}",
                SURVEY_VECTOR_LEN,
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AppError::InvalidInput(
                "survey vector weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(Self { weights, strength })
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn weight(&self, slot: SurveySlot) -> f64 {
        self.weights[slot.position()]
    }

    pub fn segment(&self, category: PreferenceCategory) -> &[f64] {
        let start = category.offset();
        &self.weights[start..start + category.slot_count()]
    }

    pub fn is_empty(&self) -> bool {
        self.weights.iter().all(|w| *w == 0.0)
    }
}
