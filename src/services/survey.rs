//! Bubble survey → survey vector

use serde::Serialize;

use crate::{
    error::AppResult,
    models::{PreferenceCategory, SurveySubmission, SurveyVector, SURVEY_VECTOR_LEN},
};

/// Non-zero slots needed for full preference strength
const FULL_STRENGTH_SLOTS: f64 = 20.0;

/// Summary returned after a survey is stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveySummary {
    pub preference_strength: f64,
    /// Answered categories / 6
    pub profile_confidence: f64,
    pub total_preferences: usize,
}

/// Flattens and normalises a validated submission
///
/// Each slot holds its answer weight divided by the total weight across the
/// whole survey, so a non-empty vector always sums to 1.
pub fn build_vector(submission: &SurveySubmission) -> AppResult<SurveyVector> {
    let mut weights = vec![0.0; SURVEY_VECTOR_LEN];
    for (slot, answer) in submission.answers() {
        weights[slot.position()] = answer.weight;
    }

    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        for w in weights.iter_mut() {
            *w /= total;
        }
    }

    let non_zero = weights.iter().filter(|w| **w > 0.0).count();
    let strength = (non_zero as f64 / FULL_STRENGTH_SLOTS).min(1.0);

    SurveyVector::new(weights, strength)
}

pub fn profile_confidence(submission: &SurveySubmission) -> f64 {
    submission.answered_categories() as f64 / PreferenceCategory::ALL.len() as f64
}

pub fn summarize(submission: &SurveySubmission, vector: &SurveyVector) -> SurveySummary {
    SurveySummary {
        preference_strength: vector.strength,
        profile_confidence: profile_confidence(submission),
        total_preferences: vector.weights().iter().filter(|w| **w > 0.0).count(),
    }
}
