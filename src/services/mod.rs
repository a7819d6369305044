pub mod clustering;
pub mod diversity;
pub mod geo;
pub mod profile;
pub mod recommendations;
pub mod scoring;
pub mod similarity;
pub mod survey;

pub use recommendations::RecommendationEngine;
