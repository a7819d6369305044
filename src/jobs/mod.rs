pub mod similarity_refresh;

pub use similarity_refresh::{spawn_scheduler, RefreshStats, SimilarityRefreshJob};
