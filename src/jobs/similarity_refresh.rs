//! Batch maintenance of the similarity graph, cluster assignments and
//! cluster-weighted ratings.
//!
//! This job is the only writer of those tables. Each step logs and records its
//! own failure and the run carries on with whatever it still can do.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{
    config::EngineSettings,
    db::RecommendationStore,
    error::AppResult,
    models::{ClusterId, SurveyVector, UserId},
    services::{
        clustering::{self, MIN_CLUSTER_MEMBERS},
        similarity,
    },
};

const ACTIVE_WINDOW_DAYS: i64 = 365;
const EDGE_MAX_AGE_DAYS: i64 = 7;

/// What one refresh run did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshStats {
    pub users_processed: usize,
    pub similarities_computed: usize,
    pub edges_stored: usize,
    pub edges_purged: u64,
    /// Users given a cluster id
    pub clusters_updated: usize,
    pub weighted_ratings_updated: usize,
    pub failed_steps: Vec<String>,
}

impl RefreshStats {
    fn fail(&mut self, step: &str, error: &dyn std::fmt::Display) {
        tracing::error!(step, error = %error, "Similarity refresh step failed");
        self.failed_steps.push(step.to_string());
    }
}

#[derive(Debug, Default)]
struct ClusterUpdate {
    assigned: BTreeMap<UserId, ClusterId>,
    skipped: Vec<UserId>,
}

pub struct SimilarityRefreshJob {
    store: Arc<dyn RecommendationStore>,
    settings: EngineSettings,
    running: Mutex<()>,
}

impl SimilarityRefreshJob {
    pub fn new(store: Arc<dyn RecommendationStore>, settings: EngineSettings) -> Self {
        Self {
            store,
            settings,
            running: Mutex::new(()),
        }
    }

    /// Runs one full refresh; concurrent calls queue behind each other
    pub async fn run(&self) -> RefreshStats {
        let _guard = self.running.lock().await;
        let started = std::time::Instant::now();
        let now = Utc::now();
        let mut stats = RefreshStats::default();

        tracing::info!("Starting similarity refresh");

        match self
            .store
            .purge_similarity_edges(now - Duration::days(EDGE_MAX_AGE_DAYS))
            .await
        {
            Ok(purged) => stats.edges_purged = purged,
            Err(e) => stats.fail("purge_edges", &e),
        }

        let since = now - Duration::days(ACTIVE_WINDOW_DAYS);
        let users = match self.store.active_user_ids(since).await {
            Ok(users) => users,
            Err(e) => {
                stats.fail("load_users", &e);
                return stats;
            }
        };
        stats.users_processed = users.len();

        if users.len() < 2 {
            tracing::info!(users = users.len(), "Not enough users with ratings for similarity computation");
            return stats;
        }

        match self.refresh_edges(&users, now).await {
            Ok((computed, stored)) => {
                stats.similarities_computed = computed;
                stats.edges_stored = stored;
            }
            Err(e) => stats.fail("similarities", &e),
        }

        let update = match self.refresh_clusters(&users).await {
            Ok(update) => update,
            Err(e) => {
                stats.fail("clustering", &e);
                None
            }
        };

        if let Some(update) = update {
            stats.clusters_updated = update.assigned.len();
            if !update.skipped.is_empty() {
                stats.fail(
                    "cluster_assignment",
                    &format!("{} users could not be assigned", update.skipped.len()),
                );
            }
            let clusters: BTreeSet<ClusterId> = update.assigned.values().copied().collect();
            for cluster_id in clusters {
                match self.refresh_cells(cluster_id).await {
                    Ok(updated) => stats.weighted_ratings_updated += updated,
                    Err(e) => stats.fail(&format!("weighted_ratings:{}", cluster_id), &e),
                }
            }
        }

        tracing::info!(
            users = stats.users_processed,
            similarities = stats.similarities_computed,
            edges = stats.edges_stored,
            purged = stats.edges_purged,
            clustered = stats.clusters_updated,
            cells = stats.weighted_ratings_updated,
            failed = stats.failed_steps.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Similarity refresh complete"
        );

        stats
    }

    async fn refresh_edges(
        &self,
        users: &[UserId],
        now: chrono::DateTime<Utc>,
    ) -> AppResult<(usize, usize)> {
        let since = now - Duration::days(ACTIVE_WINDOW_DAYS);
        let ratings = self.store.ratings_for_users(users, Some(since)).await?;
        let matrix = similarity::rating_matrix(&ratings);

        let surveys: BTreeMap<UserId, SurveyVector> = match self.store.survey_vectors(users).await {
            Ok(vectors) => vectors.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not load survey vectors, using ratings only");
                BTreeMap::new()
            }
        };

        let computation = similarity::compute_edges(&matrix, &surveys, now);
        for batch in computation.edges.chunks(self.settings.similarity_batch_size) {
            self.store.upsert_similarity_edges(batch).await?;
        }

        tracing::info!(
            users = matrix.len(),
            surveys = surveys.len(),
            pairs = computation.pairs_with_signal,
            stored = computation.edges.len(),
            "Stored user similarities"
        );

        Ok((computation.pairs_with_signal, computation.edges.len()))
    }

    /// Reassigns every clustered user; a user whose write fails keeps the old
    /// cluster and the rest of the assignment is still applied
    async fn refresh_clusters(&self, users: &[UserId]) -> AppResult<Option<ClusterUpdate>> {
        let edges = self.store.read_similarity_edges(users).await?;
        let Some(assignment) = clustering::assign_clusters(users, &edges, self.settings.kmeans_seed)?
        else {
            return Ok(None);
        };

        let mut update = ClusterUpdate::default();
        for (user_id, cluster_id) in assignment {
            match self.store.set_user_cluster(user_id, cluster_id).await {
                Ok(()) => {
                    update.assigned.insert(user_id, cluster_id);
                }
                Err(e) => {
                    tracing::warn!(user_id, cluster_id, error = %e, "Skipping cluster assignment");
                    update.skipped.push(user_id);
                }
            }
        }

        tracing::info!(
            users = update.assigned.len(),
            skipped = update.skipped.len(),
            clusters = clustering::cluster_count(users.len()),
            "Updated user clusters"
        );
        Ok(Some(update))
    }

    async fn refresh_cells(&self, cluster_id: ClusterId) -> AppResult<usize> {
        let members = self.store.cluster_members(cluster_id).await?;
        if members.len() < MIN_CLUSTER_MEMBERS {
            tracing::info!(cluster_id, members = members.len(), "Cluster too small for weighted ratings");
            return Ok(0);
        }

        let ratings = self.store.ratings_for_users(&members, None).await?;
        let mut totals: HashMap<UserId, usize> = HashMap::new();
        for rating in &ratings {
            *totals.entry(rating.user_id).or_insert(0) += 1;
        }

        let cells = clustering::compute_cluster_cells(cluster_id, &ratings, &totals, Utc::now());
        for batch in cells.chunks(self.settings.similarity_batch_size) {
            self.store.upsert_weighted_rating_cells(batch).await?;
        }

        tracing::info!(cluster_id, cells = cells.len(), "Updated weighted ratings");
        Ok(cells.len())
    }
}

/// Runs the job every `interval`, starting one interval from now
pub fn spawn_scheduler(job: Arc<SimilarityRefreshJob>, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stats = job.run().await;
            if !stats.failed_steps.is_empty() {
                tracing::warn!(failed = ?stats.failed_steps, "Scheduled similarity refresh finished with failures");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryStore, MockRecommendationStore};
    use crate::error::AppError;
    use crate::models::{UserRating, UserSimilarityEdge};

    fn rating(user_id: UserId, restaurant_id: i64, stars: f64, days_ago: i64) -> UserRating {
        UserRating {
            user_id,
            restaurant_id,
            rating: stars,
            created_at: Utc::now() - Duration::days(days_ago),
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            similarity_batch_size: 3,
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_fewer_than_two_users_is_noop() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_rating(rating(1, 1, 5.0, 1)).await;

        let job = SimilarityRefreshJob::new(store.clone(), settings());
        let stats = job.run().await;

        assert_eq!(stats.users_processed, 1);
        assert_eq!(stats.edges_stored, 0);
        assert!(stats.failed_steps.is_empty());
        assert!(store.similarity_edges().await.is_empty());
    }

    /// Two taste groups of six users each, every member rating the group's
    /// six restaurants identically
    async fn two_group_store() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for user in 1..=6 {
            for restaurant in 1..=6 {
                store
                    .insert_rating(rating(user, restaurant, 3.0 + (restaurant % 3) as f64, 10))
                    .await;
            }
        }
        for user in 7..=12 {
            for restaurant in 11..=16 {
                store
                    .insert_rating(rating(user, restaurant, 2.0 + (restaurant % 4) as f64, 10))
                    .await;
            }
        }
        store
    }

    #[tokio::test]
    async fn test_full_refresh() {
        let store = two_group_store().await;
        let job = SimilarityRefreshJob::new(store.clone(), settings());
        let stats = job.run().await;

        assert!(stats.failed_steps.is_empty(), "{:?}", stats.failed_steps);
        assert_eq!(stats.users_processed, 12);
        // every pair inside a group is identical, no pair across groups overlaps
        assert_eq!(stats.edges_stored, 30);
        let edges = store.similarity_edges().await;
        assert!(edges.iter().all(|e| e.overall_similarity > similarity::STORE_THRESHOLD));
        assert!(edges.iter().all(|e| e.user_a < e.user_b));

        let clusters = store.cluster_assignments().await;
        assert_eq!(stats.clusters_updated, 12);
        assert_eq!(clusters[&1], clusters[&6]);
        assert_eq!(clusters[&7], clusters[&12]);
        assert_ne!(clusters[&1], clusters[&7]);

        // six restaurants per group, each rated by all six members
        assert_eq!(stats.weighted_ratings_updated, 12);
        let cells = store.weighted_rating_cells().await;
        assert_eq!(cells.len(), 12);
        assert!(cells.iter().all(|c| (1.0..=5.0).contains(&c.weighted_avg_rating)));
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let store = two_group_store().await;
        let job = SimilarityRefreshJob::new(store.clone(), settings());

        job.run().await;
        let edges_first: Vec<(UserId, UserId, f64)> = store
            .similarity_edges()
            .await
            .iter()
            .map(|e| (e.user_a, e.user_b, e.overall_similarity))
            .collect();
        let clusters_first = store.cluster_assignments().await;
        let cells_first = store.weighted_rating_cells().await.len();

        job.run().await;
        let edges_second: Vec<(UserId, UserId, f64)> = store
            .similarity_edges()
            .await
            .iter()
            .map(|e| (e.user_a, e.user_b, e.overall_similarity))
            .collect();

        assert_eq!(edges_first, edges_second);
        assert_eq!(clusters_first, store.cluster_assignments().await);
        assert_eq!(cells_first, store.weighted_rating_cells().await.len());
    }

    #[tokio::test]
    async fn test_stale_edges_purged() {
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_similarity_edges(&[UserSimilarityEdge::new(
                50,
                51,
                0.9,
                0.0,
                0.63,
                3,
                Utc::now() - Duration::days(8),
            )])
            .await
            .unwrap();

        let job = SimilarityRefreshJob::new(store.clone(), settings());
        let stats = job.run().await;

        assert_eq!(stats.edges_purged, 1);
        assert!(store.similarity_edges().await.is_empty());
    }

    #[tokio::test]
    async fn test_clustering_failure_is_partial() {
        let mut store = MockRecommendationStore::new();
        store.expect_purge_similarity_edges().returning(|_| Ok(0));
        store.expect_active_user_ids().returning(|_| Ok(vec![1, 2, 3]));
        store.expect_ratings_for_users().returning(|_, _| Ok(vec![]));
        store.expect_survey_vectors().returning(|_| Ok(vec![]));
        store.expect_upsert_similarity_edges().returning(|_| Ok(()));
        store
            .expect_read_similarity_edges()
            .returning(|_| Err(AppError::Internal("timeout".to_string())));

        let job = SimilarityRefreshJob::new(Arc::new(store), settings());
        let stats = job.run().await;

        assert_eq!(stats.users_processed, 3);
        assert_eq!(stats.failed_steps, vec!["clustering".to_string()]);
        assert_eq!(stats.clusters_updated, 0);
    }

    #[tokio::test]
    async fn test_failed_assignment_skips_only_that_user() {
        let attempted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = attempted.clone();

        let mut store = MockRecommendationStore::new();
        store.expect_purge_similarity_edges().returning(|_| Ok(0));
        store.expect_active_user_ids().returning(|_| Ok((1..=6).collect()));
        store.expect_ratings_for_users().returning(|_, _| Ok(vec![]));
        store.expect_survey_vectors().returning(|_| Ok(vec![]));
        store.expect_upsert_similarity_edges().returning(|_| Ok(()));
        store.expect_read_similarity_edges().returning(|_| {
            let now = Utc::now();
            let mut edges = Vec::new();
            for a in 1..=6 {
                for b in (a + 1)..=6 {
                    edges.push(UserSimilarityEdge::new(a, b, 0.9, 0.0, 0.63, 3, now));
                }
            }
            Ok(edges)
        });
        store.expect_set_user_cluster().returning(move |user_id, _| {
            seen.lock().unwrap().push(user_id);
            if user_id == 3 {
                Err(AppError::NotFound(format!("user {}", user_id)))
            } else {
                Ok(())
            }
        });
        store.expect_cluster_members().returning(|_| Ok(vec![]));

        let job = SimilarityRefreshJob::new(Arc::new(store), settings());
        let stats = job.run().await;

        let mut attempted = attempted.lock().unwrap().clone();
        attempted.sort();
        assert_eq!(attempted, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stats.clusters_updated, 5);
        assert_eq!(stats.failed_steps, vec!["cluster_assignment".to_string()]);
    }
}
