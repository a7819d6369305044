//! Cluster Manager: k-means over the stored similarity graph and the
//! cluster-level weighted ratings derived from it.

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    error::{AppError, AppResult},
    models::{ClusterId, RestaurantId, UserId, UserRating, UserSimilarityEdge, WeightedRatingCell},
};

/// Only edges above this similarity take part in clustering
pub const CLUSTER_EDGE_THRESHOLD: f64 = 0.2;
/// Fewer qualifying edges than this and clustering is skipped
pub const MIN_CLUSTER_EDGES: usize = 10;
pub const MIN_CLUSTER_MEMBERS: usize = 3;
pub const MIN_RESTAURANT_RATERS: usize = 3;

const KMEANS_RESTARTS: usize = 10;
const KMEANS_MAX_ITERATIONS: usize = 300;
const CELL_WINDOW_DAYS: i64 = 365;
const CELL_DECAY_DAYS: f64 = 180.0;
const TREND_WINDOW_DAYS: i64 = 60;

/// k = max(2, min(20, users / 10))
pub fn cluster_count(active_users: usize) -> usize {
    (active_users / 10).clamp(2, 20)
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(point, c)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

/// k-means++ seeding
fn seed_centroids(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = vec![points[rng.gen_range(0..points.len())].clone()];

    while centroids.len() < k {
        let weights: Vec<f64> = points.iter().map(|p| nearest(p, &centroids).1).collect();
        let total: f64 = weights.iter().sum();

        let index = if total <= 0.0 {
            rng.gen_range(0..points.len())
        } else {
            let target = rng.gen::<f64>() * total;
            let mut acc = 0.0;
            weights
                .iter()
                .position(|w| {
                    acc += w;
                    acc >= target
                })
                .unwrap_or(points.len() - 1)
        };
        centroids.push(points[index].clone());
    }

    centroids
}

/// One Lloyd run, returning labels and inertia
fn lloyd(points: &[Vec<f64>], mut centroids: Vec<Vec<f64>>) -> (Vec<usize>, f64) {
    let dims = points[0].len();
    let mut labels = vec![usize::MAX; points.len()];

    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (point, label) in points.iter().zip(labels.iter_mut()) {
            let (closest, _) = nearest(point, &centroids);
            if *label != closest {
                *label = closest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0; dims]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (point, &label) in points.iter().zip(&labels) {
            counts[label] += 1;
            for (s, v) in sums[label].iter_mut().zip(point) {
                *s += v;
            }
        }
        for (i, centroid) in centroids.iter_mut().enumerate() {
            // empty clusters keep their previous centroid
            if counts[i] > 0 {
                *centroid = sums[i].iter().map(|s| s / counts[i] as f64).collect();
            }
        }
    }

    let inertia = points
        .iter()
        .zip(&labels)
        .map(|(p, &l)| squared_distance(p, &centroids[l]))
        .sum();
    (labels, inertia)
}

/// Seeded k-means with restarts; the lowest-inertia run wins
///
/// Labels are renumbered by first appearance so the same partition always
/// gets the same ids.
pub fn kmeans(points: &[Vec<f64>], k: usize, seed: u64) -> AppResult<Vec<ClusterId>> {
    if k == 0 || points.len() < k {
        return Err(AppError::Clustering(format!(
            "cannot split {} points into {} clusters",
            points.len(),
            k
        )));
    }
    let dims = points[0].len();
    if points.iter().any(|p| p.len() != dims || p.iter().any(|v| !v.is_finite())) {
        return Err(AppError::Clustering("points must be finite and equally sized".to_string()));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<(Vec<usize>, f64)> = None;
    for _ in 0..KMEANS_RESTARTS {
        let centroids = seed_centroids(points, k, &mut rng);
        let run = lloyd(points, centroids);
        if best.as_ref().map_or(true, |b| run.1 < b.1) {
            best = Some(run);
        }
    }

    let (labels, _) = best.ok_or_else(|| AppError::Clustering("k-means produced no run".to_string()))?;

    let mut renumbered: HashMap<usize, ClusterId> = HashMap::new();
    Ok(labels
        .into_iter()
        .map(|label| {
            let next = renumbered.len() as ClusterId;
            *renumbered.entry(label).or_insert(next)
        })
        .collect())
}

/// Partitions `candidates` over the similarity graph
///
/// Returns `Ok(None)` when too few strong edges join the candidates.
pub fn assign_clusters(
    candidates: &[UserId],
    edges: &[UserSimilarityEdge],
    seed: u64,
) -> AppResult<Option<BTreeMap<UserId, ClusterId>>> {
    let index: HashMap<UserId, usize> = candidates.iter().enumerate().map(|(i, u)| (*u, i)).collect();

    let strong: Vec<&UserSimilarityEdge> = edges
        .iter()
        .filter(|e| e.overall_similarity > CLUSTER_EDGE_THRESHOLD)
        .filter(|e| index.contains_key(&e.user_a) && index.contains_key(&e.user_b))
        .collect();

    if strong.len() < MIN_CLUSTER_EDGES {
        tracing::info!(
            edges = strong.len(),
            required = MIN_CLUSTER_EDGES,
            "Not enough similarities for clustering"
        );
        return Ok(None);
    }

    let n = candidates.len();
    let mut similarity = vec![vec![0.0; n]; n];
    for edge in strong {
        let (i, j) = (index[&edge.user_a], index[&edge.user_b]);
        similarity[i][j] = edge.overall_similarity;
        similarity[j][i] = edge.overall_similarity;
    }
    let distances: Vec<Vec<f64>> = similarity
        .into_iter()
        .map(|row| row.into_iter().map(|s| 1.0 - s).collect())
        .collect();

    let k = cluster_count(n);
    let labels = kmeans(&distances, k, seed)?;

    Ok(Some(candidates.iter().copied().zip(labels).collect()))
}

/// A cluster member's rating plus how many ratings that member has overall
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRating {
    pub user_id: UserId,
    pub rating: f64,
    pub created_at: DateTime<Utc>,
    pub rater_total_ratings: usize,
}

/// Weighted rating of one restaurant within one cluster
///
/// Ratings older than a year are ignored. `None` when fewer than
/// [`MIN_RESTAURANT_RATERS`] distinct members remain.
pub fn weighted_rating_cell(
    restaurant_id: RestaurantId,
    cluster_id: ClusterId,
    ratings: &[ClusterRating],
    now: DateTime<Utc>,
) -> Option<WeightedRatingCell> {
    let cutoff = now - Duration::days(CELL_WINDOW_DAYS);
    let recent: Vec<&ClusterRating> = ratings.iter().filter(|r| r.created_at > cutoff).collect();

    let raters: BTreeSet<UserId> = recent.iter().map(|r| r.user_id).collect();
    if raters.len() < MIN_RESTAURANT_RATERS {
        return None;
    }

    let weights: Vec<f64> = recent
        .iter()
        .map(|r| {
            let days = (now - r.created_at).num_days().max(0) as f64;
            let experience = (r.rater_total_ratings as f64 / 20.0).min(2.0);
            (-days / CELL_DECAY_DAYS).exp() * experience
        })
        .collect();
    let weight_sum: f64 = weights.iter().sum();
    if weight_sum <= 0.0 {
        return None;
    }

    let weighted_avg = recent
        .iter()
        .zip(&weights)
        .map(|(r, w)| r.rating * w)
        .sum::<f64>()
        / weight_sum;
    let variance = recent
        .iter()
        .zip(&weights)
        .map(|(r, w)| w * (r.rating - weighted_avg).powi(2))
        .sum::<f64>()
        / weight_sum;
    let effective_sample_size = weight_sum.powi(2) / weights.iter().map(|w| w * w).sum::<f64>();

    let trend_cutoff = now - Duration::days(TREND_WINDOW_DAYS);
    let (fresh, stale): (Vec<f64>, Vec<f64>) = {
        let mut fresh = Vec::new();
        let mut stale = Vec::new();
        for r in &recent {
            if r.created_at > trend_cutoff {
                fresh.push(r.rating);
            } else {
                stale.push(r.rating);
            }
        }
        (fresh, stale)
    };
    let recent_trend = if fresh.is_empty() || stale.is_empty() {
        0.0
    } else {
        fresh.iter().sum::<f64>() / fresh.len() as f64 - stale.iter().sum::<f64>() / stale.len() as f64
    };

    Some(WeightedRatingCell {
        restaurant_id,
        cluster_id,
        weighted_avg_rating: weighted_avg,
        confidence: (effective_sample_size / 10.0).min(1.0),
        total_ratings: recent.len() as i32,
        rating_variance: variance,
        recent_trend,
        last_computed: now,
    })
}

/// Every weighted cell for one cluster
///
/// `ratings` holds the members' ratings; `rating_totals` each member's total
/// rating count.
pub fn compute_cluster_cells(
    cluster_id: ClusterId,
    ratings: &[UserRating],
    rating_totals: &HashMap<UserId, usize>,
    now: DateTime<Utc>,
) -> Vec<WeightedRatingCell> {
    let mut by_restaurant: BTreeMap<RestaurantId, Vec<ClusterRating>> = BTreeMap::new();
    for rating in ratings {
        by_restaurant
            .entry(rating.restaurant_id)
            .or_default()
            .push(ClusterRating {
                user_id: rating.user_id,
                rating: rating.rating,
                created_at: rating.created_at,
                rater_total_ratings: rating_totals.get(&rating.user_id).copied().unwrap_or(1),
            });
    }

    by_restaurant
        .into_iter()
        .filter_map(|(restaurant_id, ratings)| {
            weighted_rating_cell(restaurant_id, cluster_id, &ratings, now)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_count() {
        assert_eq!(cluster_count(45), 4);
        assert_eq!(cluster_count(5), 2);
        assert_eq!(cluster_count(20), 2);
        assert_eq!(cluster_count(1000), 20);
    }

    fn blobs() -> Vec<Vec<f64>> {
        vec![
            vec![0.0, 0.1],
            vec![0.1, 0.0],
            vec![0.05, 0.05],
            vec![5.0, 5.1],
            vec![5.1, 5.0],
            vec![5.05, 5.05],
        ]
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let labels = kmeans(&blobs(), 2, 42).unwrap();
        assert_eq!(labels, vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_kmeans_is_deterministic() {
        let points: Vec<Vec<f64>> = (0..30)
            .map(|i| vec![(i % 7) as f64, (i % 5) as f64 * 0.3])
            .collect();
        assert_eq!(kmeans(&points, 3, 7).unwrap(), kmeans(&points, 3, 7).unwrap());
    }

    #[test]
    fn test_kmeans_rejects_too_few_points() {
        assert!(matches!(
            kmeans(&[vec![1.0]], 2, 42),
            Err(AppError::Clustering(_))
        ));
    }

    fn edge(a: UserId, b: UserId, overall: f64) -> UserSimilarityEdge {
        UserSimilarityEdge::new(a, b, overall, 0.0, overall, 2, Utc::now())
    }

    #[test]
    fn test_assign_clusters_needs_ten_strong_edges() {
        let users: Vec<UserId> = (1..=6).collect();
        let edges: Vec<UserSimilarityEdge> = (1..6).map(|u| edge(u, u + 1, 0.9)).collect();
        assert_eq!(assign_clusters(&users, &edges, 42).unwrap(), None);

        // weak edges never count
        let weak: Vec<UserSimilarityEdge> = (1..=12).map(|u| edge(u, u + 100, 0.18)).collect();
        assert_eq!(assign_clusters(&users, &weak, 42).unwrap(), None);
    }

    #[test]
    fn test_assign_clusters_two_groups() {
        let users: Vec<UserId> = (1..=8).collect();
        let mut edges = Vec::new();
        for group in [[1, 2, 3, 4], [5, 6, 7, 8]] {
            for i in 0..4 {
                for j in i + 1..4 {
                    edges.push(edge(group[i], group[j], 0.9));
                }
            }
        }

        let assignment = assign_clusters(&users, &edges, 42).unwrap().unwrap();
        assert_eq!(assignment.len(), 8);
        assert_eq!(assignment[&1], assignment[&4]);
        assert_eq!(assignment[&5], assignment[&8]);
        assert_ne!(assignment[&1], assignment[&5]);
    }

    fn cluster_rating(user_id: UserId, rating: f64, days_ago: i64, total: usize) -> ClusterRating {
        ClusterRating {
            user_id,
            rating,
            created_at: Utc::now() - Duration::days(days_ago),
            rater_total_ratings: total,
        }
    }

    #[test]
    fn test_weighted_cell_needs_three_raters() {
        let ratings = vec![cluster_rating(1, 4.0, 1, 20), cluster_rating(2, 5.0, 1, 20)];
        assert!(weighted_rating_cell(1, 0, &ratings, Utc::now()).is_none());
    }

    #[test]
    fn test_weighted_cell_equal_weights() {
        let now = Utc::now();
        let ratings = vec![
            cluster_rating(1, 3.0, 0, 20),
            cluster_rating(2, 4.0, 0, 20),
            cluster_rating(3, 5.0, 0, 20),
        ];
        let cell = weighted_rating_cell(9, 2, &ratings, now).unwrap();

        assert!((cell.weighted_avg_rating - 4.0).abs() < 1e-9);
        assert!((cell.rating_variance - 2.0 / 3.0).abs() < 1e-9);
        assert!((cell.confidence - 0.3).abs() < 1e-9);
        assert_eq!(cell.total_ratings, 3);
        assert_eq!(cell.recent_trend, 0.0);
        assert_eq!((cell.restaurant_id, cell.cluster_id), (9, 2));
    }

    #[test]
    fn test_weighted_cell_trend() {
        let ratings = vec![
            cluster_rating(1, 5.0, 5, 20),
            cluster_rating(2, 5.0, 10, 20),
            cluster_rating(3, 3.0, 100, 20),
        ];
        let cell = weighted_rating_cell(1, 0, &ratings, Utc::now()).unwrap();
        assert!((cell.recent_trend - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_cell_ignores_old_ratings() {
        let ratings = vec![
            cluster_rating(1, 5.0, 5, 20),
            cluster_rating(2, 5.0, 10, 20),
            cluster_rating(3, 1.0, 400, 20),
        ];
        assert!(weighted_rating_cell(1, 0, &ratings, Utc::now()).is_none());
    }
}
