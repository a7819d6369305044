use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, QueryBuilder};

use crate::{
    db::RecommendationStore,
    error::{AppError, AppResult},
    models::{
        ClusterId, RestaurantFeatures, RestaurantId, SurveyVector, UserId, UserRating,
        UserSimilarityEdge, WeightedRatingCell,
    },
};

/// Creates a PostgreSQL connection pool
///
/// Establishes a pool of database connections for efficient reuse.
/// The pool automatically manages connection lifecycle and limits.
pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

#[derive(FromRow)]
struct RatingRow {
    user_id: i64,
    restaurant_id: i64,
    rating: f64,
    created_at: DateTime<Utc>,
}

impl From<RatingRow> for UserRating {
    fn from(row: RatingRow) -> Self {
        Self {
            user_id: row.user_id,
            restaurant_id: row.restaurant_id,
            rating: row.rating,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct RestaurantRow {
    id: i64,
    name: String,
    cuisine_type: Option<String>,
    price_level: Option<i16>,
    avg_rating: f64,
    rating_count: i32,
    latitude: f64,
    longitude: f64,
    tags: Vec<String>,
}

impl From<RestaurantRow> for RestaurantFeatures {
    fn from(row: RestaurantRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            cuisine_type: row.cuisine_type,
            price_level: row.price_level,
            avg_rating: row.avg_rating,
            rating_count: row.rating_count,
            latitude: row.latitude,
            longitude: row.longitude,
            tags: row.tags,
        }
    }
}

#[derive(FromRow)]
struct SurveyRow {
    user_id: i64,
    preference_vector: Vec<f64>,
    preference_strength: f64,
}

impl SurveyRow {
    /// Rows with a malformed vector are treated as "no survey"
    fn into_vector(self) -> Option<(UserId, SurveyVector)> {
        match SurveyVector::new(self.preference_vector, self.preference_strength) {
            Ok(vector) => Some((self.user_id, vector)),
            Err(e) => {
                tracing::warn!(user_id = self.user_id, error = %e, "Ignoring malformed survey vector");
                None
            }
        }
    }
}

#[derive(FromRow)]
struct EdgeRow {
    user_1_id: i64,
    user_2_id: i64,
    rating_similarity: f64,
    preference_similarity: f64,
    overall_similarity: f64,
    common_restaurants_rated: i32,
    last_computed: DateTime<Utc>,
}

impl From<EdgeRow> for UserSimilarityEdge {
    fn from(row: EdgeRow) -> Self {
        UserSimilarityEdge::new(
            row.user_1_id,
            row.user_2_id,
            row.rating_similarity,
            row.preference_similarity,
            row.overall_similarity,
            row.common_restaurants_rated,
            row.last_computed,
        )
    }
}

#[derive(FromRow)]
struct CellRow {
    restaurant_id: i64,
    user_cluster: i32,
    weighted_avg_rating: f64,
    confidence_score: f64,
    total_ratings: i32,
    rating_variance: f64,
    recent_trend: f64,
    last_computed: DateTime<Utc>,
}

impl From<CellRow> for WeightedRatingCell {
    fn from(row: CellRow) -> Self {
        Self {
            restaurant_id: row.restaurant_id,
            cluster_id: row.user_cluster,
            weighted_avg_rating: row.weighted_avg_rating,
            confidence: row.confidence_score,
            total_ratings: row.total_ratings,
            rating_variance: row.rating_variance,
            recent_trend: row.recent_trend,
            last_computed: row.last_computed,
        }
    }
}

const RESTAURANT_COLUMNS: &str = r#"
    id, name, cuisine_type, price_level, avg_rating, rating_count,
    latitude, longitude, tags
"#;

const CELL_COLUMNS: &str = r#"
    restaurant_id, user_cluster, weighted_avg_rating, confidence_score,
    total_ratings, rating_variance, recent_trend, last_computed
"#;

/// [`RecommendationStore`] backed by PostgreSQL
///
/// Bulk writes are split into transactions of `batch_size` rows so a long
/// batch run never holds one huge transaction open.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgStore {
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl RecommendationStore for PgStore {
    async fn get_ratings(&self, user_id: UserId) -> AppResult<Vec<UserRating>> {
        let rows = sqlx::query_as::<_, RatingRow>(
            r#"
            SELECT user_id, restaurant_id, rating, created_at
            FROM ratings
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UserRating::from).collect())
    }

    async fn get_restaurant_features(
        &self,
        restaurant_id: RestaurantId,
    ) -> AppResult<Option<RestaurantFeatures>> {
        let row = sqlx::query_as::<_, RestaurantRow>(&format!(
            "SELECT {} FROM restaurants WHERE id = $1",
            RESTAURANT_COLUMNS
        ))
        .bind(restaurant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RestaurantFeatures::from))
    }

    async fn list_restaurant_features(&self) -> AppResult<Vec<RestaurantFeatures>> {
        let rows = sqlx::query_as::<_, RestaurantRow>(&format!(
            "SELECT {} FROM restaurants WHERE is_active = true ORDER BY id",
            RESTAURANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RestaurantFeatures::from).collect())
    }

    async fn get_survey_vector(&self, user_id: UserId) -> AppResult<Option<SurveyVector>> {
        let row = sqlx::query_as::<_, SurveyRow>(
            r#"
            SELECT user_id, preference_vector, preference_strength
            FROM bubble_preferences
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(SurveyRow::into_vector).map(|(_, v)| v))
    }

    async fn save_survey_vector(&self, user_id: UserId, vector: SurveyVector) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bubble_preferences (user_id, preference_vector, preference_strength, survey_completed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                preference_vector = EXCLUDED.preference_vector,
                preference_strength = EXCLUDED.preference_strength,
                survey_completed_at = EXCLUDED.survey_completed_at
            "#,
        )
        .bind(user_id)
        .bind(vector.weights())
        .bind(vector.strength)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn survey_vectors(&self, user_ids: &[UserId]) -> AppResult<Vec<(UserId, SurveyVector)>> {
        let rows = sqlx::query_as::<_, SurveyRow>(
            r#"
            SELECT user_id, preference_vector, preference_strength
            FROM bubble_preferences
            WHERE user_id = ANY($1)
            ORDER BY user_id
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(SurveyRow::into_vector).collect())
    }

    async fn active_user_ids(&self, since: DateTime<Utc>) -> AppResult<Vec<UserId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT user_id
            FROM ratings
            WHERE created_at > $1
            ORDER BY user_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn ratings_for_users(
        &self,
        user_ids: &[UserId],
        since: Option<DateTime<Utc>>,
    ) -> AppResult<Vec<UserRating>> {
        let rows = sqlx::query_as::<_, RatingRow>(
            r#"
            SELECT user_id, restaurant_id, rating, created_at
            FROM ratings
            WHERE user_id = ANY($1)
            AND ($2::timestamptz IS NULL OR created_at > $2)
            "#,
        )
        .bind(user_ids)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UserRating::from).collect())
    }

    async fn ratings_for_restaurants(
        &self,
        restaurant_ids: &[RestaurantId],
    ) -> AppResult<Vec<UserRating>> {
        let rows = sqlx::query_as::<_, RatingRow>(
            r#"
            SELECT user_id, restaurant_id, rating, created_at
            FROM ratings
            WHERE restaurant_id = ANY($1)
            "#,
        )
        .bind(restaurant_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UserRating::from).collect())
    }

    async fn purge_similarity_edges(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM user_similarities WHERE last_computed < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn upsert_similarity_edges(&self, edges: &[UserSimilarityEdge]) -> AppResult<()> {
        for chunk in edges.chunks(self.batch_size) {
            let mut tx = self.pool.begin().await?;

            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO user_similarities (user_1_id, user_2_id, rating_similarity, \
                 preference_similarity, overall_similarity, common_restaurants_rated, last_computed) ",
            );
            builder.push_values(chunk, |mut row, edge| {
                row.push_bind(edge.user_a)
                    .push_bind(edge.user_b)
                    .push_bind(edge.rating_similarity)
                    .push_bind(edge.preference_similarity)
                    .push_bind(edge.overall_similarity)
                    .push_bind(edge.common_restaurants)
                    .push_bind(edge.last_computed);
            });
            builder.push(
                " ON CONFLICT (user_1_id, user_2_id) DO UPDATE SET \
                 rating_similarity = EXCLUDED.rating_similarity, \
                 preference_similarity = EXCLUDED.preference_similarity, \
                 overall_similarity = EXCLUDED.overall_similarity, \
                 common_restaurants_rated = EXCLUDED.common_restaurants_rated, \
                 last_computed = EXCLUDED.last_computed",
            );

            builder.build().execute(&mut *tx).await?;
            tx.commit().await?;

            tracing::debug!(rows = chunk.len(), "Committed similarity edge batch");
        }

        Ok(())
    }

    async fn read_similarity_edges(
        &self,
        user_ids: &[UserId],
    ) -> AppResult<Vec<UserSimilarityEdge>> {
        let rows = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT user_1_id, user_2_id, rating_similarity, preference_similarity,
                   overall_similarity, common_restaurants_rated, last_computed
            FROM user_similarities
            WHERE user_1_id = ANY($1) OR user_2_id = ANY($1)
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(UserSimilarityEdge::from).collect())
    }

    async fn set_user_cluster(&self, user_id: UserId, cluster_id: ClusterId) -> AppResult<()> {
        let result = sqlx::query("UPDATE users SET similarity_cluster = $2 WHERE id = $1")
            .bind(user_id)
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("user {}", user_id)));
        }

        Ok(())
    }

    async fn get_user_cluster(&self, user_id: UserId) -> AppResult<Option<ClusterId>> {
        let cluster: Option<Option<i32>> =
            sqlx::query_scalar("SELECT similarity_cluster FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(cluster.flatten())
    }

    async fn cluster_members(&self, cluster_id: ClusterId) -> AppResult<Vec<UserId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM users WHERE similarity_cluster = $1 ORDER BY id",
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn upsert_weighted_rating_cells(&self, cells: &[WeightedRatingCell]) -> AppResult<()> {
        for chunk in cells.chunks(self.batch_size) {
            let mut tx = self.pool.begin().await?;

            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO weighted_ratings ({}) ", CELL_COLUMNS));
            builder.push_values(chunk, |mut row, cell| {
                row.push_bind(cell.restaurant_id)
                    .push_bind(cell.cluster_id)
                    .push_bind(cell.weighted_avg_rating)
                    .push_bind(cell.confidence)
                    .push_bind(cell.total_ratings)
                    .push_bind(cell.rating_variance)
                    .push_bind(cell.recent_trend)
                    .push_bind(cell.last_computed);
            });
            builder.push(
                " ON CONFLICT (restaurant_id, user_cluster) DO UPDATE SET \
                 weighted_avg_rating = EXCLUDED.weighted_avg_rating, \
                 confidence_score = EXCLUDED.confidence_score, \
                 total_ratings = EXCLUDED.total_ratings, \
                 rating_variance = EXCLUDED.rating_variance, \
                 recent_trend = EXCLUDED.recent_trend, \
                 last_computed = EXCLUDED.last_computed",
            );

            builder.build().execute(&mut *tx).await?;
            tx.commit().await?;
        }

        Ok(())
    }

    async fn read_weighted_rating_cell(
        &self,
        restaurant_id: RestaurantId,
        cluster_id: ClusterId,
    ) -> AppResult<Option<WeightedRatingCell>> {
        let row = sqlx::query_as::<_, CellRow>(&format!(
            "SELECT {} FROM weighted_ratings WHERE restaurant_id = $1 AND user_cluster = $2",
            CELL_COLUMNS
        ))
        .bind(restaurant_id)
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WeightedRatingCell::from))
    }

    async fn cluster_cells(&self, cluster_id: ClusterId) -> AppResult<Vec<WeightedRatingCell>> {
        let rows = sqlx::query_as::<_, CellRow>(&format!(
            "SELECT {} FROM weighted_ratings WHERE user_cluster = $1",
            CELL_COLUMNS
        ))
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WeightedRatingCell::from).collect())
    }
}
