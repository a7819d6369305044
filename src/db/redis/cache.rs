use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use redis::Client;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::error::AppResult;
use crate::models::{RecommendationRequest, UserId};

const SCAN_BATCH: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// One cached recommendation list, keyed by everything that shapes it
    Recommendations {
        user_id: UserId,
        kind: String,
        lat: Option<String>,
        lng: Option<String>,
        max_distance_km: Option<String>,
        cuisines: Vec<String>,
        price_levels: Vec<i16>,
        limit: usize,
    },
    /// Glob matching every cached list for one user
    UserRecommendations(UserId),
}

impl CacheKey {
    /// Builds the key for a request
    ///
    /// Coordinates are rounded to three decimals so requests from a few metres
    /// apart share an entry. Filter lists are sorted so their order is irrelevant.
    pub fn for_request(request: &RecommendationRequest) -> Self {
        let mut cuisines: Vec<String> = request
            .filters
            .cuisines
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        cuisines.sort();
        cuisines.dedup();

        let mut price_levels = request.filters.price_levels.clone();
        price_levels.sort_unstable();
        price_levels.dedup();

        CacheKey::Recommendations {
            user_id: request.user_id,
            kind: request.kind.to_string(),
            lat: request.location.map(|l| format!("{:.3}", l.lat)),
            lng: request.location.map(|l| format!("{:.3}", l.lng)),
            max_distance_km: request.filters.max_distance_km.map(|d| format!("{}", d)),
            cuisines,
            price_levels,
            limit: request.limit,
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Recommendations {
                user_id,
                kind,
                lat,
                lng,
                max_distance_km,
                cuisines,
                price_levels,
                limit,
            } => {
                let prices: Vec<String> = price_levels.iter().map(|p| p.to_string()).collect();
                write!(
                    f,
                    "rec:{}:{}:{}:{}:{}:{}:{}:{}",
                    user_id,
                    kind,
                    lat.as_deref().unwrap_or("-"),
                    lng.as_deref().unwrap_or("-"),
                    max_distance_km.as_deref().unwrap_or("-"),
                    cuisines.join(","),
                    prices.join(","),
                    limit
                )
            }
            CacheKey::UserRecommendations(user_id) => write!(f, "rec:{}:*", user_id),
        }
    }
}

/// Creates a Redis client for caching
///
/// Opening the client does not connect; connections are made lazily by
/// [`Cache`] with bounded timeouts.
pub fn create_redis_client(redis_url: &str) -> anyhow::Result<Client> {
    let client = Client::open(redis_url)?;
    Ok(client)
}

/// Message for asynchronous cache writes
struct CacheWriteMessage {
    key: String,
    value: String,
    ttl: u64,
}

/// Cache handler for storing and retrieving recommendation lists in Redis
///
/// Every read and connect is bounded by `timeout`, so an unreachable Redis
/// costs a request at most that long before the caller falls back to computing.
#[derive(Clone)]
pub struct Cache {
    redis_client: Client,
    write_tx: mpsc::UnboundedSender<CacheWriteMessage>,
    timeout: Duration,
}

/// Handle for gracefully shutting down the cache writer
pub struct CacheWriterHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl CacheWriterHandle {
    /// Signals the writer task to flush pending writes and stop
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tracing::info!("Cache writer shutdown signal sent");
    }
}

impl Cache {
    /// Creates a new Cache instance with an async write background task
    pub async fn new(redis_client: Client, timeout: Duration) -> (Self, CacheWriterHandle) {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let client = redis_client.clone();
        tokio::spawn(async move {
            Self::cache_writer_task(client, timeout, write_rx, shutdown_rx).await;
        });

        let cache = Self {
            redis_client,
            write_tx,
            timeout,
        };

        let handle = CacheWriterHandle { shutdown_tx };

        (cache, handle)
    }

    /// Background task that processes cache write messages
    ///
    /// On shutdown signal, flushes all remaining messages before exiting.
    async fn cache_writer_task(
        client: Client,
        timeout: Duration,
        mut write_rx: mpsc::UnboundedReceiver<CacheWriteMessage>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!("Cache writer task started");

        loop {
            tokio::select! {
                Some(msg) = write_rx.recv() => {
                    if let Err(e) = Self::write_to_redis(&client, timeout, msg).await {
                        tracing::warn!(error = %e, "Failed to write to Redis cache");
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Cache writer shutting down, flushing remaining writes");

                    write_rx.close();
                    while let Some(msg) = write_rx.recv().await {
                        if let Err(e) = Self::write_to_redis(&client, timeout, msg).await {
                            tracing::warn!(error = %e, "Failed to flush cache write during shutdown");
                        }
                    }

                    tracing::info!("Cache writer task stopped");
                    break;
                }
            }
        }
    }

    async fn connect(client: &Client, timeout: Duration) -> AppResult<MultiplexedConnection> {
        let conn = client
            .get_multiplexed_async_connection_with_timeouts(timeout, timeout)
            .await?;
        Ok(conn)
    }

    async fn write_to_redis(
        client: &Client,
        timeout: Duration,
        msg: CacheWriteMessage,
    ) -> AppResult<()> {
        let mut conn = Self::connect(client, timeout).await?;
        let _: () = conn.set_ex(msg.key, msg.value, msg.ttl).await?;
        Ok(())
    }

    /// Retrieves a value from the cache by key
    ///
    /// Returns `None` on a miss. A stored value that no longer deserializes is
    /// reported as an error rather than a miss.
    pub async fn get_from_cache<T: serde::de::DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> AppResult<Option<T>> {
        let mut conn = Self::connect(&self.redis_client, self.timeout).await?;
        let cached: Option<String> = conn.get(key.to_string()).await?;

        match cached {
            Some(json) => {
                let data = serde_json::from_str(&json).map_err(|e| {
                    AppError::Internal(format!("Cache deserialization error: {}", e))
                })?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Queues a write without waiting for Redis
    pub fn set_in_background<T: serde::Serialize>(&self, key: &CacheKey, value: &T, ttl: u64) {
        let json = match serde_json::to_string(value) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Cache serialization error");
                return;
            }
        };

        let msg = CacheWriteMessage {
            key: key.to_string(),
            value: json,
            ttl,
        };

        if let Err(e) = self.write_tx.send(msg) {
            tracing::error!(error = %e, "Failed to send cache write message");
        }
    }

    /// Drops every cached recommendation list for one user
    ///
    /// Walks the keyspace with SCAN so a large cache never blocks Redis.
    pub async fn invalidate_user(&self, user_id: UserId) -> AppResult<u64> {
        let mut conn = Self::connect(&self.redis_client, self.timeout).await?;
        let pattern = CacheKey::UserRecommendations(user_id).to_string();

        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(keys).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(user_id, removed, "Invalidated cached recommendations");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Location, RecommendationFilters, RecommendationKind};

    fn request() -> RecommendationRequest {
        RecommendationRequest {
            user_id: 7,
            location: Some(Location {
                lat: 35.91321,
                lng: -79.05589,
            }),
            filters: RecommendationFilters {
                max_distance_km: Some(5.0),
                cuisines: vec!["Thai".to_string(), "italian".to_string()],
                price_levels: vec![3, 1],
            },
            limit: 10,
            kind: RecommendationKind::ForYou,
        }
    }

    #[test]
    fn test_cache_key_display_recommendations() {
        let key = CacheKey::for_request(&request());
        assert_eq!(
            key.to_string(),
            "rec:7:for-you:35.913:-79.056:5:italian,thai:1,3:10"
        );
    }

    #[test]
    fn test_cache_key_ignores_filter_order() {
        let mut reordered = request();
        reordered.filters.cuisines.reverse();
        reordered.filters.price_levels.reverse();

        assert_eq!(
            CacheKey::for_request(&request()),
            CacheKey::for_request(&reordered)
        );
    }

    #[test]
    fn test_cache_key_separates_kinds() {
        let mut trending = request();
        trending.kind = RecommendationKind::Trending;

        assert_ne!(
            CacheKey::for_request(&request()).to_string(),
            CacheKey::for_request(&trending).to_string()
        );
    }

    #[test]
    fn test_cache_key_without_location() {
        let mut req = request();
        req.location = None;
        req.filters = RecommendationFilters::default();

        assert_eq!(
            CacheKey::for_request(&req).to_string(),
            "rec:7:for-you:-:-:-:::10"
        );
    }

    #[test]
    fn test_user_pattern_matches_request_keys() {
        let pattern = CacheKey::UserRecommendations(7).to_string();
        let key = CacheKey::for_request(&request()).to_string();

        assert_eq!(pattern, "rec:7:*");
        assert!(key.starts_with(pattern.trim_end_matches('*')));
    }

    #[tokio::test]
    async fn test_unreachable_redis_reports_error() {
        let client = create_redis_client("redis://127.0.0.1:1").unwrap();
        let (cache, _handle) = Cache::new(client, Duration::from_millis(100)).await;

        let key = CacheKey::for_request(&request());
        let result: AppResult<Option<Vec<String>>> = cache.get_from_cache(&key).await;

        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_set_then_invalidate_user() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let client = create_redis_client(&redis_url).unwrap();
        let (cache, handle) = Cache::new(client, Duration::from_millis(250)).await;

        let key = CacheKey::for_request(&request());
        cache.set_in_background(&key, &vec![1, 2, 3], 60);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let hit: Option<Vec<i32>> = cache.get_from_cache(&key).await.unwrap();
        assert_eq!(hit, Some(vec![1, 2, 3]));

        let removed = cache.invalidate_user(7).await.unwrap();
        assert!(removed >= 1);

        let miss: Option<Vec<i32>> = cache.get_from_cache(&key).await.unwrap();
        assert_eq!(miss, None);

        handle.shutdown().await;
    }
}
