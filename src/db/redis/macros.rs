/// Read-through caching that never fails because of the cache.
///
/// Looks `$key` up in `$cache`. A hit is returned as is. On a miss the block is
/// awaited, its `Ok` value queued for a background write with `$ttl` seconds,
/// and returned. A failed cache read is logged and treated as a miss, so a
/// Redis outage only costs latency.
///
/// With `keep_if = $pred`, an `Ok` value is only written when `$pred(&value)`
/// holds; the value is returned either way.
///
/// # Arguments
/// * `$cache`: anything with `get_from_cache` and `set_in_background`.
/// * `$key`: the [`CacheKey`](crate::db::CacheKey) to read and write.
/// * `$ttl`: time-to-live in seconds.
/// * `$block`: a future resolving to `AppResult<T>`.
///
/// # Example
/// ```rust,ignore
/// let recs = cached!(cache, key, 1800, async { engine.compute(&request).await })?;
/// let list = cached!(cache, key, 1800, engine.compute(&request), keep_if = |l: &List| l.complete)?;
/// ```
#[macro_export]
macro_rules! cached {
    ($cache:expr, $key:expr, $ttl:expr, $block:expr, keep_if = $keep:expr) => {{
        let hit = match $cache.get_from_cache(&$key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key = %$key, error = %e, "Cache read failed, computing fresh");
                None
            }
        };

        match hit {
            Some(cached) => Ok(cached),
            None => match $block.await {
                Ok(value) => {
                    if ($keep)(&value) {
                        $cache.set_in_background(&$key, &value, $ttl);
                    } else {
                        tracing::debug!(key = %$key, "Result not cacheable, skipping write");
                    }
                    Ok(value)
                }
                Err(e) => Err(e),
            },
        }
    }};
    ($cache:expr, $key:expr, $ttl:expr, $block:expr) => {
        $crate::cached!($cache, $key, $ttl, $block, keep_if = |_| true)
    };
}
