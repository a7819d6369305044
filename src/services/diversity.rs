use std::collections::HashMap;

use crate::services::scoring::ScoredCandidate;

/// Picks up to `limit` items from a score-sorted list, capping repeats
///
/// An item is taken only while fewer than `max(2, limit / 4)` items of its
/// cuisine and fewer than `max(2, limit / 3)` items of its price level have
/// been taken. Skipped items are not revisited.
pub fn select_diverse(ranked: Vec<ScoredCandidate>, limit: usize) -> Vec<ScoredCandidate> {
    let cuisine_cap = (limit / 4).max(2);
    let price_cap = (limit / 3).max(2);

    let mut cuisine_counts: HashMap<Option<String>, usize> = HashMap::new();
    let mut price_counts: HashMap<Option<i16>, usize> = HashMap::new();
    let mut selected = Vec::with_capacity(limit);

    for item in ranked {
        if selected.len() >= limit {
            break;
        }

        let restaurant = &item.candidate.restaurant;
        let cuisine = restaurant.cuisine_type.as_ref().map(|c| c.to_lowercase());
        let price = restaurant.price_level;

        let cuisine_taken = cuisine_counts.get(&cuisine).copied().unwrap_or(0);
        let price_taken = price_counts.get(&price).copied().unwrap_or(0);
        if cuisine_taken >= cuisine_cap || price_taken >= price_cap {
            continue;
        }

        *cuisine_counts.entry(cuisine).or_insert(0) += 1;
        *price_counts.entry(price).or_insert(0) += 1;
        selected.push(item);
    }

    selected
}
