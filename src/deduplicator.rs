//! Deduplication filters for assignment and exposure tracking.
//!
//! Tracking delivery itself is delegated to an external analytics client; these filters only
//! answer "has this exact (user, results) combination been tracked recently?". The decision is a
//! pure memoization over a canonical key held in a TTL/LRU cache.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::TtlLruCache;
use crate::flag::{ExperimentUser, Variant};

/// Default number of canonical keys remembered by a filter.
pub const DEFAULT_FILTER_CAPACITY: usize = 65536;
/// Default time before an identical combination is tracked again.
pub const DEFAULT_FILTER_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Suppresses repeated tracking of identical evaluation results.
pub struct AssignmentFilter {
    seen: Mutex<TtlLruCache<String, ()>>,
}

impl AssignmentFilter {
    pub fn new(capacity: usize, ttl: Duration) -> AssignmentFilter {
        AssignmentFilter {
            seen: Mutex::new(TtlLruCache::new(capacity, ttl)),
        }
    }

    /// Whether this (user, results) combination should be forwarded to the analytics client.
    ///
    /// Returns `false` for empty result sets and for combinations seen within the TTL. Returns
    /// `true`, and records the combination, when it is unseen or its previous record expired.
    pub fn should_track(
        &self,
        user: &ExperimentUser,
        results: &HashMap<String, Variant>,
    ) -> bool {
        if results.is_empty() {
            return false;
        }
        let key = canonicalize(user, results);
        let mut seen = self
            .seen
            .lock()
            .expect("thread holding dedup cache lock should not panic");
        if seen.get(&key).is_some() {
            return false;
        }
        seen.put(key, ());
        true
    }
}

impl Default for AssignmentFilter {
    fn default() -> AssignmentFilter {
        AssignmentFilter::new(DEFAULT_FILTER_CAPACITY, DEFAULT_FILTER_TTL)
    }
}

/// Canonical dedup key: user id, device id, then flag/variant pairs ordered by flag key so the
/// key is independent of result iteration order.
fn canonicalize(user: &ExperimentUser, results: &HashMap<String, Variant>) -> String {
    let mut parts = vec![
        user.user_id.clone().unwrap_or_default(),
        user.device_id.clone().unwrap_or_default(),
    ];
    let mut flag_keys: Vec<&String> = results.keys().collect();
    flag_keys.sort();
    for flag_key in flag_keys {
        parts.push(flag_key.clone());
        parts.push(variant_identity(&results[flag_key]));
    }
    parts.join(" ")
}

fn variant_identity(variant: &Variant) -> String {
    if let Some(key) = &variant.key {
        return key.clone();
    }
    match &variant.value {
        Some(serde_json::Value::String(value)) => value.clone(),
        Some(value) => value.to_string(),
        None => String::new(),
    }
}
