use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::AnalysisRecord;

/// Time-bounded memoization of expensive group/class computations, keyed by
/// content fingerprint.
///
/// Expiry is lazy: stale entries are treated as absent on read but never
/// proactively purged, and `put` overwrites wholesale. There is no eviction
/// beyond TTL; cardinality stays moderate at this scale.
#[derive(Debug, Clone)]
pub struct ResultCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    payload: Value,
    stored_at: DateTime<Utc>,
}

impl ResultCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Utc::now()).await
    }

    /// Read with an explicit clock, so TTL behavior is testable.
    pub async fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Value> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if now - entry.stored_at <= self.ttl => {
                debug!(key, "Cache hit");
                Some(entry.payload.clone())
            }
            Some(_) => {
                debug!(key, "Cache entry expired");
                None
            }
            None => {
                debug!(key, "Cache miss");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, payload: Value) {
        self.put_at(key, payload, Utc::now()).await;
    }

    /// Write with an explicit clock. Always overwrites, refreshing the TTL
    /// window for the key.
    pub async fn put_at(&self, key: &str, payload: Value, now: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                stored_at: now,
            },
        );
        debug!(key, size = entries.len(), "Cache entry stored");
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Digest over the ordered identity+outcome fields of a deduplicated batch.
pub fn grouping_fingerprint(records: &[AnalysisRecord]) -> String {
    let basis = records
        .iter()
        .map(|r| format!("{}|{}|{}", r.id, r.data.main_error, r.data.error_percentage))
        .collect::<Vec<_>>()
        .join(";");
    format!("{:x}", Sha256::digest(basis.as_bytes()))
}

/// Grouping digest namespaced by class name, so identical record sets under
/// different class names never collide.
pub fn class_fingerprint(records: &[AnalysisRecord], class_name: &str) -> String {
    format!("class:{}:{}", class_name, grouping_fingerprint(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn entry_is_hit_within_ttl_and_miss_after() {
        let cache = ResultCache::new(120);
        let t0 = Utc::now();
        cache.put_at("key", json!({"groups": []}), t0).await;

        assert!(cache.get_at("key", t0 + Duration::seconds(119)).await.is_some());
        assert!(cache.get_at("key", t0 + Duration::seconds(120)).await.is_some());
        assert!(cache.get_at("key", t0 + Duration::seconds(121)).await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_not_purged() {
        let cache = ResultCache::new(120);
        let t0 = Utc::now();
        cache.put_at("key", json!(1), t0).await;

        assert!(cache.get_at("key", t0 + Duration::seconds(300)).await.is_none());
        assert_eq!(cache.entry_count().await, 1);
    }

    #[tokio::test]
    async fn put_refreshes_the_ttl_window() {
        let cache = ResultCache::new(120);
        let t0 = Utc::now();
        cache.put_at("key", json!(1), t0).await;
        cache.put_at("key", json!(2), t0 + Duration::seconds(100)).await;

        let hit = cache.get_at("key", t0 + Duration::seconds(200)).await.unwrap();
        assert_eq!(hit, json!(2));
        assert_eq!(cache.entry_count().await, 1);
    }

    #[test]
    fn class_fingerprint_is_namespaced() {
        let records = Vec::new();
        let a = class_fingerprint(&records, "5th A");
        let b = class_fingerprint(&records, "5th B");
        assert_ne!(a, b);
        assert!(a.starts_with("class:5th A:"));
    }

    #[test]
    fn fingerprint_tracks_outcome_fields() {
        use crate::models::AnalysisData;
        let make = |pct: u8| AnalysisRecord {
            id: "a1".to_string(),
            student_name: "Anna".to_string(),
            subject: "Math".to_string(),
            timestamp: Utc::now(),
            data: AnalysisData {
                image_url: None,
                detected_text: String::new(),
                main_error: "fractions".to_string(),
                error_percentage: pct,
                concepts: Vec::new(),
                suggestions: Vec::new(),
                reasoning: None,
                raw_payload: None,
                legacy: None,
                score: None,
                student_feedback: None,
            },
        };
        assert_eq!(grouping_fingerprint(&[make(40)]), grouping_fingerprint(&[make(40)]));
        assert_ne!(grouping_fingerprint(&[make(40)]), grouping_fingerprint(&[make(41)]));
    }
}
