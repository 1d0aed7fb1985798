//! TTL cache for view results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::model::ViewDefinition;
use super::runner::ViewResult;

/// Everything that determines a view's output for a given data snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub view_name: String,
    pub resource_type: String,
    /// Sorted search parameters.
    pub search_params: Vec<(String, String)>,
    pub where_paths: Vec<String>,
    /// Canonical JSON of the select tree and constants.
    pub select_signature: String,
}

impl CacheKey {
    pub fn for_view(view: &ViewDefinition, search_params: &[(String, String)]) -> Self {
        let mut params = search_params.to_vec();
        params.sort();
        let signature = serde_json::json!({
            "select": view.select,
            "constant": view.constant,
        });
        Self {
            view_name: view.name.clone(),
            resource_type: view.resource.clone(),
            search_params: params,
            where_paths: view.where_.iter().map(|w| w.path.clone()).collect(),
            select_signature: signature.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub ttl_secs: u64,
}

struct CacheEntry {
    result: Arc<ViewResult>,
    inserted_at: Instant,
}

pub struct ViewCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ViewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a live entry; expired entries are evicted and count as misses.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<ViewResult>> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let hit = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.result.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Store a result, sweeping out every entry that has already expired.
    pub fn insert(&self, key: CacheKey, result: Arc<ViewResult>) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            let ttl = self.ttl;
            let before = entries.len();
            entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
            let swept = before - entries.len();
            if swept > 0 {
                tracing::debug!("[ViewCache] Swept {} expired entries", swept);
            }
            entries.insert(
                key,
                CacheEntry {
                    result,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Drop every entry for a view; returns how many were removed.
    pub fn invalidate_view(&self, view_name: &str) -> usize {
        match self.entries.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|k, _| k.view_name != view_name);
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.lock().map(|e| e.len()).unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view(path: &str) -> ViewDefinition {
        ViewDefinition::from_value(json!({
            "name": "v",
            "resource": "Patient",
            "select": [{ "column": [{ "name": "c", "path": path }] }]
        }))
        .unwrap()
    }

    fn result() -> Arc<ViewResult> {
        Arc::new(ViewResult {
            view_name: "v".into(),
            resource_type: "Patient".into(),
            columns: vec!["c".into()],
            rows: vec![vec![json!(1)]],
            resource_count: 1,
            from_cache: false,
            elapsed_ms: 0,
        })
    }

    #[test]
    fn test_key_distinguishes_shape_and_params() {
        let a = CacheKey::for_view(&view("id"), &[("b".into(), "2".into()), ("a".into(), "1".into())]);
        let b = CacheKey::for_view(&view("id"), &[("a".into(), "1".into()), ("b".into(), "2".into())]);
        assert_eq!(a, b);
        assert_ne!(a, CacheKey::for_view(&view("gender"), &[]));
    }

    #[test]
    fn test_hits_misses_and_ttl() {
        let cache = ViewCache::new(Duration::from_secs(60));
        let key = CacheKey::for_view(&view("id"), &[]);
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), result());
        assert!(cache.get(&key).is_some());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));

        assert_eq!(cache.invalidate_view("v"), 1);
        assert!(cache.get(&key).is_none());

        let expired = ViewCache::new(Duration::from_millis(1));
        expired.insert(key.clone(), result());
        std::thread::sleep(Duration::from_millis(5));
        assert!(expired.get(&key).is_none());
        assert_eq!(expired.stats().entries, 0);
    }

    #[test]
    fn test_insert_sweeps_expired_entries() {
        let cache = ViewCache::new(Duration::from_millis(20));
        for i in 0..3 {
            let key = CacheKey::for_view(&view("id"), &[("page".into(), i.to_string())]);
            cache.insert(key, result());
        }
        assert_eq!(cache.stats().entries, 3);

        std::thread::sleep(Duration::from_millis(40));
        let fresh = CacheKey::for_view(&view("gender"), &[]);
        cache.insert(fresh.clone(), result());
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.get(&fresh).is_some());
    }
}
