// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRead<T> {
    pub valid: bool,
    pub data: Option<T>,
    /// `Duration::MAX` when nothing was ever stored.
    pub age: Duration,
}

#[derive(Debug)]
struct Entry<T> {
    data: Option<T>,
    stored_at: Option<Instant>,
    invalidated: bool,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Self {
            data: None,
            stored_at: None,
            invalidated: false,
        }
    }
}

/// Per-cluster snapshot cache. Reads never block and expired payloads are kept.
#[derive(Debug)]
pub struct HealthCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T: Clone> HealthCache<T> {
    pub fn new<I, S>(clusters: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ttl,
            entries: Mutex::new(
                clusters
                    .into_iter()
                    .map(|cluster| (cluster.into(), Entry::default()))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, cluster: &str) -> CacheRead<T> {
        self.get_with_ttl(cluster, self.ttl)
    }

    pub fn get_with_ttl(&self, cluster: &str, ttl: Duration) -> CacheRead<T> {
        let entries = self.lock();
        let Some(entry) = entries.get(cluster) else {
            return CacheRead {
                valid: false,
                data: None,
                age: Duration::MAX,
            };
        };
        let age = entry
            .stored_at
            .map(|stored| stored.elapsed())
            .unwrap_or(Duration::MAX);
        CacheRead {
            valid: entry.data.is_some() && !entry.invalidated && age < ttl,
            data: entry.data.clone(),
            age,
        }
    }

    /// Returns false (and stores nothing) for a cluster the cache was not built with.
    pub fn set(&self, cluster: &str, data: T) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(cluster) {
            Some(entry) => {
                entry.data = Some(data);
                entry.stored_at = Some(Instant::now());
                entry.invalidated = false;
                true
            }
            None => false,
        }
    }

    /// Marks one cluster, or all with `None`, as invalid. Payloads stay readable.
    pub fn invalidate(&self, cluster: Option<&str>) {
        let mut entries = self.lock();
        match cluster {
            Some(cluster) => {
                if let Some(entry) = entries.get_mut(cluster) {
                    entry.invalidated = true;
                }
            }
            None => entries.values_mut().for_each(|entry| entry.invalidated = true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> HealthCache<u32> {
        HealthCache::new(["gemini", "apollo"], Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn empty_and_unknown_entries_are_invalid() {
        let cache = cache();
        for cluster in ["gemini", "nowhere"] {
            let read = cache.get(cluster);
            assert!(!read.valid);
            assert_eq!(read.data, None);
            assert_eq!(read.age, Duration::MAX);
        }
        assert!(!cache.set("nowhere", 1));
        assert_eq!(cache.get("nowhere").data, None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_but_keep_their_payload() {
        let cache = cache();
        assert!(cache.set("gemini", 7));
        let fresh = cache.get("gemini");
        assert!(fresh.valid);
        assert_eq!(fresh.data, Some(7));

        tokio::time::advance(Duration::from_secs(31)).await;
        let stale = cache.get("gemini");
        assert!(!stale.valid);
        assert_eq!(stale.data, Some(7));
        assert!(stale.age >= Duration::from_secs(31));
        assert!(cache.get_with_ttl("gemini", Duration::from_secs(60)).valid);

        cache.set("gemini", 8);
        let reset = cache.get("gemini");
        assert!(reset.valid);
        assert!(reset.age < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_targets_one_or_all_clusters() {
        let cache = cache();
        cache.set("gemini", 1);
        cache.set("apollo", 2);

        cache.invalidate(Some("gemini"));
        assert!(!cache.get("gemini").valid);
        assert_eq!(cache.get("gemini").data, Some(1));
        assert!(cache.get("apollo").valid);

        cache.invalidate(None);
        assert!(!cache.get("apollo").valid);
        assert_eq!(cache.get("apollo").data, Some(2));
    }
}
