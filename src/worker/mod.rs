// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Worker manager: a bounded cache of compiled flow executors.
//!
//! Executors are expensive to build and cheap to run, so the dispatch layer
//! keeps one per published API, keyed by the API id. The cache is LRU
//! bounded (`max_active_workers`), idle entries are reaped by a background
//! task every `cleanup_interval` once they pass `inactive_ttl`, and a
//! second task logs a stats snapshot. Both tasks stop through a
//! cancellation token on shutdown.
//!
//! Concurrent `acquire` calls for the same absent key build exactly one
//! executor: the first caller parks a `Building` marker in the map and
//! compiles outside the lock, later callers wait for the marker to resolve
//! and then share the same executor. A failed build clears the marker so
//! the next caller retries.
//!
//! The manager is constructed explicitly at process startup and passed by
//! reference to the dispatch layer; there are no ambient globals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backends::PublishedApi;
use crate::engine::FlowExecutor;
use crate::errors::ValidationError;
use crate::observability::messages::worker::{
    CleanupCompleted, WorkerCreated, WorkerEvicted, WorkerStatsSnapshot,
};
use crate::observability::messages::StructuredLog;

/// Tunables for the worker cache and its background jobs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_active_workers: usize,
    pub inactive_ttl: Duration,
    pub cleanup_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            max_active_workers: 50,
            inactive_ttl: Duration::from_secs(2 * 60 * 60),
            cleanup_interval: Duration::from_secs(30 * 60),
            stats_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// One cached executor plus its accounting.
struct WorkerEntry {
    executor: Arc<FlowExecutor>,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    execution_count: u64,
    total_execution_time: f64,
}

impl WorkerEntry {
    fn new(executor: Arc<FlowExecutor>) -> WorkerEntry {
        let now = Utc::now();
        WorkerEntry {
            executor,
            created_at: now,
            last_used: now,
            execution_count: 0,
            total_execution_time: 0.0,
        }
    }

    fn stats(&self) -> Value {
        json!({
            "created_at": self.created_at.to_rfc3339(),
            "last_used": self.last_used.to_rfc3339(),
            "execution_count": self.execution_count,
            "total_execution_time": self.total_execution_time,
            "avg_execution_time":
                self.total_execution_time / self.execution_count.max(1) as f64,
        })
    }
}

enum WorkerSlot {
    Ready(WorkerEntry),
    /// A build is in flight; wait and re-check.
    Building,
}

/// Bounded LRU cache of compiled executors with TTL reaping.
pub struct WorkerManager {
    settings: WorkerSettings,
    cache: Mutex<HashMap<String, WorkerSlot>>,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerManager {
    pub fn new(settings: WorkerSettings) -> WorkerManager {
        WorkerManager {
            settings,
            cache: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Return the cached executor for the API, building it first if needed.
    ///
    /// Bumps `last_used` on a cache hit. Concurrent calls for the same
    /// absent id result in exactly one build; every caller gets the same
    /// executor reference.
    pub async fn acquire(
        &self,
        api: &PublishedApi,
    ) -> Result<Arc<FlowExecutor>, ValidationError> {
        loop {
            {
                let mut cache = self.cache.lock().await;
                match cache.get_mut(&api.id) {
                    Some(WorkerSlot::Ready(entry)) => {
                        entry.last_used = Utc::now();
                        tracing::debug!(api_id = %api.id, "reusing existing worker");
                        return Ok(entry.executor.clone());
                    }
                    Some(WorkerSlot::Building) => {
                        // Another caller is compiling; fall through to wait.
                    }
                    None => {
                        self.ensure_capacity(&mut cache);
                        cache.insert(api.id.clone(), WorkerSlot::Building);
                        drop(cache);

                        // Compile outside the lock; only this caller holds
                        // the Building marker for the key.
                        let built = FlowExecutor::new(&api.flow_definition);

                        let mut cache = self.cache.lock().await;
                        return match built {
                            Ok(executor) => {
                                let executor = Arc::new(executor);
                                cache.insert(
                                    api.id.clone(),
                                    WorkerSlot::Ready(WorkerEntry::new(executor.clone())),
                                );
                                WorkerCreated { api_id: &api.id }.log();
                                Ok(executor)
                            }
                            Err(error) => {
                                // No partial entry survives a failed build.
                                cache.remove(&api.id);
                                tracing::error!(api_id = %api.id, error = %error, "failed to build worker");
                                Err(error)
                            }
                        };
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Record a completed invocation against the entry.
    pub async fn record_execution(&self, api_id: &str, elapsed: f64) {
        let mut cache = self.cache.lock().await;
        if let Some(WorkerSlot::Ready(entry)) = cache.get_mut(api_id) {
            entry.last_used = Utc::now();
            entry.execution_count += 1;
            entry.total_execution_time += elapsed;
        }
    }

    /// Evict the least-recently-used ready entry when the cache is full.
    /// At most one entry is evicted per insert.
    fn ensure_capacity(&self, cache: &mut HashMap<String, WorkerSlot>) {
        if cache.len() < self.settings.max_active_workers {
            return;
        }
        let oldest = cache
            .iter()
            .filter_map(|(id, slot)| match slot {
                WorkerSlot::Ready(entry) => Some((id.clone(), entry.last_used, entry.created_at)),
                WorkerSlot::Building => None,
            })
            .min_by_key(|(_, last_used, created_at)| (*last_used, *created_at));
        if let Some((id, _, _)) = oldest {
            cache.remove(&id);
            WorkerEvicted {
                api_id: &id,
                reason: "lru",
            }
            .log();
        }
    }

    /// Evict a specific entry; returns whether it was present.
    pub async fn force_remove(&self, api_id: &str) -> bool {
        let mut cache = self.cache.lock().await;
        let removed = matches!(cache.remove(api_id), Some(WorkerSlot::Ready(_)));
        if removed {
            WorkerEvicted {
                api_id,
                reason: "reload",
            }
            .log();
        }
        removed
    }

    /// Evict everything.
    pub async fn clear_all(&self) {
        let mut cache = self.cache.lock().await;
        let count = cache.len();
        cache.clear();
        tracing::info!(count, "cleared all workers");
    }

    /// One reaper pass: evict entries idle past `inactive_ttl`. Returns the
    /// evicted api ids.
    pub async fn reap_idle(&self) -> Vec<String> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.settings.inactive_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        let mut cache = self.cache.lock().await;
        let stale: Vec<String> = cache
            .iter()
            .filter_map(|(id, slot)| match slot {
                WorkerSlot::Ready(entry) if now - entry.last_used > ttl => Some(id.clone()),
                _ => None,
            })
            .collect();
        for id in &stale {
            cache.remove(id);
            WorkerEvicted {
                api_id: id,
                reason: "ttl",
            }
            .log();
        }
        drop(cache);
        CleanupCompleted {
            removed: stale.len(),
        }
        .log();
        stale
    }

    /// Stats for one cached entry, including its flow structure.
    pub async fn entry_info(&self, api_id: &str) -> Option<Value> {
        let cache = self.cache.lock().await;
        match cache.get(api_id)? {
            WorkerSlot::Ready(entry) => Some(json!({
                "api_id": api_id,
                "stats": entry.stats(),
                "flow_info": entry.executor.flow_info(),
            })),
            WorkerSlot::Building => None,
        }
    }

    /// Stats for every cached entry.
    pub async fn all_info(&self) -> Value {
        let cache = self.cache.lock().await;
        let mut map = Map::new();
        for (id, slot) in cache.iter() {
            if let WorkerSlot::Ready(entry) = slot {
                map.insert(
                    id.clone(),
                    json!({
                        "stats": entry.stats(),
                        "flow_info": entry.executor.flow_info(),
                    }),
                );
            }
        }
        Value::Object(map)
    }

    /// Aggregate manager statistics.
    pub async fn manager_stats(&self) -> Value {
        let cache = self.cache.lock().await;
        let now = Utc::now();
        let entries: Vec<&WorkerEntry> = cache
            .values()
            .filter_map(|slot| match slot {
                WorkerSlot::Ready(entry) => Some(entry),
                WorkerSlot::Building => None,
            })
            .collect();

        let total_executions: u64 = entries.iter().map(|e| e.execution_count).sum();
        let total_execution_time: f64 = entries.iter().map(|e| e.total_execution_time).sum();
        let active_in_last_hour = entries
            .iter()
            .filter(|e| now - e.last_used < chrono::Duration::hours(1))
            .count();
        let oldest_age = entries
            .iter()
            .map(|e| (now - e.created_at).num_milliseconds() as f64 / 1000.0)
            .fold(None::<f64>, |acc, age| Some(acc.map_or(age, |a| a.max(age))));
        let newest_age = entries
            .iter()
            .map(|e| (now - e.created_at).num_milliseconds() as f64 / 1000.0)
            .fold(None::<f64>, |acc, age| Some(acc.map_or(age, |a| a.min(age))));

        json!({
            "total_workers": entries.len(),
            "active_in_last_hour": active_in_last_hour,
            "total_executions": total_executions,
            "total_execution_time": total_execution_time,
            "oldest_worker_age": oldest_age,
            "newest_worker_age": newest_age,
        })
    }

    /// Spawn the reaper and stats jobs. Idempotent per process lifetime;
    /// call once at startup.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        let cleanup = tokio::spawn(async move {
            let period = manager.settings.cleanup_interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is not a real pass
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap_idle().await;
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        let token = self.shutdown.clone();
        let stats = tokio::spawn(async move {
            let period = manager.settings.stats_interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.log_stats().await;
                    }
                }
            }
        });

        self.tasks.lock().unwrap().extend([cleanup, stats]);
        tracing::info!("worker manager background jobs started");
    }

    async fn log_stats(&self) {
        let stats = self.manager_stats().await;
        let total_executions = stats["total_executions"].as_u64().unwrap_or(0);
        let total_time = stats["total_execution_time"].as_f64().unwrap_or(0.0);
        WorkerStatsSnapshot {
            total_workers: stats["total_workers"].as_u64().unwrap_or(0) as usize,
            active_in_last_hour: stats["active_in_last_hour"].as_u64().unwrap_or(0) as usize,
            total_executions,
            avg_execution_time: total_time / total_executions.max(1) as f64,
        }
        .log();
    }

    /// Stop the background jobs and drop every cached executor. In-flight
    /// acquires finish against the cleared cache.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        self.clear_all().await;
        tracing::info!("worker manager shutdown completed");
    }

    #[cfg(test)]
    async fn cached_ids(&self) -> Vec<String> {
        let cache = self.cache.lock().await;
        let mut ids: Vec<String> = cache.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowDefinition;
    use serde_json::json;

    fn published(id: &str) -> PublishedApi {
        let flow = FlowDefinition::from_value(json!({
            "id": format!("flow-{id}"),
            "nodes": [
                {"id": "src", "type": "static_data", "config": {
                    "source": "array", "array_data": [[1]], "columns": ["n"]
                }},
                {"id": "out", "type": "display_results", "config": {}}
            ],
            "edges": [{"source": "src", "target": "out"}]
        }))
        .unwrap();
        PublishedApi {
            id: id.to_string(),
            endpoint_path: format!("demo/{id}"),
            version: 1,
            is_active: true,
            api_name: format!("demo {id}"),
            flow_definition: flow,
        }
    }

    fn broken(id: &str) -> PublishedApi {
        let mut api = published(id);
        api.flow_definition.nodes[0].node_type = "telepathy".to_string();
        api
    }

    fn manager(max: usize) -> WorkerManager {
        WorkerManager::new(WorkerSettings {
            max_active_workers: max,
            inactive_ttl: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(20),
            stats_interval: Duration::from_secs(3600),
        })
    }

    #[tokio::test]
    async fn lru_eviction_keeps_the_most_recent_entries() {
        let manager = manager(2);
        manager.acquire(&published("1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.acquire(&published("2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.acquire(&published("3")).await.unwrap();
        assert_eq!(manager.cached_ids().await, vec!["2", "3"]);

        // Refreshing 2 makes 3 the LRU victim when 4 arrives.
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.acquire(&published("2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.acquire(&published("4")).await.unwrap();
        assert_eq!(manager.cached_ids().await, vec!["2", "4"]);
        assert!(manager.len().await <= 2);
    }

    #[tokio::test]
    async fn idle_entries_are_reaped_and_rebuilt() {
        let manager = manager(10);
        manager.acquire(&published("1")).await.unwrap();
        let before = manager.entry_info("1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let reaped = manager.reap_idle().await;
        assert_eq!(reaped, vec!["1"]);
        assert_eq!(manager.len().await, 0);

        // The next acquire builds a fresh entry.
        manager.acquire(&published("1")).await.unwrap();
        let after = manager.entry_info("1").await.unwrap();
        assert_ne!(before["stats"]["created_at"], after["stats"]["created_at"]);
    }

    #[tokio::test]
    async fn reaper_keeps_recently_used_entries() {
        let manager = manager(10);
        manager.acquire(&published("1")).await.unwrap();
        let reaped = manager.reap_idle().await;
        assert!(reaped.is_empty());
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn force_remove_then_acquire_resets_accounting() {
        let manager = manager(10);
        manager.acquire(&published("1")).await.unwrap();
        manager.record_execution("1", 0.25).await;
        let info = manager.entry_info("1").await.unwrap();
        assert_eq!(info["stats"]["execution_count"], 1);

        assert!(manager.force_remove("1").await);
        assert!(!manager.force_remove("1").await);

        manager.acquire(&published("1")).await.unwrap();
        let info = manager.entry_info("1").await.unwrap();
        assert_eq!(info["stats"]["execution_count"], 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_executor() {
        let manager = Arc::new(manager(10));
        let api = published("shared");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            let api = api.clone();
            handles.push(tokio::spawn(async move {
                manager.acquire(&api).await.unwrap()
            }));
        }
        let mut executors = Vec::new();
        for handle in handles {
            executors.push(handle.await.unwrap());
        }
        let first = &executors[0];
        assert!(executors.iter().all(|e| Arc::ptr_eq(first, e)));
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn failed_build_leaves_no_entry_and_allows_retry() {
        let manager = manager(10);
        assert!(manager.acquire(&broken("bad")).await.is_err());
        assert_eq!(manager.len().await, 0);

        // A corrected definition under the same id builds cleanly.
        manager.acquire(&published("bad")).await.unwrap();
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn background_reaper_runs_until_shutdown() {
        let manager = Arc::new(manager(10));
        manager.start();
        manager.acquire(&published("1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.len().await, 0, "reaper should have evicted the idle entry");

        manager.shutdown().await;
        manager.acquire(&published("2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.len().await, 1, "no reaping after shutdown");
    }

    #[tokio::test]
    async fn manager_stats_aggregate_entries() {
        let manager = manager(10);
        manager.acquire(&published("1")).await.unwrap();
        manager.acquire(&published("2")).await.unwrap();
        manager.record_execution("1", 0.5).await;
        manager.record_execution("1", 0.7).await;

        let stats = manager.manager_stats().await;
        assert_eq!(stats["total_workers"], 2);
        assert_eq!(stats["active_in_last_hour"], 2);
        assert_eq!(stats["total_executions"], 2);
        let total = stats["total_execution_time"].as_f64().unwrap();
        assert!((total - 1.2).abs() < 1e-9);
        assert!(stats["oldest_worker_age"].as_f64().unwrap() >= 0.0);
    }
}
