// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for worker cache lifecycle events.

use std::fmt::{Display, Formatter};

use crate::observability::messages::StructuredLog;

/// A new worker was built and cached for a published API.
pub struct WorkerCreated<'a> {
    pub api_id: &'a str,
}

impl Display for WorkerCreated<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Created new worker for API {}", self.api_id)
    }
}

impl StructuredLog for WorkerCreated<'_> {
    fn log(&self) {
        tracing::info!(api_id = self.api_id, "{}", self);
    }
}

/// A worker left the cache.
pub struct WorkerEvicted<'a> {
    pub api_id: &'a str,
    /// `lru`, `ttl`, `reload` or `shutdown`.
    pub reason: &'static str,
}

impl Display for WorkerEvicted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Removed worker for API {} ({})", self.api_id, self.reason)
    }
}

impl StructuredLog for WorkerEvicted<'_> {
    fn log(&self) {
        tracing::info!(api_id = self.api_id, reason = self.reason, "{}", self);
    }
}

/// One reaper pass finished.
pub struct CleanupCompleted {
    pub removed: usize,
}

impl Display for CleanupCompleted {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        if self.removed == 0 {
            write!(f, "Cleanup completed: no inactive workers found")
        } else {
            write!(
                f,
                "Cleanup completed: removed {} inactive workers",
                self.removed
            )
        }
    }
}

impl StructuredLog for CleanupCompleted {
    fn log(&self) {
        if self.removed == 0 {
            tracing::debug!(removed = self.removed, "{}", self);
        } else {
            tracing::info!(removed = self.removed, "{}", self);
        }
    }
}

/// Periodic manager stats snapshot.
pub struct WorkerStatsSnapshot {
    pub total_workers: usize,
    pub active_in_last_hour: usize,
    pub total_executions: u64,
    pub avg_execution_time: f64,
}

impl Display for WorkerStatsSnapshot {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Worker stats: {} active workers, {} used in last hour, {} total executions, {:.3}s avg execution time",
            self.total_workers, self.active_in_last_hour, self.total_executions, self.avg_execution_time
        )
    }
}

impl StructuredLog for WorkerStatsSnapshot {
    fn log(&self) {
        tracing::info!(
            total_workers = self.total_workers,
            active_in_last_hour = self.active_in_last_hour,
            total_executions = self.total_executions,
            avg_execution_time = self.avg_execution_time,
            "{}",
            self
        );
    }
}
