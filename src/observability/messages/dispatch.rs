// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for dispatch request outcomes.

use std::fmt::{Display, Formatter};

use crate::observability::messages::StructuredLog;

/// A published-API request began executing.
pub struct DispatchStarted<'a> {
    pub endpoint: &'a str,
    pub execution_id: &'a str,
    pub method: &'a str,
}

impl Display for DispatchStarted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "API execution started: {} {} ({})",
            self.method, self.endpoint, self.execution_id
        )
    }
}

impl StructuredLog for DispatchStarted<'_> {
    fn log(&self) {
        tracing::info!(
            endpoint = self.endpoint,
            execution_id = self.execution_id,
            method = self.method,
            "{}",
            self
        );
    }
}

/// A published-API request finished.
pub struct DispatchCompleted<'a> {
    pub endpoint: &'a str,
    pub execution_id: &'a str,
    pub elapsed: f64,
    pub result_bytes: usize,
}

impl Display for DispatchCompleted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "API execution completed: {} in {:.3}s ({} result bytes)",
            self.endpoint, self.elapsed, self.result_bytes
        )
    }
}

impl StructuredLog for DispatchCompleted<'_> {
    fn log(&self) {
        tracing::info!(
            endpoint = self.endpoint,
            execution_id = self.execution_id,
            elapsed = self.elapsed,
            result_bytes = self.result_bytes,
            "{}",
            self
        );
    }
}

/// A published-API request failed.
pub struct DispatchFailed<'a> {
    pub endpoint: &'a str,
    pub execution_id: &'a str,
    pub elapsed: f64,
    pub error: &'a str,
}

impl Display for DispatchFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "API execution failed: {} after {:.3}s: {}",
            self.endpoint, self.elapsed, self.error
        )
    }
}

impl StructuredLog for DispatchFailed<'_> {
    fn log(&self) {
        tracing::error!(
            endpoint = self.endpoint,
            execution_id = self.execution_id,
            elapsed = self.elapsed,
            error = self.error,
            "{}",
            self
        );
    }
}
