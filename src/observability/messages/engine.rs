// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for flow execution lifecycle events.

use std::fmt::{Display, Formatter};

use crate::errors::NodeError;
use crate::observability::messages::StructuredLog;

/// A flow invocation started.
pub struct FlowExecutionStarted<'a> {
    pub flow_id: &'a str,
    pub execution_id: &'a str,
    pub node_count: usize,
}

impl Display for FlowExecutionStarted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Starting flow execution {}: flow={}, {} nodes",
            self.execution_id, self.flow_id, self.node_count
        )
    }
}

impl StructuredLog for FlowExecutionStarted<'_> {
    fn log(&self) {
        tracing::info!(
            flow_id = self.flow_id,
            execution_id = self.execution_id,
            node_count = self.node_count,
            "{}",
            self
        );
    }
}

/// A flow invocation ran to completion.
pub struct FlowExecutionCompleted<'a> {
    pub flow_id: &'a str,
    pub execution_id: &'a str,
    pub nodes_executed: usize,
    pub elapsed: f64,
}

impl Display for FlowExecutionCompleted<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Flow execution {} completed: {} nodes in {:.3}s",
            self.execution_id, self.nodes_executed, self.elapsed
        )
    }
}

impl StructuredLog for FlowExecutionCompleted<'_> {
    fn log(&self) {
        tracing::info!(
            flow_id = self.flow_id,
            execution_id = self.execution_id,
            nodes_executed = self.nodes_executed,
            elapsed = self.elapsed,
            "{}",
            self
        );
    }
}

/// A node was skipped because its branch was not taken.
pub struct NodeSuppressed<'a> {
    pub node_id: &'a str,
    pub execution_id: &'a str,
}

impl Display for NodeSuppressed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Node '{}' suppressed by branch gating in {}",
            self.node_id, self.execution_id
        )
    }
}

impl StructuredLog for NodeSuppressed<'_> {
    fn log(&self) {
        tracing::debug!(
            node_id = self.node_id,
            execution_id = self.execution_id,
            "{}",
            self
        );
    }
}

/// A node failed inside a try/catch scope and its output was replaced.
pub struct NodeFailedWithFallback<'a> {
    pub node_id: &'a str,
    pub execution_id: &'a str,
    pub error: &'a NodeError,
    pub fallback_rows: usize,
}

impl Display for NodeFailedWithFallback<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Node '{}' failed in {}; substituted fallback with {} rows: {}",
            self.node_id, self.execution_id, self.fallback_rows, self.error
        )
    }
}

impl StructuredLog for NodeFailedWithFallback<'_> {
    fn log(&self) {
        tracing::warn!(
            node_id = self.node_id,
            execution_id = self.execution_id,
            error = %self.error,
            fallback_rows = self.fallback_rows,
            "{}",
            self
        );
    }
}
