// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Node runtime: the operator algebra executed over tables.
//!
//! Every vertex in a flow is an implementation of [`FlowNode`]: it is
//! constructed once from its config when the executor compiles the flow,
//! and invoked with a map of named inputs plus the execution context on
//! every request. Nodes are grouped the way the registry groups them:
//!
//! * [`sources`] — materialize tables from databases, files, HTTP or config
//! * [`transforms`] — column-level reshaping of a single input table
//! * [`reshape`] — aggregation, joins, windows and the script sandbox
//! * [`sinks`] — observable side effects; always pass their input through
//! * [`control`] — branch gates, try/catch guards and N-ary merges
//!
//! Utility node types (`trigger`, `flow_parameter`, `set_get_variable`,
//! `comment`) never execute in the data plane; the executor folds their
//! config into the global variables at startup and skips them.

pub mod control;
pub mod registry;
pub mod reshape;
pub mod sinks;
pub mod sources;
pub mod transforms;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::context::ExecutionContext;
use crate::errors::{NodeError, NodeErrorKind};
use crate::table::Table;

/// A value flowing between nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowValue {
    /// The common case: a table on a data edge.
    Table(Table),
    /// A branch decision emitted by `conditional_branch`.
    Bool(bool),
    /// A raw JSON value, used for globals and request-derived inputs.
    Json(Value),
    /// The registered output of a suppressed node.
    Null,
}

impl FlowValue {
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            FlowValue::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FlowValue::Null)
    }

    /// Short kind name used in execution logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowValue::Table(_) => "table",
            FlowValue::Bool(_) => "bool",
            FlowValue::Json(_) => "json",
            FlowValue::Null => "null",
        }
    }
}

/// Named inputs for one node invocation, in insertion order.
///
/// Handle-bound inputs are inserted first (in edge declaration order), then
/// global variables are merged without overwriting handle-bound keys. Order
/// matters: `merge { first_available }` and the "first table input" rule
/// both follow it.
#[derive(Debug, Clone, Default)]
pub struct InputMap {
    entries: Vec<(String, FlowValue)>,
}

impl InputMap {
    pub fn new() -> InputMap {
        InputMap::default()
    }

    /// Insert a binding; the first write to a key wins.
    pub fn insert(&mut self, key: impl Into<String>, value: FlowValue) {
        let key = key.into();
        if !self.contains(&key) {
            self.entries.push((key, value));
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<&FlowValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FlowValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First table value in insertion order, if any.
    pub fn first_table(&self) -> Option<&Table> {
        self.entries.iter().find_map(|(_, v)| v.as_table())
    }

    /// All table values in insertion order.
    pub fn tables(&self) -> Vec<&Table> {
        self.entries.iter().filter_map(|(_, v)| v.as_table()).collect()
    }

    /// The input table, or a `missing_input` error naming the node.
    pub fn require_table(&self, node_id: &str) -> Result<&Table, NodeError> {
        self.first_table().ok_or_else(|| {
            NodeError::new(
                node_id,
                NodeErrorKind::MissingInput,
                "no table found in input data",
            )
        })
    }

    /// A scalar view of a binding, used by parameter mappings.
    pub fn scalar(&self, key: &str) -> Option<Value> {
        match self.get(key)? {
            FlowValue::Json(value) => Some(value.clone()),
            FlowValue::Bool(b) => Some(Value::Bool(*b)),
            FlowValue::Table(_) | FlowValue::Null => None,
        }
    }
}

/// The capability set every node implements.
///
/// `invoke` must be pure relative to its declared inputs and configuration;
/// sinks are the sanctioned exception and still return their input table
/// unchanged. Instances are shared across concurrent invocations of a
/// cached executor, so implementations hold config only, never per-request
/// state.
#[async_trait]
pub trait FlowNode: Send + Sync {
    /// The node's id within its flow.
    fn id(&self) -> &str;

    /// The registered type string.
    fn node_type(&self) -> &'static str;

    async fn invoke(
        &self,
        inputs: &InputMap,
        ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError>;
}

impl std::fmt::Debug for dyn FlowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowNode")
            .field("id", &self.id())
            .field("node_type", &self.node_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CellValue;

    fn table() -> Table {
        Table::from_rows(
            &["a".to_string()],
            vec![vec![CellValue::Integer(1)]],
        )
        .unwrap()
    }

    #[test]
    fn input_map_keeps_insertion_order_and_first_write() {
        let mut inputs = InputMap::new();
        inputs.insert("x", FlowValue::Json(Value::from(1)));
        inputs.insert("t", FlowValue::Table(table()));
        inputs.insert("x", FlowValue::Json(Value::from(2)));

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.scalar("x"), Some(Value::from(1)));
        assert!(inputs.first_table().is_some());
    }

    #[test]
    fn require_table_reports_the_node() {
        let inputs = InputMap::new();
        let err = inputs.require_table("n1").unwrap_err();
        assert_eq!(err.node_id, "n1");
        assert_eq!(err.kind, NodeErrorKind::MissingInput);
    }
}
