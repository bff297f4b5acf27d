// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Declarative flow definitions and their graph form.
//!
//! A flow arrives as JSON with the stable wire shape
//! `{ "id": str?, "nodes": [...], "edges": [...] }` and is deserialized into
//! [`FlowDefinition`]. [`graph::FlowGraph`] turns the definition into an
//! index-based arena that the validator, scheduler and executor work
//! against; node ids only appear at the boundaries.

pub mod graph;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ValidationError;

/// Wire form of one flow: a set of typed nodes plus directed edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

/// One vertex: a unique id, a registered type and its type-specific config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// One directed edge, optionally routed through named handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(
        default,
        rename = "sourceHandle",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,
    #[serde(
        default,
        rename = "targetHandle",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_handle: Option<String>,
}

impl FlowDefinition {
    /// Deserialize a flow from a JSON value.
    pub fn from_value(value: Value) -> Result<FlowDefinition, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::InvalidDefinition {
            reason: e.to_string(),
        })
    }

    /// Deserialize a flow from JSON text.
    pub fn from_json(text: &str) -> Result<FlowDefinition, ValidationError> {
        serde_json::from_str(text).map_err(|e| ValidationError::InvalidDefinition {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_round_trips() {
        let text = r#"{
            "id": "f1",
            "nodes": [
                {"id": "a", "type": "static_data", "config": {"source": "array"}},
                {"id": "b", "type": "display_results"}
            ],
            "edges": [
                {"source": "a", "target": "b", "sourceHandle": "out"}
            ]
        }"#;
        let flow = FlowDefinition::from_json(text).unwrap();
        assert_eq!(flow.id.as_deref(), Some("f1"));
        assert_eq!(flow.nodes.len(), 2);
        assert_eq!(flow.edges[0].source_handle.as_deref(), Some("out"));
        assert!(flow.nodes[1].config.is_empty());

        let serialized = serde_json::to_value(&flow).unwrap();
        let reparsed = FlowDefinition::from_value(serialized).unwrap();
        assert_eq!(reparsed, flow);

        // A serialize/parse round trip schedules identically.
        let original_order = graph::FlowGraph::build(&flow)
            .unwrap()
            .topological_order()
            .unwrap();
        let reparsed_order = graph::FlowGraph::build(&reparsed)
            .unwrap()
            .topological_order()
            .unwrap();
        assert_eq!(original_order, reparsed_order);
    }

    #[test]
    fn malformed_definition_is_rejected() {
        assert!(matches!(
            FlowDefinition::from_json(r#"{"nodes": "nope"}"#),
            Err(ValidationError::InvalidDefinition { .. })
        ));
    }
}
