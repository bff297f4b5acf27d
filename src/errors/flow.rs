// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors raised while validating and executing flow definitions.

use thiserror::Error;

use super::node::NodeError;

/// Errors that can occur while validating a flow definition.
///
/// All of these are construction-time failures: a flow that passes
/// validation compiles into an executor; one that fails never executes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The definition could not be interpreted as a flow at all.
    #[error("Invalid flow definition: {reason}")]
    InvalidDefinition { reason: String },

    /// A flow must contain at least one node.
    #[error("Flow definition contains no nodes")]
    EmptyFlow,

    /// A node is missing a usable identifier.
    #[error("Node at position {index} has an empty id")]
    EmptyNodeId { index: usize },

    /// Two nodes share an identifier.
    #[error("Duplicate node id: '{node_id}'")]
    DuplicateNodeId { node_id: String },

    /// An edge references a node that is not part of the flow.
    #[error("Edge {side} references non-existent node: '{node_id}'")]
    UnknownEdgeEndpoint { node_id: String, side: &'static str },

    /// The same `(source, handle) -> (target, handle)` edge appears twice.
    #[error("Duplicate edge from '{from_node}' to '{target}'")]
    DuplicateEdge { from_node: String, target: String },

    /// A node connects to itself.
    #[error("Self-loop on node '{node_id}'")]
    SelfLoop { node_id: String },

    /// The graph contains a directed cycle; `path` is one concrete cycle.
    #[error("Cycle detected in flow graph: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// A node declares a type the registry does not know.
    #[error("Unknown node type '{node_type}' on node '{node_id}'")]
    UnknownNodeType { node_id: String, node_type: String },

    /// A node's config does not match its type's schema.
    #[error("Invalid config for node '{node_id}': {reason}")]
    InvalidNodeConfig { node_id: String, reason: String },
}

/// Errors surfaced by a flow invocation.
#[derive(Error, Debug)]
pub enum FlowError {
    /// The definition failed validation at executor construction.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A node failed and no enclosing try/catch absorbed it.
    #[error(transparent)]
    Node(#[from] NodeError),
}
