// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Node-level execution errors.

use thiserror::Error;

/// What went wrong inside a node.
///
/// The kind determines how the gateway maps the failure: permission
/// failures become 403, everything else is a 500 unless a try/catch scope
/// absorbs the error first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    /// The node's configuration is unusable at invoke time.
    Config,
    /// A required input handle carried no usable value.
    MissingInput,
    /// A referenced column does not exist in the input table.
    MissingColumn,
    /// A filter or computed-column expression failed to parse or evaluate.
    Expression,
    /// The sandboxed script failed or did not produce a table.
    Script,
    /// A cell could not be converted to the requested type.
    TypeCast,
    /// Local file I/O failed.
    Io,
    /// An outbound HTTP call failed.
    Http,
    /// The database collaborator reported a failure.
    Database,
    /// Notification delivery failed.
    Notification,
    /// An authorization check rejected the operation.
    PermissionDenied,
    /// The requested format or option is recognized but not supported.
    Unsupported,
}

impl NodeErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeErrorKind::Config => "config",
            NodeErrorKind::MissingInput => "missing_input",
            NodeErrorKind::MissingColumn => "missing_column",
            NodeErrorKind::Expression => "expression",
            NodeErrorKind::Script => "script",
            NodeErrorKind::TypeCast => "type_cast",
            NodeErrorKind::Io => "io",
            NodeErrorKind::Http => "http",
            NodeErrorKind::Database => "database",
            NodeErrorKind::Notification => "notification",
            NodeErrorKind::PermissionDenied => "permission_denied",
            NodeErrorKind::Unsupported => "unsupported",
        }
    }
}

/// Error raised by a node during `invoke`.
#[derive(Error, Debug, Clone)]
#[error("Node '{node_id}' failed ({}): {message}", .kind.name())]
pub struct NodeError {
    pub node_id: String,
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(node_id: impl Into<String>, kind: NodeErrorKind, message: impl Into<String>) -> NodeError {
        NodeError {
            node_id: node_id.into(),
            kind,
            message: message.into(),
        }
    }
}
