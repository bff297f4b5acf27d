// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Registry mapping node type strings to constructors.
//!
//! The registry is a closed table: a type string either resolves here or
//! the flow fails validation at executor construction, never at execute
//! time. Utility types are recognized but have no runtime constructor; the
//! executor folds them into global variables and skips them.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::control::{ConditionalBranchNode, MergeNode, TryCatchNode};
use super::reshape::{
    ApplyFunctionNode, DeduplicateNode, GroupAggregateNode, HandleMissingValuesNode, JoinMergeNode,
    MeltNode, PivotTableNode, RunScriptNode, SortDataNode, UnionConcatenateNode,
    WindowFunctionsNode,
};
use super::sinks::{
    ApiRequestNode, DisplayResultsNode, FileWriterNode, SendNotificationNode, TableWriterNode,
};
use super::sources::{
    ApiEndpointNode, CustomSqlNode, FileInputNode, StaticDataNode, TableReaderNode,
    WebhookListenerNode,
};
use super::transforms::{
    AddModifyColumnNode, ChangeDataTypeNode, FilterRowsNode, MapValuesNode, RenameColumnsNode,
    SampleRowsNode, SelectColumnsNode, SplitColumnNode,
};
use super::FlowNode;
use crate::errors::ValidationError;
use crate::flow::NodeSpec;

/// Node types whose only effect is to seed global variables.
const UTILITY_TYPES: &[&str] = &["trigger", "flow_parameter", "set_get_variable", "comment"];

/// Whether a node type is a non-executing utility.
pub fn is_utility(node_type: &str) -> bool {
    UTILITY_TYPES.contains(&node_type)
}

/// Whether a node type is known to the registry at all.
pub fn is_registered(node_type: &str) -> bool {
    is_utility(node_type) || available_node_types().contains(&node_type)
}

/// All executable node types, grouped source → transform → sink → control.
pub fn available_node_types() -> &'static [&'static str] {
    &[
        // sources
        "table_reader",
        "custom_sql",
        "file_input",
        "api_endpoint",
        "static_data",
        "webhook_listener",
        // transforms
        "select_columns",
        "filter_rows",
        "sample_rows",
        "rename_columns",
        "change_data_type",
        "add_modify_column",
        "split_column",
        "map_values",
        "handle_missing_values",
        "deduplicate",
        "sort_data",
        "pivot_table",
        "melt",
        "group_aggregate",
        "window_functions",
        "join_merge",
        "union_concatenate",
        "apply_function",
        "run_python_script",
        // sinks
        "table_writer",
        "file_writer",
        "api_request",
        "display_results",
        "send_notification",
        // control
        "conditional_branch",
        "try_catch",
        "merge",
    ]
}

fn parse_config<T: DeserializeOwned>(spec: &NodeSpec) -> Result<T, ValidationError> {
    serde_json::from_value(Value::Object(spec.config.clone())).map_err(|e| {
        ValidationError::InvalidNodeConfig {
            node_id: spec.id.clone(),
            reason: e.to_string(),
        }
    })
}

/// Build a node instance from its spec.
///
/// # Errors
/// - [`ValidationError::UnknownNodeType`] for a type the registry does not
///   know (utility types included; they have no instances).
/// - [`ValidationError::InvalidNodeConfig`] if the config does not match
///   the type's schema, including unparseable embedded expressions.
pub fn build_node(spec: &NodeSpec) -> Result<Arc<dyn FlowNode>, ValidationError> {
    let id = spec.id.clone();
    let node: Arc<dyn FlowNode> = match spec.node_type.as_str() {
        // sources
        "table_reader" => Arc::new(TableReaderNode::new(id, parse_config(spec)?)),
        "custom_sql" => Arc::new(CustomSqlNode::new(id, parse_config(spec)?)),
        "file_input" => Arc::new(FileInputNode::new(id, parse_config(spec)?)),
        "api_endpoint" => Arc::new(ApiEndpointNode::new(id, parse_config(spec)?)),
        "static_data" => Arc::new(StaticDataNode::new(id, parse_config(spec)?)),
        "webhook_listener" => Arc::new(WebhookListenerNode::new(id)),

        // transforms
        "select_columns" => Arc::new(SelectColumnsNode::new(id, parse_config(spec)?)),
        "filter_rows" => Arc::new(FilterRowsNode::from_spec(id, &spec.config)?),
        "sample_rows" => Arc::new(SampleRowsNode::new(id, parse_config(spec)?)),
        "rename_columns" => Arc::new(RenameColumnsNode::new(id, parse_config(spec)?)),
        "change_data_type" => Arc::new(ChangeDataTypeNode::new(id, parse_config(spec)?)),
        "add_modify_column" => Arc::new(AddModifyColumnNode::from_spec(id, &spec.config)?),
        "split_column" => Arc::new(SplitColumnNode::new(id, parse_config(spec)?)),
        "map_values" => Arc::new(MapValuesNode::new(id, parse_config(spec)?)),
        "handle_missing_values" => Arc::new(HandleMissingValuesNode::new(id, parse_config(spec)?)),
        "deduplicate" => Arc::new(DeduplicateNode::new(id, parse_config(spec)?)),
        "sort_data" => Arc::new(SortDataNode::new(id, parse_config(spec)?)),
        "pivot_table" => Arc::new(PivotTableNode::new(id, parse_config(spec)?)),
        "melt" => Arc::new(MeltNode::new(id, parse_config(spec)?)),
        "group_aggregate" => Arc::new(GroupAggregateNode::new(id, parse_config(spec)?)),
        "window_functions" => Arc::new(WindowFunctionsNode::new(id, parse_config(spec)?)),
        "join_merge" => Arc::new(JoinMergeNode::new(id, parse_config(spec)?)),
        "union_concatenate" => Arc::new(UnionConcatenateNode::new(id, parse_config(spec)?)),
        "apply_function" => Arc::new(ApplyFunctionNode::from_spec(id, &spec.config)?),
        "run_python_script" => Arc::new(RunScriptNode::from_spec(id, &spec.config)?),

        // sinks
        "table_writer" => Arc::new(TableWriterNode::new(id, parse_config(spec)?)),
        "file_writer" => Arc::new(FileWriterNode::new(id, parse_config(spec)?)),
        "api_request" => Arc::new(ApiRequestNode::new(id, parse_config(spec)?)),
        "display_results" => Arc::new(DisplayResultsNode::new(id, parse_config(spec)?)),
        "send_notification" => Arc::new(SendNotificationNode::new(id, parse_config(spec)?)),

        // control
        "conditional_branch" => Arc::new(ConditionalBranchNode::from_spec(id, &spec.config)?),
        "try_catch" => Arc::new(TryCatchNode::new(id)),
        "merge" => Arc::new(MergeNode::new(id, parse_config(spec)?)),

        other => {
            return Err(ValidationError::UnknownNodeType {
                node_id: spec.id.clone(),
                node_type: other.to_string(),
            })
        }
    };
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(node_type: &str, config: Value) -> NodeSpec {
        NodeSpec {
            id: "n1".to_string(),
            node_type: node_type.to_string(),
            config: config.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn known_types_build() {
        let node = build_node(&spec(
            "static_data",
            json!({"source": "array", "array_data": [[1]], "columns": ["a"]}),
        ))
        .unwrap();
        assert_eq!(node.node_type(), "static_data");

        let node = build_node(&spec("display_results", json!({}))).unwrap();
        assert_eq!(node.node_type(), "display_results");
    }

    #[test]
    fn unknown_type_fails_at_construction() {
        assert!(matches!(
            build_node(&spec("quantum_blend", json!({}))),
            Err(ValidationError::UnknownNodeType { .. })
        ));
    }

    #[test]
    fn bad_config_is_reported_with_the_node_id() {
        let err = build_node(&spec("select_columns", json!({}))).unwrap_err();
        match err {
            ValidationError::InvalidNodeConfig { node_id, .. } => assert_eq!(node_id, "n1"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn utility_types_are_recognized_but_not_buildable() {
        assert!(is_utility("trigger"));
        assert!(is_registered("comment"));
        assert!(!is_utility("static_data"));
        assert!(matches!(
            build_node(&spec("trigger", json!({}))),
            Err(ValidationError::UnknownNodeType { .. })
        ));
    }

    #[test]
    fn every_listed_type_is_distinct() {
        let types = available_node_types();
        let mut unique: Vec<&str> = types.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), types.len());
    }
}
