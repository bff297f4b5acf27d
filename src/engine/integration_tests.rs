use serde_json::{json, Value};

use crate::engine::context::test_services;
use crate::engine::{FlowExecutor, FlowResult, Invocation, UserContext};
use crate::flow::FlowDefinition;
use crate::nodes::FlowValue;
use crate::table::{CellValue, Table};

/// Integration tests driving full flows through the executor with real
/// node implementations.
#[cfg(test)]
mod tests {
    use super::*;

    fn executor(value: Value) -> FlowExecutor {
        FlowExecutor::new(&FlowDefinition::from_value(value).unwrap()).unwrap()
    }

    fn invocation(input: Value) -> Invocation {
        Invocation {
            input_data: input.as_object().cloned().unwrap_or_default(),
            execution_id: "exec_integration".to_string(),
            user: UserContext::anonymous(),
            services: test_services(),
        }
    }

    async fn run_to_table(executor: &FlowExecutor, input: Value) -> Table {
        match executor.invoke(invocation(input)).await.unwrap() {
            FlowResult::Value(FlowValue::Table(table)) => table,
            other => panic!("expected a single table result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn aggregate_then_pivot_pipeline() {
        let executor = executor(json!({
            "id": "sales-report",
            "nodes": [
                {"id": "sales", "type": "static_data", "config": {
                    "source": "array",
                    "array_data": [
                        ["east", "q1", 10],
                        ["east", "q2", 20],
                        ["west", "q1", 5],
                        ["west", "q1", 15]
                    ],
                    "columns": ["region", "quarter", "amount"]
                }},
                {"id": "rollup", "type": "group_aggregate", "config": {
                    "group_by": ["region", "quarter"],
                    "aggregations": {"amount": "sum"}
                }},
                {"id": "wide", "type": "pivot_table", "config": {
                    "values": "amount",
                    "index": "region",
                    "columns": "quarter",
                    "aggfunc": "sum",
                    "fill_value": 0
                }},
                {"id": "out", "type": "display_results", "config": {}}
            ],
            "edges": [
                {"source": "sales", "target": "rollup"},
                {"source": "rollup", "target": "wide"},
                {"source": "wide", "target": "out"}
            ]
        }));

        let table = run_to_table(&executor, json!({})).await;
        assert_eq!(table.column_names(), vec!["region", "q1", "q2"]);
        assert_eq!(table.cell(0, "q1"), Some(&CellValue::Integer(10)));
        assert_eq!(table.cell(1, "q1"), Some(&CellValue::Integer(20)));
        assert_eq!(table.cell(1, "q2"), Some(&CellValue::Integer(0)));
    }

    #[tokio::test]
    async fn branch_then_merge_supports_partial_inputs() {
        // Either the filtered branch or the sampled branch runs; the merge
        // takes whichever produced a value.
        let executor = executor(json!({
            "nodes": [
                {"id": "src", "type": "static_data", "config": {
                    "source": "array",
                    "array_data": [[1], [2], [3], [4]],
                    "columns": ["n"]
                }},
                {"id": "gate", "type": "conditional_branch", "config": {
                    "condition_type": "row_count",
                    "condition_value": {"operator": "gt", "threshold": 3}
                }},
                {"id": "evens", "type": "filter_rows", "config": {
                    "expression": "n % 2 == 0"
                }},
                {"id": "top_one", "type": "sample_rows", "config": {
                    "method": "head", "n": 1
                }},
                {"id": "join_point", "type": "merge", "config": {
                    "merge_strategy": "first_available"
                }},
                {"id": "out", "type": "display_results", "config": {}}
            ],
            "edges": [
                {"source": "src", "target": "gate"},
                {"source": "src", "target": "evens"},
                {"source": "src", "target": "top_one"},
                {"source": "gate", "target": "evens", "sourceHandle": "true"},
                {"source": "gate", "target": "top_one", "sourceHandle": "false"},
                {"source": "evens", "target": "join_point"},
                {"source": "top_one", "target": "join_point"},
                {"source": "join_point", "target": "out"}
            ]
        }));

        // Four rows: the gate decides true, the filter branch survives.
        let table = run_to_table(&executor, json!({})).await;
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "n"), Some(&CellValue::Integer(2)));
    }

    #[tokio::test]
    async fn try_catch_custom_fallback_feeds_downstream_nodes() {
        let executor = executor(json!({
            "nodes": [
                {"id": "src", "type": "static_data", "config": {
                    "source": "array", "array_data": [["abc"]], "columns": ["id"]
                }},
                {"id": "bad_cast", "type": "change_data_type", "config": {
                    "conversions": {"id": "integer"}
                }},
                {"id": "guard", "type": "try_catch", "config": {
                    "fallback_strategy": "custom",
                    "custom_fallback_data": [{"status": "degraded", "id": -1}]
                }},
                {"id": "labeled", "type": "add_modify_column", "config": {
                    "definitions": {"checked": {"literal": true}}
                }}
            ],
            "edges": [
                {"source": "src", "target": "bad_cast"},
                {"source": "bad_cast", "target": "guard"},
                {"source": "guard", "target": "labeled"}
            ]
        }));

        let table = run_to_table(&executor, json!({})).await;
        assert_eq!(
            table.cell(0, "status"),
            Some(&CellValue::String("degraded".into()))
        );
        assert_eq!(table.cell(0, "checked"), Some(&CellValue::Boolean(true)));
    }

    #[tokio::test]
    async fn script_node_runs_inside_a_flow() {
        let executor = executor(json!({
            "nodes": [
                {"id": "src", "type": "static_data", "config": {
                    "source": "text",
                    "text_data": "sku,price,quantity\na,10,3\nb,50,4\nc,2,1"
                }},
                {"id": "script", "type": "run_python_script", "config": {
                    "script_code": "derive total = price * quantity; filter total > 20; select sku, total"
                }}
            ],
            "edges": [{"source": "src", "target": "script"}]
        }));

        let table = run_to_table(&executor, json!({})).await;
        assert_eq!(table.column_names(), vec!["sku", "total"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(1, "total"), Some(&CellValue::Integer(200)));
    }

    #[tokio::test]
    async fn request_payload_reaches_webhook_listener_through_globals() {
        // The dispatch layer seeds globals from the request body; the
        // webhook listener picks up `webhook_data` from there.
        let executor = executor(json!({
            "nodes": [
                {"id": "hook", "type": "webhook_listener", "config": {}},
                {"id": "adults", "type": "filter_rows", "config": {
                    "expression": "age >= 30"
                }}
            ],
            "edges": [{"source": "hook", "target": "adults"}]
        }));

        let payload = json!({
            "webhook_data": [
                {"name": "ana", "age": 31},
                {"name": "bo", "age": 18},
                {"name": "cy", "age": 47}
            ]
        });
        let table = run_to_table(&executor, payload).await;
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "name"), Some(&CellValue::String("ana".into())));
    }
}
