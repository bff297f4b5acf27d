// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Control nodes: branch gates, try/catch guards and N-ary merges.
//!
//! `conditional_branch` emits a boolean; the executor uses it to suppress
//! downstream branches keyed by `true`/`false` source handles. `try_catch`
//! is an identity node whose config defines the fallback the executor
//! substitutes when a node in its protection scope fails. `merge` reduces
//! however many of its inputs actually produced a value.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::transforms::parse_node_expression;
use super::{FlowNode, FlowValue, InputMap};
use crate::engine::context::ExecutionContext;
use crate::errors::{NodeError, NodeErrorKind, ValidationError};
use crate::expr::{eval, parse_expression, Expr, Scope};
use crate::table::{CellValue, Table};

// ---------------------------------------------------------------------------
// conditional_branch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct RowCountCondition {
    #[serde(default = "default_gt")]
    operator: String,
    #[serde(default)]
    threshold: i64,
}

fn default_gt() -> String {
    "gt".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct DataQualityCondition {
    #[serde(default = "default_completeness")]
    check: String,
    #[serde(default = "default_threshold")]
    threshold: f64,
    #[serde(default)]
    columns: Option<Vec<String>>,
    #[serde(default)]
    rule: Option<String>,
}

fn default_completeness() -> String {
    "completeness".to_string()
}

fn default_threshold() -> f64 {
    0.95
}

enum Condition {
    Expression(Expr),
    RowCount(RowCountCondition),
    ColumnExists(Vec<String>),
    DataQuality(DataQualityCondition),
}

/// Evaluate a condition over the input table and emit the boolean verdict.
pub struct ConditionalBranchNode {
    id: String,
    condition: Condition,
}

impl ConditionalBranchNode {
    pub fn from_spec(id: String, config: &Map<String, Value>) -> Result<Self, ValidationError> {
        let condition_type = config
            .get("condition_type")
            .and_then(Value::as_str)
            .unwrap_or("expression");
        let condition_value = config.get("condition_value").cloned().unwrap_or(Value::Null);
        let bad = |reason: String| ValidationError::InvalidNodeConfig {
            node_id: id.clone(),
            reason,
        };

        let condition = match condition_type {
            "expression" => {
                let source = condition_value
                    .as_str()
                    .ok_or_else(|| bad("expression conditions need a string condition_value".into()))?;
                Condition::Expression(parse_node_expression(&id, source)?)
            }
            "row_count" => Condition::RowCount(
                serde_json::from_value(condition_value).map_err(|e| bad(e.to_string()))?,
            ),
            "column_exists" => {
                let columns = match condition_value {
                    Value::String(name) => vec![name],
                    Value::Array(items) => items
                        .into_iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| bad("column_exists needs column names".into()))?,
                    _ => return Err(bad("column_exists needs a column or list".into())),
                };
                Condition::ColumnExists(columns)
            }
            "data_quality" => Condition::DataQuality(
                serde_json::from_value(condition_value).map_err(|e| bad(e.to_string()))?,
            ),
            other => return Err(bad(format!("unknown condition type '{other}'"))),
        };
        Ok(Self { id, condition })
    }

    fn evaluate(&self, table: &Table) -> Result<bool, NodeError> {
        match &self.condition {
            Condition::Expression(expr) => {
                let verdict = eval(expr, Scope::Table { table })
                    .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Expression, e))?;
                Ok(verdict.truthy())
            }
            Condition::RowCount(condition) => {
                let rows = table.row_count() as i64;
                let threshold = condition.threshold;
                match condition.operator.as_str() {
                    "gt" => Ok(rows > threshold),
                    "lt" => Ok(rows < threshold),
                    "eq" => Ok(rows == threshold),
                    "gte" => Ok(rows >= threshold),
                    "lte" => Ok(rows <= threshold),
                    other => Err(NodeError::new(
                        &self.id,
                        NodeErrorKind::Config,
                        format!("unknown operator '{other}'"),
                    )),
                }
            }
            Condition::ColumnExists(columns) => {
                Ok(columns.iter().all(|name| table.has_column(name)))
            }
            Condition::DataQuality(condition) => self.evaluate_quality(table, condition),
        }
    }

    fn evaluate_quality(
        &self,
        table: &Table,
        condition: &DataQualityCondition,
    ) -> Result<bool, NodeError> {
        if table.row_count() == 0 {
            return Ok(false);
        }
        let targets = match &condition.columns {
            Some(columns) => columns.clone(),
            None => table.column_names(),
        };
        let ratio = match condition.check.as_str() {
            "completeness" => {
                let complete = (0..table.row_count())
                    .filter(|&row| {
                        targets.iter().all(|name| {
                            table.cell(row, name).map(|c| !c.is_null()).unwrap_or(false)
                        })
                    })
                    .count();
                complete as f64 / table.row_count() as f64
            }
            "uniqueness" => {
                let mut seen = std::collections::HashSet::new();
                let unique = (0..table.row_count())
                    .filter(|&row| {
                        let key: String = targets
                            .iter()
                            .map(|name| {
                                table
                                    .cell(row, name)
                                    .map(CellValue::group_key)
                                    .unwrap_or_default()
                                    + "\u{1f}"
                            })
                            .collect();
                        seen.insert(key)
                    })
                    .count();
                unique as f64 / table.row_count() as f64
            }
            "validity" => {
                let Some(rule) = &condition.rule else {
                    return Ok(true);
                };
                // An unparseable or failing rule counts as not valid.
                let Ok(expr) = parse_expression(rule) else {
                    tracing::warn!(node_id = %self.id, rule = %rule, "invalid validity rule");
                    return Ok(false);
                };
                let mut valid = 0usize;
                for row in 0..table.row_count() {
                    match eval(&expr, Scope::Row { table, row }) {
                        Ok(cell) if cell.truthy() => valid += 1,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(node_id = %self.id, error = %e, "validity rule failed");
                            return Ok(false);
                        }
                    }
                }
                valid as f64 / table.row_count() as f64
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown quality check '{other}'"),
                ))
            }
        };
        Ok(ratio >= condition.threshold)
    }
}

#[async_trait]
impl FlowNode for ConditionalBranchNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "conditional_branch"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let empty = Table::new();
        let table = inputs.first_table().unwrap_or(&empty);
        let verdict = self.evaluate(table)?;
        tracing::info!(node_id = %self.id, verdict, "conditional branch evaluated");
        Ok(FlowValue::Bool(verdict))
    }
}

// ---------------------------------------------------------------------------
// try_catch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TryCatchConfig {
    #[serde(default = "default_return_empty")]
    pub fallback_strategy: String,
    #[serde(default)]
    pub custom_fallback_data: Vec<Map<String, Value>>,
}

fn default_return_empty() -> String {
    "return_empty".to_string()
}

impl TryCatchConfig {
    /// Compute the fallback table substituted for a failing node's output.
    /// `failing_input` is the table that flowed into the failing node.
    pub fn fallback(&self, failing_input: Option<&Table>) -> Result<Table, String> {
        match self.fallback_strategy.as_str() {
            "return_empty" => Ok(Table::new()),
            "return_input" => Ok(failing_input.cloned().unwrap_or_default()),
            "custom" => Ok(Table::from_json_records(&self.custom_fallback_data)),
            other => Err(format!("unknown fallback strategy '{other}'")),
        }
    }
}

/// Identity under success. The executor consults [`TryCatchConfig`] when a
/// node in this guard's protection scope fails.
pub struct TryCatchNode {
    id: String,
}

impl TryCatchNode {
    pub fn new(id: String) -> Self {
        Self { id }
    }
}

#[async_trait]
impl FlowNode for TryCatchNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "try_catch"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        Ok(FlowValue::Table(table.clone()))
    }
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    #[serde(default = "default_first_available")]
    pub merge_strategy: String,
    #[serde(default = "default_first")]
    pub custom_logic: String,
    /// Per-input repeat counts for `custom_logic: weighted_concat`.
    #[serde(default)]
    pub weights: Vec<f64>,
}

fn default_first_available() -> String {
    "first_available".to_string()
}

fn default_first() -> String {
    "first".to_string()
}

/// Reduce whichever inputs produced a value; suppressed branches simply do
/// not show up here.
pub struct MergeNode {
    id: String,
    config: MergeConfig,
}

impl MergeNode {
    pub fn new(id: String, config: MergeConfig) -> Self {
        Self { id, config }
    }

    fn concat(tables: &[&Table]) -> Table {
        let mut names: Vec<String> = Vec::new();
        for table in tables {
            for name in table.column_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        let mut rows = Vec::new();
        for table in tables {
            for row in 0..table.row_count() {
                rows.push(
                    names
                        .iter()
                        .map(|name| table.cell(row, name).cloned().unwrap_or(CellValue::Null))
                        .collect(),
                );
            }
        }
        Table::from_rows(&names, rows).unwrap_or_default()
    }
}

#[async_trait]
impl FlowNode for MergeNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "merge"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let tables = inputs.tables();
        if tables.is_empty() {
            tracing::warn!(node_id = %self.id, "merge received no table inputs");
            return Ok(FlowValue::Table(Table::new()));
        }

        let result = match self.config.merge_strategy.as_str() {
            "first_available" => tables[0].clone(),
            "concat" => Self::concat(&tables),
            "union" => {
                let combined = Self::concat(&tables);
                let mut seen = std::collections::HashSet::new();
                let names = combined.column_names();
                let keep: Vec<usize> = (0..combined.row_count())
                    .filter(|&row| {
                        let key: String = names
                            .iter()
                            .map(|name| {
                                combined
                                    .cell(row, name)
                                    .map(CellValue::group_key)
                                    .unwrap_or_default()
                                    + "\u{1f}"
                            })
                            .collect();
                        seen.insert(key)
                    })
                    .collect();
                combined.take_rows(&keep)
            }
            "custom" => match self.config.custom_logic.as_str() {
                "first" => tables[0].clone(),
                "largest" => tables
                    .iter()
                    .max_by_key(|t| t.row_count())
                    .copied()
                    .cloned()
                    .unwrap_or_default(),
                "smallest" => tables
                    .iter()
                    .min_by_key(|t| t.row_count())
                    .copied()
                    .cloned()
                    .unwrap_or_default(),
                "average" => {
                    // The input whose row count is closest to the mean row
                    // count; ties go to the earlier input.
                    let mean =
                        tables.iter().map(|t| t.row_count()).sum::<usize>() as f64
                            / tables.len() as f64;
                    tables
                        .iter()
                        .min_by(|a, b| {
                            let da = (a.row_count() as f64 - mean).abs();
                            let db = (b.row_count() as f64 - mean).abs();
                            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .copied()
                        .cloned()
                        .unwrap_or_default()
                }
                "weighted_concat" => {
                    if self.config.weights.len() == tables.len() {
                        let mut weighted: Vec<&Table> = Vec::new();
                        for (&table, &weight) in tables.iter().zip(&self.config.weights) {
                            for _ in 0..weight as usize {
                                weighted.push(table);
                            }
                        }
                        Self::concat(&weighted)
                    } else {
                        tracing::warn!(
                            node_id = %self.id,
                            weights = self.config.weights.len(),
                            inputs = tables.len(),
                            "weights length mismatch, falling back to simple concat"
                        );
                        Self::concat(&tables)
                    }
                }
                other => {
                    return Err(NodeError::new(
                        &self.id,
                        NodeErrorKind::Config,
                        format!("unknown custom merge logic '{other}'"),
                    ))
                }
            },
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown merge strategy '{other}'"),
                ))
            }
        };
        tracing::info!(node_id = %self.id, inputs = tables.len(), strategy = %self.config.merge_strategy, "merged inputs");
        Ok(FlowValue::Table(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{test_services, ExecutionContext, UserContext};
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "flow",
            "exec_test",
            UserContext::anonymous(),
            Map::new(),
            test_services(),
        )
    }

    fn rows(n: i64) -> Table {
        Table::from_rows(
            &["id".to_string()],
            (0..n).map(|i| vec![CellValue::Integer(i)]).collect(),
        )
        .unwrap()
    }

    fn with_table(table: Table) -> InputMap {
        let mut inputs = InputMap::new();
        inputs.insert("in", FlowValue::Table(table));
        inputs
    }

    async fn verdict(node: &ConditionalBranchNode, table: Table) -> bool {
        match node.invoke(&with_table(table), &ctx()).await.unwrap() {
            FlowValue::Bool(b) => b,
            other => panic!("expected bool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expression_condition_uses_table_scope() {
        let config = json!({
            "condition_type": "expression",
            "condition_value": "row_count > 10"
        });
        let node =
            ConditionalBranchNode::from_spec("c".into(), config.as_object().unwrap()).unwrap();
        assert!(!verdict(&node, rows(3)).await);
        assert!(verdict(&node, rows(11)).await);
    }

    #[tokio::test]
    async fn row_count_condition_operators() {
        let config = json!({
            "condition_type": "row_count",
            "condition_value": {"operator": "lte", "threshold": 2}
        });
        let node =
            ConditionalBranchNode::from_spec("c".into(), config.as_object().unwrap()).unwrap();
        assert!(verdict(&node, rows(2)).await);
        assert!(!verdict(&node, rows(3)).await);
    }

    #[tokio::test]
    async fn column_exists_condition() {
        let config = json!({
            "condition_type": "column_exists",
            "condition_value": ["id"]
        });
        let node =
            ConditionalBranchNode::from_spec("c".into(), config.as_object().unwrap()).unwrap();
        assert!(verdict(&node, rows(1)).await);

        let config = json!({
            "condition_type": "column_exists",
            "condition_value": "ghost"
        });
        let node =
            ConditionalBranchNode::from_spec("c".into(), config.as_object().unwrap()).unwrap();
        assert!(!verdict(&node, rows(1)).await);
    }

    #[tokio::test]
    async fn data_quality_completeness() {
        let table = Table::from_rows(
            &["a".to_string()],
            vec![
                vec![CellValue::Integer(1)],
                vec![CellValue::Null],
            ],
        )
        .unwrap();
        let config = json!({
            "condition_type": "data_quality",
            "condition_value": {"check": "completeness", "threshold": 0.6}
        });
        let node =
            ConditionalBranchNode::from_spec("c".into(), config.as_object().unwrap()).unwrap();
        assert!(!verdict(&node, table).await);
        assert!(verdict(&node, rows(4)).await);
    }

    #[test]
    fn try_catch_fallbacks() {
        let empty: TryCatchConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.fallback(None).unwrap().row_count(), 0);

        let return_input: TryCatchConfig =
            serde_json::from_value(json!({"fallback_strategy": "return_input"})).unwrap();
        let input = rows(2);
        assert_eq!(return_input.fallback(Some(&input)).unwrap(), input);

        let custom: TryCatchConfig = serde_json::from_value(json!({
            "fallback_strategy": "custom",
            "custom_fallback_data": [{"status": "fallback"}]
        }))
        .unwrap();
        let table = custom.fallback(None).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(
            table.cell(0, "status"),
            Some(&CellValue::String("fallback".into()))
        );
    }

    #[tokio::test]
    async fn merge_strategies() {
        let mut inputs = InputMap::new();
        inputs.insert("a", FlowValue::Table(rows(2)));
        inputs.insert("b", FlowValue::Table(rows(3)));

        let first = MergeNode::new(
            "m".into(),
            serde_json::from_value(json!({"merge_strategy": "first_available"})).unwrap(),
        );
        let value = first.invoke(&inputs, &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 2);

        let concat = MergeNode::new(
            "m".into(),
            serde_json::from_value(json!({"merge_strategy": "concat"})).unwrap(),
        );
        let value = concat.invoke(&inputs, &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 5);

        let union = MergeNode::new(
            "m".into(),
            serde_json::from_value(json!({"merge_strategy": "union"})).unwrap(),
        );
        let value = union.invoke(&inputs, &ctx()).await.unwrap();
        // Rows 0 and 1 repeat across the two inputs.
        assert_eq!(value.as_table().unwrap().row_count(), 3);

        let largest = MergeNode::new(
            "m".into(),
            serde_json::from_value(
                json!({"merge_strategy": "custom", "custom_logic": "largest"}),
            )
            .unwrap(),
        );
        let value = largest.invoke(&inputs, &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 3);

        let none = MergeNode::new(
            "m".into(),
            serde_json::from_value(json!({})).unwrap(),
        );
        let value = none.invoke(&InputMap::new(), &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 0);
    }

    #[tokio::test]
    async fn merge_custom_average_picks_the_input_nearest_the_mean() {
        let mut inputs = InputMap::new();
        inputs.insert("a", FlowValue::Table(rows(1)));
        inputs.insert("b", FlowValue::Table(rows(4)));
        inputs.insert("c", FlowValue::Table(rows(10)));

        // Mean row count is 5; the 4-row input is closest.
        let average = MergeNode::new(
            "m".into(),
            serde_json::from_value(
                json!({"merge_strategy": "custom", "custom_logic": "average"}),
            )
            .unwrap(),
        );
        let value = average.invoke(&inputs, &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 4);
    }

    #[tokio::test]
    async fn merge_custom_weighted_concat_repeats_inputs() {
        let mut inputs = InputMap::new();
        inputs.insert("a", FlowValue::Table(rows(2)));
        inputs.insert("b", FlowValue::Table(rows(3)));

        let weighted = MergeNode::new(
            "m".into(),
            serde_json::from_value(json!({
                "merge_strategy": "custom",
                "custom_logic": "weighted_concat",
                "weights": [2, 1]
            }))
            .unwrap(),
        );
        let value = weighted.invoke(&inputs, &ctx()).await.unwrap();
        // Two copies of the 2-row input plus one copy of the 3-row input.
        assert_eq!(value.as_table().unwrap().row_count(), 7);

        // A weights/inputs length mismatch degrades to a plain concat.
        let mismatched = MergeNode::new(
            "m".into(),
            serde_json::from_value(json!({
                "merge_strategy": "custom",
                "custom_logic": "weighted_concat",
                "weights": [2]
            }))
            .unwrap(),
        );
        let value = mismatched.invoke(&inputs, &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 5);
    }

    #[tokio::test]
    async fn merge_rejects_unknown_custom_logic() {
        let mut inputs = InputMap::new();
        inputs.insert("a", FlowValue::Table(rows(1)));

        let bogus = MergeNode::new(
            "m".into(),
            serde_json::from_value(
                json!({"merge_strategy": "custom", "custom_logic": "telepathy"}),
            )
            .unwrap(),
        );
        let err = bogus.invoke(&inputs, &ctx()).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::Config);
    }
}
