// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Column-level transform nodes over a single input table.
//!
//! All transforms return a new table; untouched columns keep sharing their
//! storage with the input.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{FlowNode, FlowValue, InputMap};
use crate::engine::context::ExecutionContext;
use crate::errors::{NodeError, NodeErrorKind, ValidationError};
use crate::expr::{eval, parse_expression, Expr, Scope};
use crate::table::{CellValue, Column, DataType, Table};

fn expr_err(node_id: &str, message: String) -> NodeError {
    NodeError::new(node_id, NodeErrorKind::Expression, message)
}

/// Parse an expression at construction time, attributing failures to the
/// owning node.
pub(crate) fn parse_node_expression(
    node_id: &str,
    source: &str,
) -> Result<Expr, ValidationError> {
    parse_expression(source).map_err(|reason| ValidationError::InvalidNodeConfig {
        node_id: node_id.to_string(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// select_columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SelectColumnsConfig {
    #[serde(default = "default_select")]
    pub operation: String,
    pub columns: Vec<String>,
}

fn default_select() -> String {
    "select".to_string()
}

/// Keep or drop a set of columns. Missing columns fail a `select` and are
/// silently ignored by a `drop`.
pub struct SelectColumnsNode {
    id: String,
    config: SelectColumnsConfig,
}

impl SelectColumnsNode {
    pub fn new(id: String, config: SelectColumnsConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for SelectColumnsNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "select_columns"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let result = match self.config.operation.as_str() {
            "select" => table
                .select(&self.config.columns)
                .map_err(|e| NodeError::new(&self.id, NodeErrorKind::MissingColumn, e))?,
            "drop" => table.drop_columns(&self.config.columns),
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown operation '{other}'"),
                ))
            }
        };
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// filter_rows
// ---------------------------------------------------------------------------

/// Keep the rows where a boolean expression over column references holds.
pub struct FilterRowsNode {
    id: String,
    expression: Expr,
}

impl FilterRowsNode {
    pub fn from_spec(id: String, config: &Map<String, Value>) -> Result<Self, ValidationError> {
        let source = config
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::InvalidNodeConfig {
                node_id: id.clone(),
                reason: "missing 'expression'".to_string(),
            })?;
        let expression = parse_node_expression(&id, source)?;
        Ok(Self { id, expression })
    }
}

#[async_trait]
impl FlowNode for FilterRowsNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "filter_rows"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let mut keep = Vec::new();
        for row in 0..table.row_count() {
            let verdict = eval(&self.expression, Scope::Row { table, row })
                .map_err(|e| expr_err(&self.id, e))?;
            if verdict.truthy() {
                keep.push(row);
            }
        }
        Ok(FlowValue::Table(table.take_rows(&keep)))
    }
}

// ---------------------------------------------------------------------------
// sample_rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SampleRowsConfig {
    #[serde(default = "default_head")]
    pub method: String,
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_head() -> String {
    "head".to_string()
}

fn default_n() -> usize {
    10
}

/// Take the first, last or a random `n` rows.
pub struct SampleRowsNode {
    id: String,
    config: SampleRowsConfig,
}

impl SampleRowsNode {
    pub fn new(id: String, config: SampleRowsConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for SampleRowsNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "sample_rows"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let total = table.row_count();
        let n = self.config.n.min(total);
        let rows: Vec<usize> = match self.config.method.as_str() {
            "head" => (0..n).collect(),
            "tail" => (total - n..total).collect(),
            "random" => {
                let mut rng = match self.config.seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                let mut all: Vec<usize> = (0..total).collect();
                all.shuffle(&mut rng);
                let mut sampled: Vec<usize> = all.into_iter().take(n).collect();
                sampled.sort_unstable();
                sampled
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown sampling method '{other}'"),
                ))
            }
        };
        Ok(FlowValue::Table(table.take_rows(&rows)))
    }
}

// ---------------------------------------------------------------------------
// rename_columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RenameColumnsConfig {
    pub renames: Map<String, Value>,
}

/// Rename columns by mapping; unknown columns are ignored and the count of
/// applied renames is logged.
pub struct RenameColumnsNode {
    id: String,
    config: RenameColumnsConfig,
}

impl RenameColumnsNode {
    pub fn new(id: String, config: RenameColumnsConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for RenameColumnsNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "rename_columns"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let mut applied = 0usize;
        let columns = table
            .columns()
            .iter()
            .map(|column| {
                match self
                    .config
                    .renames
                    .get(column.name())
                    .and_then(Value::as_str)
                {
                    Some(new_name) => {
                        applied += 1;
                        column.renamed(new_name)
                    }
                    None => column.clone(),
                }
            })
            .collect();
        tracing::info!(node_id = %self.id, applied, "renamed columns");
        let result = Table::from_columns(columns)
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))?;
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// change_data_type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeDataTypeConfig {
    pub conversions: Map<String, Value>,
}

/// Cast columns to new types; unknown columns are ignored and the count of
/// applied conversions is logged. A cell that cannot be cast fails the node.
pub struct ChangeDataTypeNode {
    id: String,
    config: ChangeDataTypeConfig,
}

impl ChangeDataTypeNode {
    pub fn new(id: String, config: ChangeDataTypeConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for ChangeDataTypeNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "change_data_type"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let mut result = table.clone();
        let mut applied = 0usize;
        for (name, type_name) in &self.config.conversions {
            let Some(column) = table.column(name) else {
                continue;
            };
            let type_name = type_name.as_str().unwrap_or_default();
            let dtype = DataType::parse(type_name).ok_or_else(|| {
                NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown data type '{type_name}'"),
                )
            })?;
            let mut values = Vec::with_capacity(column.len());
            for cell in column.values() {
                values.push(cell.cast(dtype).map_err(|e| {
                    NodeError::new(
                        &self.id,
                        NodeErrorKind::TypeCast,
                        format!("column '{name}': {e}"),
                    )
                })?);
            }
            result = result.with_column(Column::new(name.clone(), dtype, values));
            applied += 1;
        }
        tracing::info!(node_id = %self.id, applied, "converted column types");
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// add_modify_column
// ---------------------------------------------------------------------------

/// How one column definition produces its cells.
enum ColumnSpec {
    Literal(CellValue),
    CopyFrom(String),
    Expression(Expr),
}

/// Add or overwrite columns from literals, copies or row expressions.
/// Definitions are independent: each one is evaluated against the input
/// table, not against the output of other definitions.
pub struct AddModifyColumnNode {
    id: String,
    definitions: Vec<(String, ColumnSpec)>,
}

impl AddModifyColumnNode {
    pub fn from_spec(id: String, config: &Map<String, Value>) -> Result<Self, ValidationError> {
        let raw = config
            .get("definitions")
            .and_then(Value::as_object)
            .ok_or_else(|| ValidationError::InvalidNodeConfig {
                node_id: id.clone(),
                reason: "missing 'definitions' map".to_string(),
            })?;

        let mut definitions = Vec::with_capacity(raw.len());
        for (name, spec) in raw {
            let parsed = match spec {
                Value::Object(fields) => {
                    if let Some(source) = fields.get("expression").and_then(Value::as_str) {
                        ColumnSpec::Expression(parse_node_expression(&id, source)?)
                    } else if let Some(from) = fields.get("copy_from").and_then(Value::as_str) {
                        ColumnSpec::CopyFrom(from.to_string())
                    } else if let Some(literal) = fields.get("literal") {
                        ColumnSpec::Literal(CellValue::from_json(literal))
                    } else {
                        return Err(ValidationError::InvalidNodeConfig {
                            node_id: id.clone(),
                            reason: format!(
                                "definition for '{name}' needs 'expression', 'copy_from' or 'literal'"
                            ),
                        });
                    }
                }
                scalar => ColumnSpec::Literal(CellValue::from_json(scalar)),
            };
            definitions.push((name.clone(), parsed));
        }
        Ok(Self { id, definitions })
    }
}

#[async_trait]
impl FlowNode for AddModifyColumnNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "add_modify_column"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let mut result = table.clone();
        for (name, spec) in &self.definitions {
            let values: Vec<CellValue> = match spec {
                ColumnSpec::Literal(value) => vec![value.clone(); table.row_count()],
                ColumnSpec::CopyFrom(source) => {
                    let column = table.column(source).ok_or_else(|| {
                        NodeError::new(
                            &self.id,
                            NodeErrorKind::MissingColumn,
                            format!("copy source '{source}' not found"),
                        )
                    })?;
                    column.values().to_vec()
                }
                ColumnSpec::Expression(expr) => {
                    let mut values = Vec::with_capacity(table.row_count());
                    for row in 0..table.row_count() {
                        values.push(
                            eval(expr, Scope::Row { table, row })
                                .map_err(|e| expr_err(&self.id, e))?,
                        );
                    }
                    values
                }
            };
            result = result.with_column(Column::inferred(name.clone(), values));
        }
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// split_column
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SplitColumnConfig {
    pub column: String,
    pub delimiter: String,
    #[serde(default)]
    pub expand: bool,
    #[serde(default)]
    pub new_column_names: Option<Vec<String>>,
}

/// Split a string column on a delimiter. With `expand`, each part becomes
/// its own column; without it, the parts are kept as one JSON-array string
/// in `<column>_parts`.
pub struct SplitColumnNode {
    id: String,
    config: SplitColumnConfig,
}

impl SplitColumnNode {
    pub fn new(id: String, config: SplitColumnConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for SplitColumnNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "split_column"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let column = table.column(&self.config.column).ok_or_else(|| {
            NodeError::new(
                &self.id,
                NodeErrorKind::MissingColumn,
                format!("column '{}' not found", self.config.column),
            )
        })?;

        let parts_per_row: Vec<Option<Vec<String>>> = column
            .values()
            .iter()
            .map(|cell| {
                if cell.is_null() {
                    None
                } else {
                    Some(
                        cell.render()
                            .split(&self.config.delimiter)
                            .map(str::to_string)
                            .collect(),
                    )
                }
            })
            .collect();

        let result = if self.config.expand {
            let width = parts_per_row
                .iter()
                .flatten()
                .map(Vec::len)
                .max()
                .unwrap_or(0);
            let mut result = table.clone();
            for i in 0..width {
                let name = self
                    .config
                    .new_column_names
                    .as_ref()
                    .and_then(|names| names.get(i).cloned())
                    .unwrap_or_else(|| format!("{}_{i}", self.config.column));
                let values: Vec<CellValue> = parts_per_row
                    .iter()
                    .map(|parts| match parts.as_ref().and_then(|p| p.get(i)) {
                        Some(part) => CellValue::String(part.clone()),
                        None => CellValue::Null,
                    })
                    .collect();
                result = result.with_column(Column::new(name, DataType::String, values));
            }
            result
        } else {
            let values: Vec<CellValue> = parts_per_row
                .iter()
                .map(|parts| match parts {
                    Some(parts) => CellValue::String(
                        serde_json::to_string(parts).unwrap_or_default(),
                    ),
                    None => CellValue::Null,
                })
                .collect();
            table.with_column(Column::new(
                format!("{}_parts", self.config.column),
                DataType::String,
                values,
            ))
        };

        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// map_values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MapValuesConfig {
    pub column: String,
    pub mapping: Map<String, Value>,
    #[serde(default)]
    pub create_new_column: bool,
    #[serde(default)]
    pub new_column_name: Option<String>,
}

/// Replace values in a column through a mapping; unmapped values pass
/// through unchanged. Optionally write into a new column instead.
pub struct MapValuesNode {
    id: String,
    config: MapValuesConfig,
}

impl MapValuesNode {
    pub fn new(id: String, config: MapValuesConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for MapValuesNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "map_values"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let column = table.column(&self.config.column).ok_or_else(|| {
            NodeError::new(
                &self.id,
                NodeErrorKind::MissingColumn,
                format!("column '{}' not found", self.config.column),
            )
        })?;

        let values: Vec<CellValue> = column
            .values()
            .iter()
            .map(|cell| match self.config.mapping.get(&cell.render()) {
                Some(mapped) => CellValue::from_json(mapped),
                None => cell.clone(),
            })
            .collect();

        let target = if self.config.create_new_column {
            self.config
                .new_column_name
                .clone()
                .unwrap_or_else(|| format!("{}_mapped", self.config.column))
        } else {
            self.config.column.clone()
        };

        Ok(FlowValue::Table(
            table.with_column(Column::inferred(target, values)),
        ))
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

    fn people() -> Table {
        Table::from_rows(
            &["id".to_string(), "name".to_string(), "age".to_string()],
            vec![
                vec![
                    CellValue::Integer(1),
                    CellValue::String("ana lima".into()),
                    CellValue::Integer(31),
                ],
                vec![
                    CellValue::Integer(2),
                    CellValue::String("bo chen".into()),
                    CellValue::Integer(18),
                ],
                vec![
                    CellValue::Integer(3),
                    CellValue::String("cy dee".into()),
                    CellValue::Integer(47),
                ],
            ],
        )
        .unwrap()
    }

    fn table_input(table: Table) -> InputMap {
        let mut inputs = InputMap::new();
        inputs.insert("in", FlowValue::Table(table));
        inputs
    }

    async fn run(node: &dyn FlowNode, table: Table) -> Result<Table, NodeError> {
        let value = node.invoke(&table_input(table), &ctx()).await?;
        Ok(value.as_table().unwrap().clone())
    }

    #[tokio::test]
    async fn select_missing_column_fails_but_drop_ignores() {
        let select = SelectColumnsNode::new(
            "s".into(),
            serde_json::from_value(json!({"operation": "select", "columns": ["ghost"]})).unwrap(),
        );
        let err = run(&select, people()).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::MissingColumn);

        let drop = SelectColumnsNode::new(
            "d".into(),
            serde_json::from_value(json!({"operation": "drop", "columns": ["ghost", "age"]}))
                .unwrap(),
        );
        let result = run(&drop, people()).await.unwrap();
        assert_eq!(result.column_names(), vec!["id", "name"]);
    }

    #[tokio::test]
    async fn filter_rows_keeps_matching_rows() {
        let config: Map<String, Value> =
            json!({"expression": "age >= 30"}).as_object().unwrap().clone();
        let node = FilterRowsNode::from_spec("f".into(), &config).unwrap();
        let result = run(&node, people()).await.unwrap();
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.cell(1, "id"), Some(&CellValue::Integer(3)));
    }

    #[test]
    fn filter_rows_rejects_invalid_expression_at_construction() {
        let config: Map<String, Value> =
            json!({"expression": "age >="}).as_object().unwrap().clone();
        assert!(matches!(
            FilterRowsNode::from_spec("f".into(), &config),
            Err(ValidationError::InvalidNodeConfig { .. })
        ));
    }

    #[tokio::test]
    async fn sample_rows_head_tail_and_seeded_random() {
        let head = SampleRowsNode::new(
            "h".into(),
            serde_json::from_value(json!({"method": "head", "n": 2})).unwrap(),
        );
        assert_eq!(run(&head, people()).await.unwrap().row_count(), 2);

        let tail = SampleRowsNode::new(
            "t".into(),
            serde_json::from_value(json!({"method": "tail", "n": 1})).unwrap(),
        );
        let result = run(&tail, people()).await.unwrap();
        assert_eq!(result.cell(0, "id"), Some(&CellValue::Integer(3)));

        let random = SampleRowsNode::new(
            "r".into(),
            serde_json::from_value(json!({"method": "random", "n": 2, "seed": 7})).unwrap(),
        );
        let first = run(&random, people()).await.unwrap();
        let second = run(&random, people()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.row_count(), 2);
    }

    #[tokio::test]
    async fn rename_ignores_missing_columns() {
        let node = RenameColumnsNode::new(
            "r".into(),
            serde_json::from_value(json!({"renames": {"name": "full_name", "ghost": "x"}}))
                .unwrap(),
        );
        let result = run(&node, people()).await.unwrap();
        assert_eq!(result.column_names(), vec!["id", "full_name", "age"]);
    }

    #[tokio::test]
    async fn change_data_type_casts_and_reports_bad_cells() {
        let node = ChangeDataTypeNode::new(
            "c".into(),
            serde_json::from_value(json!({"conversions": {"age": "string", "ghost": "int"}}))
                .unwrap(),
        );
        let result = run(&node, people()).await.unwrap();
        assert_eq!(result.cell(0, "age"), Some(&CellValue::String("31".into())));

        let bad = ChangeDataTypeNode::new(
            "c".into(),
            serde_json::from_value(json!({"conversions": {"name": "integer"}})).unwrap(),
        );
        let err = run(&bad, people()).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::TypeCast);
    }

    #[tokio::test]
    async fn add_modify_supports_literal_copy_and_expression() {
        let config: Map<String, Value> = json!({
            "definitions": {
                "flag": true,
                "age_copy": {"copy_from": "age"},
                "next_year": {"expression": "age + 1"}
            }
        })
        .as_object()
        .unwrap()
        .clone();
        let node = AddModifyColumnNode::from_spec("a".into(), &config).unwrap();
        let result = run(&node, people()).await.unwrap();
        assert_eq!(result.cell(0, "flag"), Some(&CellValue::Boolean(true)));
        assert_eq!(result.cell(1, "age_copy"), Some(&CellValue::Integer(18)));
        assert_eq!(result.cell(2, "next_year"), Some(&CellValue::Integer(48)));
    }

    #[tokio::test]
    async fn split_column_expand_creates_named_columns() {
        let node = SplitColumnNode::new(
            "s".into(),
            serde_json::from_value(json!({
                "column": "name",
                "delimiter": " ",
                "expand": true,
                "new_column_names": ["first", "last"]
            }))
            .unwrap(),
        );
        let result = run(&node, people()).await.unwrap();
        assert_eq!(result.cell(0, "first"), Some(&CellValue::String("ana".into())));
        assert_eq!(result.cell(2, "last"), Some(&CellValue::String("dee".into())));
    }

    #[tokio::test]
    async fn map_values_replaces_and_passes_unmapped_through() {
        let node = MapValuesNode::new(
            "m".into(),
            serde_json::from_value(json!({
                "column": "id",
                "mapping": {"1": "one"},
                "create_new_column": true,
                "new_column_name": "id_label"
            }))
            .unwrap(),
        );
        let result = run(&node, people()).await.unwrap();
        assert_eq!(
            result.cell(0, "id_label"),
            Some(&CellValue::String("one".into()))
        );
        assert_eq!(result.cell(1, "id_label"), Some(&CellValue::Integer(2)));
        // The original column is untouched when writing to a new one.
        assert_eq!(result.cell(0, "id"), Some(&CellValue::Integer(1)));
    }
}
