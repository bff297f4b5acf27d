// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Reshaping nodes: missing-value handling, deduplication, sorting,
//! pivot/melt, grouped aggregation, window functions, joins, concatenation,
//! function application and the script sandbox.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::transforms::parse_node_expression;
use super::{FlowNode, FlowValue, InputMap};
use crate::engine::context::ExecutionContext;
use crate::errors::{NodeError, NodeErrorKind, ValidationError};
use crate::expr::{eval, script, Expr, Scope};
use crate::table::{CellValue, Column, Table};

/// Aggregate a set of cells with one of the fixed aggregation functions.
fn aggregate(function: &str, cells: &[&CellValue]) -> Result<CellValue, String> {
    let non_null: Vec<&CellValue> = cells.iter().copied().filter(|c| !c.is_null()).collect();
    match function {
        "count" => Ok(CellValue::Integer(non_null.len() as i64)),
        "first" => Ok(non_null.first().map(|c| (*c).clone()).unwrap_or(CellValue::Null)),
        "last" => Ok(non_null.last().map(|c| (*c).clone()).unwrap_or(CellValue::Null)),
        "min" | "max" => {
            let mut best: Option<&CellValue> = None;
            for cell in &non_null {
                best = Some(match best {
                    None => cell,
                    Some(current) => {
                        let replace = if function == "min" {
                            cell.compare(current).is_lt()
                        } else {
                            cell.compare(current).is_gt()
                        };
                        if replace {
                            cell
                        } else {
                            current
                        }
                    }
                });
            }
            Ok(best.cloned().unwrap_or(CellValue::Null))
        }
        "sum" | "mean" => {
            let mut total = 0.0;
            let mut all_integers = true;
            for cell in &non_null {
                match cell {
                    CellValue::Integer(_) => {}
                    _ => all_integers = false,
                }
                total += cell
                    .as_f64()
                    .ok_or_else(|| format!("{function} over non-numeric value"))?;
            }
            if function == "mean" {
                if non_null.is_empty() {
                    return Ok(CellValue::Null);
                }
                Ok(CellValue::Float(total / non_null.len() as f64))
            } else if all_integers {
                Ok(CellValue::Integer(total as i64))
            } else {
                Ok(CellValue::Float(total))
            }
        }
        other => Err(format!("unknown aggregation function '{other}'")),
    }
}

/// Row key over a set of columns, used for grouping and joining.
fn row_key(table: &Table, columns: &[String], row: usize) -> String {
    let mut key = String::new();
    for name in columns {
        if let Some(cell) = table.cell(row, name) {
            key.push_str(&cell.group_key());
        }
        key.push('\u{1f}');
    }
    key
}

fn require_columns(node_id: &str, table: &Table, columns: &[String]) -> Result<(), NodeError> {
    for name in columns {
        if !table.has_column(name) {
            return Err(NodeError::new(
                node_id,
                NodeErrorKind::MissingColumn,
                format!("column '{name}' not found"),
            ));
        }
    }
    Ok(())
}

/// Accept a string or an array of strings.
fn name_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// handle_missing_values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HandleMissingConfig {
    pub method: String,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub fill_value: Option<Value>,
}

/// Drop or fill null cells.
pub struct HandleMissingValuesNode {
    id: String,
    config: HandleMissingConfig,
}

impl HandleMissingValuesNode {
    pub fn new(id: String, config: HandleMissingConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for HandleMissingValuesNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "handle_missing_values"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let targets = match &self.config.columns {
            Some(columns) => {
                require_columns(&self.id, table, columns)?;
                columns.clone()
            }
            None => table.column_names(),
        };

        let result = match self.config.method.as_str() {
            "drop" => {
                let keep: Vec<usize> = (0..table.row_count())
                    .filter(|&row| {
                        targets.iter().all(|name| {
                            table.cell(row, name).map(|c| !c.is_null()).unwrap_or(false)
                        })
                    })
                    .collect();
                table.take_rows(&keep)
            }
            "fill" => {
                let fill = self
                    .config
                    .fill_value
                    .as_ref()
                    .map(CellValue::from_json)
                    .ok_or_else(|| {
                        NodeError::new(
                            &self.id,
                            NodeErrorKind::Config,
                            "fill method requires fill_value",
                        )
                    })?;
                let mut result = table.clone();
                for name in &targets {
                    let column = table.column(name).expect("validated above");
                    if column.values().iter().any(CellValue::is_null) {
                        let values: Vec<CellValue> = column
                            .values()
                            .iter()
                            .map(|c| if c.is_null() { fill.clone() } else { c.clone() })
                            .collect();
                        result = result.with_column(Column::inferred(name.clone(), values));
                    }
                }
                result
            }
            "forward_fill" | "backward_fill" => {
                let mut result = table.clone();
                for name in &targets {
                    let column = table.column(name).expect("validated above");
                    let mut values: Vec<CellValue> = column.values().to_vec();
                    if self.config.method == "forward_fill" {
                        let mut carry: Option<CellValue> = None;
                        for cell in values.iter_mut() {
                            if cell.is_null() {
                                if let Some(previous) = &carry {
                                    *cell = previous.clone();
                                }
                            } else {
                                carry = Some(cell.clone());
                            }
                        }
                    } else {
                        let mut carry: Option<CellValue> = None;
                        for cell in values.iter_mut().rev() {
                            if cell.is_null() {
                                if let Some(next) = &carry {
                                    *cell = next.clone();
                                }
                            } else {
                                carry = Some(cell.clone());
                            }
                        }
                    }
                    result = result.with_column(Column::new(name.clone(), column.dtype(), values));
                }
                result
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown method '{other}'"),
                ))
            }
        };
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// deduplicate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DeduplicateConfig {
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default = "default_keep")]
    pub keep: String,
}

fn default_keep() -> String {
    "first".to_string()
}

/// Remove duplicate rows over a column subset.
pub struct DeduplicateNode {
    id: String,
    config: DeduplicateConfig,
}

impl DeduplicateNode {
    pub fn new(id: String, config: DeduplicateConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for DeduplicateNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "deduplicate"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let subset = match &self.config.columns {
            Some(columns) => {
                require_columns(&self.id, table, columns)?;
                columns.clone()
            }
            None => table.column_names(),
        };

        let keys: Vec<String> = (0..table.row_count())
            .map(|row| row_key(table, &subset, row))
            .collect();

        let keep: Vec<usize> = match self.config.keep.as_str() {
            "first" => {
                let mut seen = HashSet::new();
                (0..table.row_count())
                    .filter(|&row| seen.insert(keys[row].clone()))
                    .collect()
            }
            "last" => {
                let mut last_of: HashMap<&str, usize> = HashMap::new();
                for (row, key) in keys.iter().enumerate() {
                    last_of.insert(key, row);
                }
                let mut rows: Vec<usize> = last_of.into_values().collect();
                rows.sort_unstable();
                rows
            }
            "none" => {
                let mut counts: HashMap<&str, usize> = HashMap::new();
                for key in &keys {
                    *counts.entry(key).or_default() += 1;
                }
                (0..table.row_count())
                    .filter(|&row| counts[keys[row].as_str()] == 1)
                    .collect()
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown keep policy '{other}'"),
                ))
            }
        };
        Ok(FlowValue::Table(table.take_rows(&keep)))
    }
}

// ---------------------------------------------------------------------------
// sort_data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SortDataConfig {
    pub sort_by: Vec<String>,
    #[serde(default)]
    pub ascending: Vec<bool>,
}

/// Stable multi-key sort; nulls sort last regardless of direction.
pub struct SortDataNode {
    id: String,
    config: SortDataConfig,
}

impl SortDataNode {
    pub fn new(id: String, config: SortDataConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for SortDataNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "sort_data"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        require_columns(&self.id, table, &self.config.sort_by)?;

        let mut rows: Vec<usize> = (0..table.row_count()).collect();
        rows.sort_by(|&a, &b| {
            for (i, name) in self.config.sort_by.iter().enumerate() {
                let ascending = self.config.ascending.get(i).copied().unwrap_or(true);
                let left = table.cell(a, name).unwrap_or(&CellValue::Null);
                let right = table.cell(b, name).unwrap_or(&CellValue::Null);
                // Nulls stay last in either direction.
                let ordering = match (left.is_null(), right.is_null()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => std::cmp::Ordering::Greater,
                    (false, true) => std::cmp::Ordering::Less,
                    (false, false) => {
                        let natural = left.compare(right);
                        if ascending {
                            natural
                        } else {
                            natural.reverse()
                        }
                    }
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(FlowValue::Table(table.take_rows(&rows)))
    }
}

// ---------------------------------------------------------------------------
// group_aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GroupAggregateConfig {
    pub group_by: Vec<String>,
    pub aggregations: Map<String, Value>,
}

/// Group rows and aggregate columns. A single-function spec keeps the
/// column name; a list of functions flattens to `col_fn`.
pub struct GroupAggregateNode {
    id: String,
    config: GroupAggregateConfig,
}

impl GroupAggregateNode {
    pub fn new(id: String, config: GroupAggregateConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for GroupAggregateNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "group_aggregate"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        require_columns(&self.id, table, &self.config.group_by)?;

        // (source column, function, output name) in config order.
        let mut plans: Vec<(String, String, String)> = Vec::new();
        for (column, spec) in &self.config.aggregations {
            if !table.has_column(column) {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::MissingColumn,
                    format!("column '{column}' not found"),
                ));
            }
            match spec {
                Value::String(function) => {
                    plans.push((column.clone(), function.clone(), column.clone()))
                }
                Value::Array(functions) => {
                    for function in functions {
                        let Some(function) = function.as_str() else {
                            return Err(NodeError::new(
                                &self.id,
                                NodeErrorKind::Config,
                                format!("bad aggregation spec for '{column}'"),
                            ));
                        };
                        plans.push((
                            column.clone(),
                            function.to_string(),
                            format!("{column}_{function}"),
                        ));
                    }
                }
                _ => {
                    return Err(NodeError::new(
                        &self.id,
                        NodeErrorKind::Config,
                        format!("bad aggregation spec for '{column}'"),
                    ))
                }
            }
        }

        // Group rows, first-seen order.
        let mut group_order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for row in 0..table.row_count() {
            let key = row_key(table, &self.config.group_by, row);
            groups.entry(key.clone()).or_insert_with(|| {
                group_order.push(key.clone());
                Vec::new()
            });
            groups.get_mut(&key).unwrap().push(row);
        }

        let mut names: Vec<String> = self.config.group_by.clone();
        names.extend(plans.iter().map(|(_, _, name)| name.clone()));

        let mut rows: Vec<Vec<CellValue>> = Vec::with_capacity(group_order.len());
        for key in &group_order {
            let members = &groups[key];
            let representative = members[0];
            let mut row: Vec<CellValue> = self
                .config
                .group_by
                .iter()
                .map(|name| {
                    table
                        .cell(representative, name)
                        .cloned()
                        .unwrap_or(CellValue::Null)
                })
                .collect();
            for (column, function, _) in &plans {
                let source = table.column(column).expect("validated above");
                let cells: Vec<&CellValue> = members
                    .iter()
                    .map(|&r| source.get(r).unwrap_or(&CellValue::Null))
                    .collect();
                row.push(aggregate(function, &cells).map_err(|e| {
                    NodeError::new(&self.id, NodeErrorKind::Config, e)
                })?);
            }
            rows.push(row);
        }

        let result = Table::from_rows(&names, rows)
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))?;
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// pivot_table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PivotTableConfig {
    pub values: Value,
    pub index: Value,
    pub columns: String,
    #[serde(default = "default_aggfunc")]
    pub aggfunc: String,
    #[serde(default)]
    pub fill_value: Option<Value>,
    #[serde(default = "default_true")]
    pub reset_index: bool,
}

fn default_aggfunc() -> String {
    "mean".to_string()
}

fn default_true() -> bool {
    true
}

/// Spread one column's values into new columns, aggregating collisions.
pub struct PivotTableNode {
    id: String,
    config: PivotTableConfig,
}

impl PivotTableNode {
    pub fn new(id: String, config: PivotTableConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for PivotTableNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "pivot_table"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let bad_config = |reason: String| NodeError::new(&self.id, NodeErrorKind::Config, reason);

        let value_columns = name_list(&self.config.values)
            .ok_or_else(|| bad_config("'values' must be a column or list of columns".into()))?;
        let index_columns = name_list(&self.config.index)
            .ok_or_else(|| bad_config("'index' must be a column or list of columns".into()))?;
        require_columns(&self.id, table, &value_columns)?;
        require_columns(&self.id, table, &index_columns)?;
        require_columns(&self.id, table, std::slice::from_ref(&self.config.columns))?;

        // Distinct pivot labels and index groups, both in first-seen order.
        let mut labels: Vec<String> = Vec::new();
        let mut group_order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for row in 0..table.row_count() {
            let label = table
                .cell(row, &self.config.columns)
                .cloned()
                .unwrap_or(CellValue::Null)
                .render();
            if !labels.contains(&label) {
                labels.push(label);
            }
            let key = row_key(table, &index_columns, row);
            groups.entry(key.clone()).or_insert_with(|| {
                group_order.push(key.clone());
                Vec::new()
            });
            groups.get_mut(&key).unwrap().push(row);
        }

        let fill = self.config.fill_value.as_ref().map(CellValue::from_json);
        let mut names = index_columns.clone();
        for value_column in &value_columns {
            for label in &labels {
                names.push(if value_columns.len() == 1 {
                    label.clone()
                } else {
                    format!("{value_column}_{label}")
                });
            }
        }

        let mut rows = Vec::with_capacity(group_order.len());
        for key in &group_order {
            let members = &groups[key];
            let representative = members[0];
            let mut row: Vec<CellValue> = index_columns
                .iter()
                .map(|name| {
                    table
                        .cell(representative, name)
                        .cloned()
                        .unwrap_or(CellValue::Null)
                })
                .collect();
            for value_column in &value_columns {
                let source = table.column(value_column).expect("validated above");
                for label in &labels {
                    let cells: Vec<&CellValue> = members
                        .iter()
                        .copied()
                        .filter(|&r| {
                            table
                                .cell(r, &self.config.columns)
                                .map(|c| c.render() == *label)
                                .unwrap_or(false)
                        })
                        .map(|r| source.get(r).unwrap_or(&CellValue::Null))
                        .collect();
                    let cell = if cells.is_empty() {
                        fill.clone().unwrap_or(CellValue::Null)
                    } else {
                        aggregate(&self.config.aggfunc, &cells)
                            .map_err(|e| bad_config(e))?
                    };
                    row.push(cell);
                }
            }
            rows.push(row);
        }

        let result = Table::from_rows(&names, rows).map_err(bad_config)?;
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// melt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MeltConfig {
    #[serde(default)]
    pub id_vars: Vec<String>,
    #[serde(default)]
    pub value_vars: Option<Vec<String>>,
    #[serde(default = "default_var_name")]
    pub var_name: String,
    #[serde(default = "default_value_name")]
    pub value_name: String,
}

fn default_var_name() -> String {
    "variable".to_string()
}

fn default_value_name() -> String {
    "value".to_string()
}

/// Unpivot columns into `(variable, value)` rows, column-major.
pub struct MeltNode {
    id: String,
    config: MeltConfig,
}

impl MeltNode {
    pub fn new(id: String, config: MeltConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for MeltNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "melt"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        require_columns(&self.id, table, &self.config.id_vars)?;
        let value_vars: Vec<String> = match &self.config.value_vars {
            Some(vars) => {
                require_columns(&self.id, table, vars)?;
                vars.clone()
            }
            None => table
                .column_names()
                .into_iter()
                .filter(|name| !self.config.id_vars.contains(name))
                .collect(),
        };

        let mut names = self.config.id_vars.clone();
        names.push(self.config.var_name.clone());
        names.push(self.config.value_name.clone());

        let mut rows = Vec::with_capacity(value_vars.len() * table.row_count());
        for variable in &value_vars {
            let source = table.column(variable).expect("validated above");
            for row in 0..table.row_count() {
                let mut melted: Vec<CellValue> = self
                    .config
                    .id_vars
                    .iter()
                    .map(|name| table.cell(row, name).cloned().unwrap_or(CellValue::Null))
                    .collect();
                melted.push(CellValue::String(variable.clone()));
                melted.push(source.get(row).cloned().unwrap_or(CellValue::Null));
                rows.push(melted);
            }
        }

        let result = Table::from_rows(&names, rows)
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))?;
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// window_functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WindowFunctionsConfig {
    pub window_type: String,
    pub columns: Vec<String>,
    pub functions: Vec<String>,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default)]
    pub group_by: Vec<String>,
}

fn default_window_size() -> usize {
    3
}

/// Rolling, expanding or grouped window aggregates. New columns are named
/// `<col>_<fn>_<window_type>`; rolling windows shorter than `window_size`
/// aggregate over the rows available so far.
pub struct WindowFunctionsNode {
    id: String,
    config: WindowFunctionsConfig,
}

impl WindowFunctionsNode {
    pub fn new(id: String, config: WindowFunctionsConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for WindowFunctionsNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "window_functions"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        require_columns(&self.id, table, &self.config.columns)?;

        let mut result = table.clone();
        match self.config.window_type.as_str() {
            "rolling" | "expanding" => {
                let rolling = self.config.window_type == "rolling";
                for name in &self.config.columns {
                    let source = table.column(name).expect("validated above");
                    for function in &self.config.functions {
                        let mut values = Vec::with_capacity(table.row_count());
                        for row in 0..table.row_count() {
                            let start = if rolling {
                                row.saturating_sub(self.config.window_size.saturating_sub(1))
                            } else {
                                0
                            };
                            let window: Vec<&CellValue> = (start..=row)
                                .map(|r| source.get(r).unwrap_or(&CellValue::Null))
                                .collect();
                            values.push(aggregate(function, &window).map_err(|e| {
                                NodeError::new(&self.id, NodeErrorKind::Config, e)
                            })?);
                        }
                        result = result.with_column(Column::inferred(
                            format!("{name}_{function}_{}", self.config.window_type),
                            values,
                        ));
                    }
                }
            }
            "groupby" => {
                if self.config.group_by.is_empty() {
                    return Err(NodeError::new(
                        &self.id,
                        NodeErrorKind::Config,
                        "groupby windows require group_by",
                    ));
                }
                require_columns(&self.id, table, &self.config.group_by)?;
                let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
                for row in 0..table.row_count() {
                    groups
                        .entry(row_key(table, &self.config.group_by, row))
                        .or_default()
                        .push(row);
                }
                for name in &self.config.columns {
                    let source = table.column(name).expect("validated above");
                    for function in &self.config.functions {
                        let mut values = vec![CellValue::Null; table.row_count()];
                        for members in groups.values() {
                            let cells: Vec<&CellValue> = members
                                .iter()
                                .map(|&r| source.get(r).unwrap_or(&CellValue::Null))
                                .collect();
                            let aggregated = aggregate(function, &cells).map_err(|e| {
                                NodeError::new(&self.id, NodeErrorKind::Config, e)
                            })?;
                            for &row in members {
                                values[row] = aggregated.clone();
                            }
                        }
                        result = result.with_column(Column::inferred(
                            format!("{name}_{function}_groupby"),
                            values,
                        ));
                    }
                }
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown window type '{other}'"),
                ))
            }
        }
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// join_merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct JoinMergeConfig {
    #[serde(default = "default_inner")]
    pub join_type: String,
    #[serde(default)]
    pub on: Option<Value>,
    #[serde(default)]
    pub left_on: Option<Value>,
    #[serde(default)]
    pub right_on: Option<Value>,
}

fn default_inner() -> String {
    "inner".to_string()
}

/// Hash join over two inputs. The first table in input order is the left
/// side. Overlapping non-key columns are suffixed `_x` / `_y`.
pub struct JoinMergeNode {
    id: String,
    config: JoinMergeConfig,
}

impl JoinMergeNode {
    pub fn new(id: String, config: JoinMergeConfig) -> Self {
        Self { id, config }
    }

    fn key_columns(&self) -> Result<(Vec<String>, Vec<String>), String> {
        if let Some(on) = &self.config.on {
            let keys = name_list(on).ok_or("'on' must be a column or list of columns")?;
            return Ok((keys.clone(), keys));
        }
        match (&self.config.left_on, &self.config.right_on) {
            (Some(left), Some(right)) => {
                let left = name_list(left).ok_or("'left_on' must be a column or list")?;
                let right = name_list(right).ok_or("'right_on' must be a column or list")?;
                if left.len() != right.len() {
                    return Err("left_on and right_on must have the same length".to_string());
                }
                Ok((left, right))
            }
            _ => Err("join requires 'on' or both 'left_on' and 'right_on'".to_string()),
        }
    }
}

#[async_trait]
impl FlowNode for JoinMergeNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "join_merge"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let tables = inputs.tables();
        if tables.len() < 2 {
            return Err(NodeError::new(
                &self.id,
                NodeErrorKind::MissingInput,
                format!("join requires two input tables, got {}", tables.len()),
            ));
        }
        let (left, right) = (tables[0], tables[1]);
        let (left_keys, right_keys) = self
            .key_columns()
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))?;
        require_columns(&self.id, left, &left_keys)?;
        require_columns(&self.id, right, &right_keys)?;
        let shared_keys = self.config.on.is_some();

        // Output schema: left columns, then right columns; right key columns
        // collapse into the left ones when joining `on` shared names.
        let left_names = left.column_names();
        let right_names: Vec<String> = right
            .column_names()
            .into_iter()
            .filter(|name| !(shared_keys && right_keys.contains(name)))
            .collect();
        let mut names: Vec<String> = Vec::new();
        for name in &left_names {
            if right_names.contains(name) {
                names.push(format!("{name}_x"));
            } else {
                names.push(name.clone());
            }
        }
        for name in &right_names {
            if left_names.contains(name) {
                names.push(format!("{name}_y"));
            } else {
                names.push(name.clone());
            }
        }

        let mut right_index: HashMap<String, Vec<usize>> = HashMap::new();
        for row in 0..right.row_count() {
            right_index
                .entry(row_key(right, &right_keys, row))
                .or_default()
                .push(row);
        }
        let mut left_index: HashMap<String, Vec<usize>> = HashMap::new();
        for row in 0..left.row_count() {
            left_index
                .entry(row_key(left, &left_keys, row))
                .or_default()
                .push(row);
        }

        let emit = |left_row: Option<usize>, right_row: Option<usize>| -> Vec<CellValue> {
            let mut row = Vec::with_capacity(names.len());
            for name in &left_names {
                row.push(match left_row {
                    Some(r) => left.cell(r, name).cloned().unwrap_or(CellValue::Null),
                    None => CellValue::Null,
                });
            }
            for name in &right_names {
                row.push(match right_row {
                    Some(r) => right.cell(r, name).cloned().unwrap_or(CellValue::Null),
                    None => CellValue::Null,
                });
            }
            row
        };

        let join_type = self.config.join_type.as_str();
        let mut rows: Vec<Vec<CellValue>> = Vec::new();
        match join_type {
            "inner" | "left" | "outer" => {
                for left_row in 0..left.row_count() {
                    let key = row_key(left, &left_keys, left_row);
                    match right_index.get(&key) {
                        Some(matches) => {
                            for &right_row in matches {
                                rows.push(emit(Some(left_row), Some(right_row)));
                            }
                        }
                        None if join_type != "inner" => rows.push(emit(Some(left_row), None)),
                        None => {}
                    }
                }
                if join_type == "outer" {
                    for right_row in 0..right.row_count() {
                        let key = row_key(right, &right_keys, right_row);
                        if !left_index.contains_key(&key) {
                            let mut row = emit(None, Some(right_row));
                            // Shared key columns live on the left side;
                            // carry the right key over so it is not lost.
                            if shared_keys {
                                for (i, key_name) in left_keys.iter().enumerate() {
                                    if let Some(position) =
                                        left_names.iter().position(|n| n == key_name)
                                    {
                                        row[position] = right
                                            .cell(right_row, &right_keys[i])
                                            .cloned()
                                            .unwrap_or(CellValue::Null);
                                    }
                                }
                            }
                            rows.push(row);
                        }
                    }
                }
            }
            "right" => {
                for right_row in 0..right.row_count() {
                    let key = row_key(right, &right_keys, right_row);
                    match left_index.get(&key) {
                        Some(matches) => {
                            for &left_row in matches {
                                rows.push(emit(Some(left_row), Some(right_row)));
                            }
                        }
                        None => {
                            let mut row = emit(None, Some(right_row));
                            if shared_keys {
                                for (i, key_name) in left_keys.iter().enumerate() {
                                    if let Some(position) =
                                        left_names.iter().position(|n| n == key_name)
                                    {
                                        row[position] = right
                                            .cell(right_row, &right_keys[i])
                                            .cloned()
                                            .unwrap_or(CellValue::Null);
                                    }
                                }
                            }
                            rows.push(row);
                        }
                    }
                }
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unknown join type '{other}'"),
                ))
            }
        }

        let result = Table::from_rows(&names, rows)
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))?;
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// union_concatenate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UnionConcatenateConfig {
    #[serde(default)]
    pub axis: u8,
    #[serde(default = "default_outer")]
    pub join: String,
    #[serde(default = "default_true")]
    pub ignore_index: bool,
}

fn default_outer() -> String {
    "outer".to_string()
}

/// Concatenate two or more inputs by rows (`axis: 0`) or columns
/// (`axis: 1`).
pub struct UnionConcatenateNode {
    id: String,
    config: UnionConcatenateConfig,
}

impl UnionConcatenateNode {
    pub fn new(id: String, config: UnionConcatenateConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for UnionConcatenateNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "union_concatenate"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let tables = inputs.tables();
        if tables.len() < 2 {
            return Err(NodeError::new(
                &self.id,
                NodeErrorKind::MissingInput,
                format!("concatenate requires at least two inputs, got {}", tables.len()),
            ));
        }

        let result = match self.config.axis {
            0 => {
                let names: Vec<String> = match self.config.join.as_str() {
                    "outer" => {
                        let mut names: Vec<String> = Vec::new();
                        for table in &tables {
                            for name in table.column_names() {
                                if !names.contains(&name) {
                                    names.push(name);
                                }
                            }
                        }
                        names
                    }
                    "inner" => tables[0]
                        .column_names()
                        .into_iter()
                        .filter(|name| tables.iter().all(|t| t.has_column(name)))
                        .collect(),
                    other => {
                        return Err(NodeError::new(
                            &self.id,
                            NodeErrorKind::Config,
                            format!("unknown join '{other}'"),
                        ))
                    }
                };
                let mut rows = Vec::new();
                for table in &tables {
                    for row in 0..table.row_count() {
                        rows.push(
                            names
                                .iter()
                                .map(|name| {
                                    table.cell(row, name).cloned().unwrap_or(CellValue::Null)
                                })
                                .collect(),
                        );
                    }
                }
                Table::from_rows(&names, rows)
                    .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))?
            }
            1 => {
                let row_count = match self.config.join.as_str() {
                    "inner" => tables.iter().map(|t| t.row_count()).min().unwrap_or(0),
                    _ => tables.iter().map(|t| t.row_count()).max().unwrap_or(0),
                };
                let mut columns: Vec<Column> = Vec::new();
                let mut seen: HashSet<String> = HashSet::new();
                for (i, table) in tables.iter().enumerate() {
                    for column in table.columns() {
                        // Column names must stay unique; later duplicates
                        // get a positional suffix.
                        let name = if seen.insert(column.name().to_string()) {
                            column.name().to_string()
                        } else {
                            format!("{}_{i}", column.name())
                        };
                        let values: Vec<CellValue> = (0..row_count)
                            .map(|r| column.get(r).cloned().unwrap_or(CellValue::Null))
                            .collect();
                        columns.push(Column::new(name, column.dtype(), values));
                    }
                }
                Table::from_columns(columns)
                    .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))?
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("axis must be 0 or 1, got {other}"),
                ))
            }
        };
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// apply_function
// ---------------------------------------------------------------------------

enum ApplyPlan {
    /// Element-wise builtin over target columns.
    Builtin(String),
    /// Element-wise lambda with `x` bound to each cell.
    CellLambda(Expr),
    /// Row-wise lambda producing one result column.
    RowLambda { expr: Expr, result_column: String },
}

/// Apply a builtin or sandboxed lambda over columns or rows.
pub struct ApplyFunctionNode {
    id: String,
    plan: ApplyPlan,
    target_columns: Option<Vec<String>>,
}

impl ApplyFunctionNode {
    pub fn from_spec(id: String, config: &Map<String, Value>) -> Result<Self, ValidationError> {
        let function_type = config
            .get("function_type")
            .and_then(Value::as_str)
            .unwrap_or("builtin");
        let function_code = config
            .get("function_code")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::InvalidNodeConfig {
                node_id: id.clone(),
                reason: "missing 'function_code'".to_string(),
            })?;
        let axis = config.get("axis").and_then(Value::as_u64).unwrap_or(0);
        let target_columns = config
            .get("target_columns")
            .and_then(name_list);

        let plan = match (function_type, axis) {
            ("builtin", _) => {
                const BUILTINS: &[&str] =
                    &["abs", "upper", "lower", "trim", "length", "round", "floor", "ceil"];
                if !BUILTINS.contains(&function_code) {
                    return Err(ValidationError::InvalidNodeConfig {
                        node_id: id,
                        reason: format!("unknown builtin '{function_code}'"),
                    });
                }
                ApplyPlan::Builtin(function_code.to_string())
            }
            ("lambda", 1) => ApplyPlan::RowLambda {
                expr: parse_node_expression(&id, function_code)?,
                result_column: config
                    .get("result_column")
                    .and_then(Value::as_str)
                    .unwrap_or("result")
                    .to_string(),
            },
            ("lambda", _) => ApplyPlan::CellLambda(parse_node_expression(&id, function_code)?),
            (other, _) => {
                return Err(ValidationError::InvalidNodeConfig {
                    node_id: id,
                    reason: format!("unknown function_type '{other}'"),
                })
            }
        };
        Ok(Self {
            id,
            plan,
            target_columns,
        })
    }

    fn apply_builtin(&self, name: &str, cell: &CellValue) -> Result<CellValue, NodeError> {
        if cell.is_null() {
            return Ok(CellValue::Null);
        }
        let bad = |reason: String| NodeError::new(&self.id, NodeErrorKind::Config, reason);
        match name {
            "upper" => Ok(CellValue::String(cell.render().to_uppercase())),
            "lower" => Ok(CellValue::String(cell.render().to_lowercase())),
            "trim" => Ok(CellValue::String(cell.render().trim().to_string())),
            "length" => Ok(CellValue::Integer(cell.render().chars().count() as i64)),
            "abs" => match cell {
                CellValue::Integer(v) => Ok(CellValue::Integer(v.abs())),
                CellValue::Float(v) => Ok(CellValue::Float(v.abs())),
                other => Err(bad(format!("abs over non-numeric value '{}'", other.render()))),
            },
            "round" | "floor" | "ceil" => {
                let v = cell
                    .as_f64()
                    .ok_or_else(|| bad(format!("{name} over non-numeric value")))?;
                let rounded = match name {
                    "round" => v.round(),
                    "floor" => v.floor(),
                    _ => v.ceil(),
                };
                Ok(CellValue::Integer(rounded as i64))
            }
            other => Err(bad(format!("unknown builtin '{other}'"))),
        }
    }
}

#[async_trait]
impl FlowNode for ApplyFunctionNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "apply_function"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let targets = match &self.target_columns {
            Some(columns) => {
                require_columns(&self.id, table, columns)?;
                columns.clone()
            }
            None => table.column_names(),
        };

        let result = match &self.plan {
            ApplyPlan::Builtin(name) => {
                let mut result = table.clone();
                for target in &targets {
                    let column = table.column(target).expect("validated above");
                    let mut values = Vec::with_capacity(column.len());
                    for cell in column.values() {
                        values.push(self.apply_builtin(name, cell)?);
                    }
                    result = result.with_column(Column::inferred(target.clone(), values));
                }
                result
            }
            ApplyPlan::CellLambda(expr) => {
                let mut result = table.clone();
                for target in &targets {
                    let column = table.column(target).expect("validated above");
                    let mut values = Vec::with_capacity(column.len());
                    for cell in column.values() {
                        values.push(
                            eval(expr, Scope::Cell { value: cell }).map_err(|e| {
                                NodeError::new(&self.id, NodeErrorKind::Expression, e)
                            })?,
                        );
                    }
                    result = result.with_column(Column::inferred(target.clone(), values));
                }
                result
            }
            ApplyPlan::RowLambda { expr, result_column } => {
                let mut values = Vec::with_capacity(table.row_count());
                for row in 0..table.row_count() {
                    values.push(eval(expr, Scope::Row { table, row }).map_err(|e| {
                        NodeError::new(&self.id, NodeErrorKind::Expression, e)
                    })?);
                }
                table.with_column(Column::inferred(result_column.clone(), values))
            }
        };
        Ok(FlowValue::Table(result))
    }
}

// ---------------------------------------------------------------------------
// run_python_script
// ---------------------------------------------------------------------------

/// Run a user script in the sandboxed table DSL. The script sees the input
/// table and the tabular statements only; its output is always a table.
pub struct RunScriptNode {
    id: String,
    statements: Vec<script::Statement>,
}

impl RunScriptNode {
    pub fn from_spec(id: String, config: &Map<String, Value>) -> Result<Self, ValidationError> {
        let source = config
            .get("script_code")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::InvalidNodeConfig {
                node_id: id.clone(),
                reason: "missing 'script_code'".to_string(),
            })?;
        let statements =
            script::parse_script(source).map_err(|reason| ValidationError::InvalidNodeConfig {
                node_id: id.clone(),
                reason,
            })?;
        Ok(Self { id, statements })
    }
}

#[async_trait]
impl FlowNode for RunScriptNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "run_python_script"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let result = script::run(table, &self.statements)
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Script, e))?;
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

    fn sales() -> Table {
        Table::from_rows(
            &[
                "region".to_string(),
                "quarter".to_string(),
                "amount".to_string(),
            ],
            vec![
                vec![
                    CellValue::String("east".into()),
                    CellValue::String("q1".into()),
                    CellValue::Integer(10),
                ],
                vec![
                    CellValue::String("east".into()),
                    CellValue::String("q2".into()),
                    CellValue::Integer(20),
                ],
                vec![
                    CellValue::String("west".into()),
                    CellValue::String("q1".into()),
                    CellValue::Integer(5),
                ],
                vec![
                    CellValue::String("west".into()),
                    CellValue::String("q1".into()),
                    CellValue::Integer(15),
                ],
            ],
        )
        .unwrap()
    }

    fn table_input(tables: Vec<Table>) -> InputMap {
        let mut inputs = InputMap::new();
        for (i, table) in tables.into_iter().enumerate() {
            inputs.insert(format!("in{i}"), FlowValue::Table(table));
        }
        inputs
    }

    async fn run_one(node: &dyn FlowNode, table: Table) -> Result<Table, NodeError> {
        let value = node.invoke(&table_input(vec![table]), &ctx()).await?;
        Ok(value.as_table().unwrap().clone())
    }

    #[tokio::test]
    async fn missing_values_drop_fill_and_ffill() {
        let table = Table::from_rows(
            &["a".to_string()],
            vec![
                vec![CellValue::Integer(1)],
                vec![CellValue::Null],
                vec![CellValue::Integer(3)],
            ],
        )
        .unwrap();

        let drop = HandleMissingValuesNode::new(
            "m".into(),
            serde_json::from_value(json!({"method": "drop"})).unwrap(),
        );
        assert_eq!(run_one(&drop, table.clone()).await.unwrap().row_count(), 2);

        let fill = HandleMissingValuesNode::new(
            "m".into(),
            serde_json::from_value(json!({"method": "fill", "fill_value": 0})).unwrap(),
        );
        let filled = run_one(&fill, table.clone()).await.unwrap();
        assert_eq!(filled.cell(1, "a"), Some(&CellValue::Integer(0)));

        let ffill = HandleMissingValuesNode::new(
            "m".into(),
            serde_json::from_value(json!({"method": "forward_fill"})).unwrap(),
        );
        let forward = run_one(&ffill, table).await.unwrap();
        assert_eq!(forward.cell(1, "a"), Some(&CellValue::Integer(1)));
    }

    #[tokio::test]
    async fn deduplicate_policies() {
        let table = Table::from_rows(
            &["k".to_string(), "v".to_string()],
            vec![
                vec![CellValue::String("a".into()), CellValue::Integer(1)],
                vec![CellValue::String("a".into()), CellValue::Integer(2)],
                vec![CellValue::String("b".into()), CellValue::Integer(3)],
            ],
        )
        .unwrap();

        let first = DeduplicateNode::new(
            "d".into(),
            serde_json::from_value(json!({"columns": ["k"], "keep": "first"})).unwrap(),
        );
        let result = run_one(&first, table.clone()).await.unwrap();
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.cell(0, "v"), Some(&CellValue::Integer(1)));

        let last = DeduplicateNode::new(
            "d".into(),
            serde_json::from_value(json!({"columns": ["k"], "keep": "last"})).unwrap(),
        );
        let result = run_one(&last, table.clone()).await.unwrap();
        assert_eq!(result.cell(0, "v"), Some(&CellValue::Integer(2)));

        let none = DeduplicateNode::new(
            "d".into(),
            serde_json::from_value(json!({"columns": ["k"], "keep": "none"})).unwrap(),
        );
        let result = run_one(&none, table).await.unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.cell(0, "k"), Some(&CellValue::String("b".into())));
    }

    #[tokio::test]
    async fn sort_is_stable_with_mixed_directions() {
        let node = SortDataNode::new(
            "s".into(),
            serde_json::from_value(
                json!({"sort_by": ["region", "amount"], "ascending": [true, false]}),
            )
            .unwrap(),
        );
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(result.cell(0, "amount"), Some(&CellValue::Integer(20)));
        assert_eq!(result.cell(2, "amount"), Some(&CellValue::Integer(15)));
    }

    #[tokio::test]
    async fn group_aggregate_flattens_multi_function_names() {
        let node = GroupAggregateNode::new(
            "g".into(),
            serde_json::from_value(json!({
                "group_by": ["region"],
                "aggregations": {"amount": ["sum", "count"]}
            }))
            .unwrap(),
        );
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(
            result.column_names(),
            vec!["region", "amount_sum", "amount_count"]
        );
        assert_eq!(result.cell(0, "amount_sum"), Some(&CellValue::Integer(30)));
        assert_eq!(result.cell(1, "amount_count"), Some(&CellValue::Integer(2)));
    }

    #[tokio::test]
    async fn group_aggregate_single_function_keeps_name() {
        let node = GroupAggregateNode::new(
            "g".into(),
            serde_json::from_value(json!({
                "group_by": ["region"],
                "aggregations": {"amount": "mean"}
            }))
            .unwrap(),
        );
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(result.column_names(), vec!["region", "amount"]);
        assert_eq!(result.cell(0, "amount"), Some(&CellValue::Float(15.0)));
    }

    #[tokio::test]
    async fn pivot_spreads_labels_with_fill() {
        let node = PivotTableNode::new(
            "p".into(),
            serde_json::from_value(json!({
                "values": "amount",
                "index": "region",
                "columns": "quarter",
                "aggfunc": "sum",
                "fill_value": 0
            }))
            .unwrap(),
        );
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(result.column_names(), vec!["region", "q1", "q2"]);
        assert_eq!(result.cell(0, "q1"), Some(&CellValue::Integer(10)));
        assert_eq!(result.cell(1, "q1"), Some(&CellValue::Integer(20)));
        assert_eq!(result.cell(1, "q2"), Some(&CellValue::Integer(0)));
    }

    #[tokio::test]
    async fn melt_unpivots_column_major() {
        let table = Table::from_rows(
            &["id".to_string(), "a".to_string(), "b".to_string()],
            vec![vec![
                CellValue::Integer(1),
                CellValue::Integer(10),
                CellValue::Integer(20),
            ]],
        )
        .unwrap();
        let node = MeltNode::new(
            "m".into(),
            serde_json::from_value(json!({"id_vars": ["id"]})).unwrap(),
        );
        let result = run_one(&node, table).await.unwrap();
        assert_eq!(result.column_names(), vec!["id", "variable", "value"]);
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.cell(0, "variable"), Some(&CellValue::String("a".into())));
        assert_eq!(result.cell(1, "value"), Some(&CellValue::Integer(20)));
    }

    #[tokio::test]
    async fn window_rolling_and_groupby() {
        let node = WindowFunctionsNode::new(
            "w".into(),
            serde_json::from_value(json!({
                "window_type": "rolling",
                "columns": ["amount"],
                "functions": ["sum"],
                "window_size": 2
            }))
            .unwrap(),
        );
        let result = run_one(&node, sales()).await.unwrap();
        let column = result.column("amount_sum_rolling").unwrap();
        assert_eq!(column.values()[0], CellValue::Integer(10));
        assert_eq!(column.values()[1], CellValue::Integer(30));
        assert_eq!(column.values()[3], CellValue::Integer(20));

        let grouped = WindowFunctionsNode::new(
            "w".into(),
            serde_json::from_value(json!({
                "window_type": "groupby",
                "columns": ["amount"],
                "functions": ["mean"],
                "group_by": ["region"]
            }))
            .unwrap(),
        );
        let result = run_one(&grouped, sales()).await.unwrap();
        let column = result.column("amount_mean_groupby").unwrap();
        assert_eq!(column.values()[0], CellValue::Float(15.0));
        assert_eq!(column.values()[2], CellValue::Float(10.0));
    }

    fn join_inputs() -> InputMap {
        let left = Table::from_rows(
            &["id".to_string(), "name".to_string()],
            vec![
                vec![CellValue::Integer(1), CellValue::String("ana".into())],
                vec![CellValue::Integer(2), CellValue::String("bo".into())],
                vec![CellValue::Integer(3), CellValue::String("cy".into())],
            ],
        )
        .unwrap();
        let right = Table::from_rows(
            &["id".to_string(), "total".to_string()],
            vec![
                vec![CellValue::Integer(1), CellValue::Integer(100)],
                vec![CellValue::Integer(4), CellValue::Integer(400)],
            ],
        )
        .unwrap();
        table_input(vec![left, right])
    }

    #[tokio::test]
    async fn join_inner_left_and_outer() {
        let inner = JoinMergeNode::new(
            "j".into(),
            serde_json::from_value(json!({"join_type": "inner", "on": "id"})).unwrap(),
        );
        let result = inner.invoke(&join_inputs(), &ctx()).await.unwrap();
        let table = result.as_table().unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.column_names(), vec!["id", "name", "total"]);

        let left = JoinMergeNode::new(
            "j".into(),
            serde_json::from_value(json!({"join_type": "left", "on": "id"})).unwrap(),
        );
        let result = left.invoke(&join_inputs(), &ctx()).await.unwrap();
        let table = result.as_table().unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.cell(1, "total"), Some(&CellValue::Null));

        let outer = JoinMergeNode::new(
            "j".into(),
            serde_json::from_value(json!({"join_type": "outer", "on": "id"})).unwrap(),
        );
        let result = outer.invoke(&join_inputs(), &ctx()).await.unwrap();
        let table = result.as_table().unwrap();
        assert_eq!(table.row_count(), 4);
        // The unmatched right row keeps its key in the shared column.
        assert_eq!(table.cell(3, "id"), Some(&CellValue::Integer(4)));
        assert_eq!(table.cell(3, "name"), Some(&CellValue::Null));
    }

    #[tokio::test]
    async fn concat_rows_outer_unions_columns() {
        let a = Table::from_rows(
            &["x".to_string()],
            vec![vec![CellValue::Integer(1)]],
        )
        .unwrap();
        let b = Table::from_rows(
            &["x".to_string(), "y".to_string()],
            vec![vec![CellValue::Integer(2), CellValue::Integer(3)]],
        )
        .unwrap();
        let node = UnionConcatenateNode::new(
            "u".into(),
            serde_json::from_value(json!({"axis": 0, "join": "outer"})).unwrap(),
        );
        let result = node.invoke(&table_input(vec![a.clone(), b.clone()]), &ctx()).await.unwrap();
        let table = result.as_table().unwrap();
        assert_eq!(table.column_names(), vec!["x", "y"]);
        assert_eq!(table.cell(0, "y"), Some(&CellValue::Null));

        let inner = UnionConcatenateNode::new(
            "u".into(),
            serde_json::from_value(json!({"axis": 0, "join": "inner"})).unwrap(),
        );
        let result = inner.invoke(&table_input(vec![a, b]), &ctx()).await.unwrap();
        assert_eq!(result.as_table().unwrap().column_names(), vec!["x"]);
    }

    #[tokio::test]
    async fn apply_builtin_and_lambdas() {
        let config: Map<String, Value> = json!({
            "function_type": "builtin",
            "function_code": "upper",
            "target_columns": ["region"]
        })
        .as_object()
        .unwrap()
        .clone();
        let node = ApplyFunctionNode::from_spec("a".into(), &config).unwrap();
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(result.cell(0, "region"), Some(&CellValue::String("EAST".into())));

        let config: Map<String, Value> = json!({
            "function_type": "lambda",
            "function_code": "x * 2",
            "target_columns": ["amount"]
        })
        .as_object()
        .unwrap()
        .clone();
        let node = ApplyFunctionNode::from_spec("a".into(), &config).unwrap();
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(result.cell(0, "amount"), Some(&CellValue::Integer(20)));

        let config: Map<String, Value> = json!({
            "function_type": "lambda",
            "function_code": "amount > 10",
            "axis": 1,
            "result_column": "big"
        })
        .as_object()
        .unwrap()
        .clone();
        let node = ApplyFunctionNode::from_spec("a".into(), &config).unwrap();
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(result.cell(1, "big"), Some(&CellValue::Boolean(true)));
    }

    #[tokio::test]
    async fn run_script_produces_table_and_rejects_bad_scripts() {
        let config: Map<String, Value> = json!({
            "script_code": "derive doubled = amount * 2\nselect region, doubled"
        })
        .as_object()
        .unwrap()
        .clone();
        let node = RunScriptNode::from_spec("s".into(), &config).unwrap();
        let result = run_one(&node, sales()).await.unwrap();
        assert_eq!(result.column_names(), vec!["region", "doubled"]);
        assert_eq!(result.cell(1, "doubled"), Some(&CellValue::Integer(40)));

        let bad: Map<String, Value> = json!({"script_code": "import os"})
            .as_object()
            .unwrap()
            .clone();
        assert!(RunScriptNode::from_spec("s".into(), &bad).is_err());
    }
}
