// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Columnar table value flowing on every edge of a pipeline.
//!
//! A [`Table`] is an ordered sequence of named, typed columns over an ordered
//! sequence of rows. Column storage is shared via `Arc`, so cloning a table
//! or carrying an untouched column through a transform is cheap; transforms
//! that change data build replacement column vectors (copy-on-write).
//!
//! Cell values are one of: integer, floating, boolean, string, timestamp, or
//! null. The declared [`DataType`] of a column is advisory for serialization
//! and casting; individual cells always carry their own runtime variant.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Column data types recognized by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Float,
    Boolean,
    String,
    Timestamp,
}

impl DataType {
    /// Canonical lowercase name used in serialized `dtypes` maps.
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Timestamp => "timestamp",
        }
    }

    /// Parse a user-facing type name, accepting the common aliases that show
    /// up in `change_data_type` configs.
    pub fn parse(name: &str) -> Option<DataType> {
        match name.to_ascii_lowercase().as_str() {
            "integer" | "int" | "int64" => Some(DataType::Integer),
            "float" | "double" | "float64" | "number" => Some(DataType::Float),
            "boolean" | "bool" => Some(DataType::Boolean),
            "string" | "str" | "text" | "object" => Some(DataType::String),
            "timestamp" | "datetime" | "date" => Some(DataType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single cell in a table.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Timestamp(DateTime<Utc>),
    Null,
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Runtime data type of the cell; `None` for nulls.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            CellValue::Integer(_) => Some(DataType::Integer),
            CellValue::Float(_) => Some(DataType::Float),
            CellValue::Boolean(_) => Some(DataType::Boolean),
            CellValue::String(_) => Some(DataType::String),
            CellValue::Timestamp(_) => Some(DataType::Timestamp),
            CellValue::Null => None,
        }
    }

    /// Numeric view of the cell, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(v) => Some(*v as f64),
            CellValue::Float(v) => Some(*v),
            CellValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Truthiness used by boolean contexts in the expression language.
    pub fn truthy(&self) -> bool {
        match self {
            CellValue::Boolean(b) => *b,
            CellValue::Integer(v) => *v != 0,
            CellValue::Float(v) => *v != 0.0,
            CellValue::String(s) => !s.is_empty(),
            CellValue::Timestamp(_) => true,
            CellValue::Null => false,
        }
    }

    /// Total ordering across cells: nulls sort last, numbers compare across
    /// integer/float, and unlike types fall back to a fixed type rank.
    pub fn compare(&self, other: &CellValue) -> Ordering {
        use CellValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,
            (Integer(a), Integer(b)) => a.cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => type_rank(a).cmp(&type_rank(b)),
            },
        }
    }

    /// Canonical key string used for grouping, joining and deduplication.
    pub fn group_key(&self) -> String {
        match self {
            CellValue::Integer(v) => format!("i:{v}"),
            // Integral floats collapse onto the integer key so 1 and 1.0
            // land in the same group, matching numeric equality.
            CellValue::Float(v) if v.fract() == 0.0 && v.is_finite() => {
                format!("i:{}", *v as i64)
            }
            CellValue::Float(v) => format!("f:{v}"),
            CellValue::Boolean(b) => format!("b:{b}"),
            CellValue::String(s) => format!("s:{s}"),
            CellValue::Timestamp(t) => format!("t:{}", t.timestamp_micros()),
            CellValue::Null => "n".to_string(),
        }
    }

    /// Cast the cell to the requested type.
    pub fn cast(&self, dtype: DataType) -> Result<CellValue, String> {
        if self.is_null() {
            return Ok(CellValue::Null);
        }
        match dtype {
            DataType::Integer => match self {
                CellValue::Integer(v) => Ok(CellValue::Integer(*v)),
                CellValue::Float(v) => Ok(CellValue::Integer(*v as i64)),
                CellValue::Boolean(b) => Ok(CellValue::Integer(i64::from(*b))),
                CellValue::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(CellValue::Integer)
                    .map_err(|_| format!("cannot cast '{s}' to integer")),
                other => Err(format!("cannot cast {} to integer", describe(other))),
            },
            DataType::Float => match self {
                CellValue::Integer(v) => Ok(CellValue::Float(*v as f64)),
                CellValue::Float(v) => Ok(CellValue::Float(*v)),
                CellValue::Boolean(b) => Ok(CellValue::Float(if *b { 1.0 } else { 0.0 })),
                CellValue::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(CellValue::Float)
                    .map_err(|_| format!("cannot cast '{s}' to float")),
                other => Err(format!("cannot cast {} to float", describe(other))),
            },
            DataType::Boolean => match self {
                CellValue::Boolean(b) => Ok(CellValue::Boolean(*b)),
                CellValue::Integer(v) => Ok(CellValue::Boolean(*v != 0)),
                CellValue::Float(v) => Ok(CellValue::Boolean(*v != 0.0)),
                CellValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(CellValue::Boolean(true)),
                    "false" | "0" | "no" => Ok(CellValue::Boolean(false)),
                    _ => Err(format!("cannot cast '{s}' to boolean")),
                },
                other => Err(format!("cannot cast {} to boolean", describe(other))),
            },
            DataType::String => Ok(CellValue::String(self.render())),
            DataType::Timestamp => match self {
                CellValue::Timestamp(t) => Ok(CellValue::Timestamp(*t)),
                CellValue::Integer(v) => DateTime::<Utc>::from_timestamp(*v, 0)
                    .map(CellValue::Timestamp)
                    .ok_or_else(|| format!("cannot cast {v} to timestamp")),
                CellValue::String(s) => s
                    .parse::<DateTime<Utc>>()
                    .map(CellValue::Timestamp)
                    .map_err(|_| format!("cannot cast '{s}' to timestamp")),
                other => Err(format!("cannot cast {} to timestamp", describe(other))),
            },
        }
    }

    /// Human-readable rendering, also used when casting to string.
    pub fn render(&self) -> String {
        match self {
            CellValue::Integer(v) => v.to_string(),
            CellValue::Float(v) => v.to_string(),
            CellValue::Boolean(b) => b.to_string(),
            CellValue::String(s) => s.clone(),
            CellValue::Timestamp(t) => t.to_rfc3339(),
            CellValue::Null => "null".to_string(),
        }
    }

    /// Convert a JSON value into a cell.
    pub fn from_json(value: &Value) -> CellValue {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CellValue::Integer(i)
                } else {
                    CellValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => CellValue::String(s.clone()),
            // Nested structures are carried as their JSON rendering.
            other => CellValue::String(other.to_string()),
        }
    }

    /// Convert the cell into a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Integer(v) => Value::from(*v),
            CellValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Boolean(b) => Value::Bool(*b),
            CellValue::String(s) => Value::String(s.clone()),
            CellValue::Timestamp(t) => Value::String(t.to_rfc3339()),
            CellValue::Null => Value::Null,
        }
    }
}

fn describe(cell: &CellValue) -> &'static str {
    cell.data_type().map(|d| d.name()).unwrap_or("null")
}

fn type_rank(cell: &CellValue) -> u8 {
    match cell {
        CellValue::Boolean(_) => 0,
        CellValue::Integer(_) => 1,
        CellValue::Float(_) => 1,
        CellValue::String(_) => 2,
        CellValue::Timestamp(_) => 3,
        CellValue::Null => 4,
    }
}

/// A named, typed column with shared storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    dtype: DataType,
    values: Arc<Vec<CellValue>>,
}

impl Column {
    pub fn new(name: impl Into<String>, dtype: DataType, values: Vec<CellValue>) -> Column {
        Column {
            name: name.into(),
            dtype,
            values: Arc::new(values),
        }
    }

    /// Build a column, inferring its type from the values.
    pub fn inferred(name: impl Into<String>, values: Vec<CellValue>) -> Column {
        let dtype = infer_dtype(&values);
        Column::new(name, dtype, values)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    pub fn get(&self, row: usize) -> Option<&CellValue> {
        self.values.get(row)
    }

    /// Same storage, different name.
    pub fn renamed(&self, name: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            dtype: self.dtype,
            values: Arc::clone(&self.values),
        }
    }

    /// Gather the given row indices into a new column.
    pub fn take(&self, rows: &[usize]) -> Column {
        let values = rows
            .iter()
            .map(|&r| self.values.get(r).cloned().unwrap_or(CellValue::Null))
            .collect();
        Column {
            name: self.name.clone(),
            dtype: self.dtype,
            values: Arc::new(values),
        }
    }
}

/// Infer a column type from its cells; mixed non-null types degrade to string.
pub fn infer_dtype(values: &[CellValue]) -> DataType {
    let mut seen: Option<DataType> = None;
    for value in values {
        let Some(dtype) = value.data_type() else {
            continue;
        };
        seen = Some(match seen {
            None => dtype,
            Some(prev) if prev == dtype => prev,
            Some(DataType::Integer) if dtype == DataType::Float => DataType::Float,
            Some(DataType::Float) if dtype == DataType::Integer => DataType::Float,
            Some(_) => DataType::String,
        });
    }
    seen.unwrap_or(DataType::String)
}

/// The in-flight tabular value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// An empty table with no columns and no rows.
    pub fn new() -> Table {
        Table::default()
    }

    /// Assemble a table from columns. All columns must share one length.
    pub fn from_columns(columns: Vec<Column>) -> Result<Table, String> {
        if let Some(first) = columns.first() {
            let expected = first.len();
            for column in &columns {
                if column.len() != expected {
                    return Err(format!(
                        "column '{}' has {} rows, expected {}",
                        column.name(),
                        column.len(),
                        expected
                    ));
                }
            }
            let mut seen = HashMap::new();
            for column in &columns {
                if seen.insert(column.name().to_string(), ()).is_some() {
                    return Err(format!("duplicate column name '{}'", column.name()));
                }
            }
        }
        Ok(Table { columns })
    }

    /// Build a table from row tuples and column names, inferring types.
    pub fn from_rows(names: &[String], rows: Vec<Vec<CellValue>>) -> Result<Table, String> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != names.len() {
                return Err(format!(
                    "row {i} has {} cells, expected {}",
                    row.len(),
                    names.len()
                ));
            }
        }
        let mut columns = Vec::with_capacity(names.len());
        for (c, name) in names.iter().enumerate() {
            let values: Vec<CellValue> = rows.iter().map(|row| row[c].clone()).collect();
            columns.push(Column::inferred(name.clone(), values));
        }
        Table::from_columns(columns)
    }

    /// Tabulate a list of JSON records. Column order is first-seen order
    /// across the records; missing keys become nulls.
    pub fn from_json_records(records: &[Map<String, Value>]) -> Table {
        let mut names: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }
        let columns = names
            .iter()
            .map(|name| {
                let values: Vec<CellValue> = records
                    .iter()
                    .map(|r| r.get(name).map(CellValue::from_json).unwrap_or(CellValue::Null))
                    .collect();
                Column::inferred(name.clone(), values)
            })
            .collect();
        Table { columns }
    }

    /// Tabulate an arbitrary JSON value the way source nodes do: arrays of
    /// objects become records, a lone object becomes a single row, and any
    /// scalar becomes one row in a `data` column.
    pub fn from_json_value(value: &Value) -> Table {
        match value {
            Value::Array(items) => {
                let records: Vec<Map<String, Value>> = items
                    .iter()
                    .map(|item| match item {
                        Value::Object(map) => map.clone(),
                        other => {
                            let mut map = Map::new();
                            map.insert("data".to_string(), other.clone());
                            map
                        }
                    })
                    .collect();
                Table::from_json_records(&records)
            }
            Value::Object(map) => Table::from_json_records(std::slice::from_ref(map)),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other.clone());
                Table::from_json_records(&[map])
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// `[rows, columns]`, the shape reported in dispatch responses.
    pub fn shape(&self) -> [usize; 2] {
        [self.row_count(), self.column_count()]
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name() == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    pub fn cell(&self, row: usize, name: &str) -> Option<&CellValue> {
        self.column(name).and_then(|c| c.get(row))
    }

    /// New table keeping only the named columns, in the requested order.
    /// Missing names are reported back to the caller.
    pub fn select(&self, names: &[String]) -> Result<Table, String> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            match self.column(name) {
                Some(column) => columns.push(column.clone()),
                None => return Err(format!("column '{name}' not found")),
            }
        }
        Ok(Table { columns })
    }

    /// New table without the named columns; unknown names are ignored.
    pub fn drop_columns(&self, names: &[String]) -> Table {
        let columns = self
            .columns
            .iter()
            .filter(|c| !names.iter().any(|n| n == c.name()))
            .cloned()
            .collect();
        Table { columns }
    }

    /// Replace or append a column, keeping declaration order for existing
    /// columns and appending new ones at the end.
    pub fn with_column(&self, column: Column) -> Table {
        let mut columns = self.columns.clone();
        match columns.iter().position(|c| c.name() == column.name()) {
            Some(i) => columns[i] = column,
            None => columns.push(column),
        }
        Table { columns }
    }

    /// Gather the given row indices into a new table.
    pub fn take_rows(&self, rows: &[usize]) -> Table {
        let columns = self.columns.iter().map(|c| c.take(rows)).collect();
        Table { columns }
    }

    /// One row as `(column name, cell)` pairs in column order.
    pub fn row(&self, index: usize) -> Vec<(&str, &CellValue)> {
        self.columns
            .iter()
            .map(|c| (c.name(), c.get(index).unwrap_or(&CellValue::Null)))
            .collect()
    }

    /// Serialize all rows as JSON objects in row order.
    pub fn to_json_records(&self) -> Vec<Map<String, Value>> {
        (0..self.row_count())
            .map(|r| {
                let mut record = Map::new();
                for column in &self.columns {
                    record.insert(
                        column.name().to_string(),
                        column.get(r).map(CellValue::to_json).unwrap_or(Value::Null),
                    );
                }
                record
            })
            .collect()
    }

    /// `{name -> type name}` map reported in dispatch responses.
    pub fn dtypes(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for column in &self.columns {
            map.insert(
                column.name().to_string(),
                Value::String(column.dtype().name().to_string()),
            );
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_rows(
            &["id".to_string(), "name".to_string()],
            vec![
                vec![CellValue::Integer(1), CellValue::String("x".into())],
                vec![CellValue::Integer(2), CellValue::String("y".into())],
            ],
        )
        .unwrap()
    }

    #[test]
    fn from_rows_infers_types_and_shape() {
        let table = sample();
        assert_eq!(table.shape(), [2, 2]);
        assert_eq!(table.column("id").unwrap().dtype(), DataType::Integer);
        assert_eq!(table.column("name").unwrap().dtype(), DataType::String);
    }

    #[test]
    fn select_preserves_order_and_reports_missing() {
        let table = sample();
        let narrowed = table.select(&["name".to_string()]).unwrap();
        assert_eq!(narrowed.column_names(), vec!["name"]);
        assert!(table.select(&["ghost".to_string()]).is_err());
    }

    #[test]
    fn drop_ignores_unknown_columns() {
        let table = sample();
        let dropped = table.drop_columns(&["ghost".to_string(), "id".to_string()]);
        assert_eq!(dropped.column_names(), vec!["name"]);
        assert_eq!(dropped.row_count(), 2);
    }

    #[test]
    fn take_rows_gathers_in_order() {
        let table = sample();
        let taken = table.take_rows(&[1, 0]);
        assert_eq!(taken.cell(0, "id"), Some(&CellValue::Integer(2)));
        assert_eq!(taken.cell(1, "id"), Some(&CellValue::Integer(1)));
    }

    #[test]
    fn json_records_round_trip() {
        let table = sample();
        let records = table.to_json_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["name"], Value::String("x".into()));
        let rebuilt = Table::from_json_records(&records);
        assert_eq!(rebuilt, table);
    }

    #[test]
    fn json_value_tabulation_shapes() {
        let array = serde_json::json!([{"a": 1}, {"a": 2, "b": "x"}]);
        let table = Table::from_json_value(&array);
        assert_eq!(table.shape(), [2, 2]);
        assert_eq!(table.cell(0, "b"), Some(&CellValue::Null));

        let object = serde_json::json!({"a": 1});
        assert_eq!(Table::from_json_value(&object).shape(), [1, 1]);

        let scalar = serde_json::json!(42);
        let table = Table::from_json_value(&scalar);
        assert_eq!(table.column_names(), vec!["data"]);
        assert_eq!(table.cell(0, "data"), Some(&CellValue::Integer(42)));
    }

    #[test]
    fn mixed_numeric_column_promotes_to_float() {
        let values = vec![CellValue::Integer(1), CellValue::Float(2.5), CellValue::Null];
        assert_eq!(infer_dtype(&values), DataType::Float);
    }

    #[test]
    fn cast_string_to_integer() {
        assert_eq!(
            CellValue::String(" 42 ".into()).cast(DataType::Integer),
            Ok(CellValue::Integer(42))
        );
        assert!(CellValue::String("x".into()).cast(DataType::Integer).is_err());
        assert_eq!(CellValue::Null.cast(DataType::Integer), Ok(CellValue::Null));
    }

    #[test]
    fn compare_sorts_nulls_last() {
        let mut cells = vec![
            CellValue::Null,
            CellValue::Integer(2),
            CellValue::Float(1.5),
        ];
        cells.sort_by(|a, b| a.compare(b));
        assert_eq!(cells[0], CellValue::Float(1.5));
        assert!(cells[2].is_null());
    }

    #[test]
    fn group_key_unifies_integral_floats() {
        assert_eq!(
            CellValue::Integer(3).group_key(),
            CellValue::Float(3.0).group_key()
        );
    }
}
