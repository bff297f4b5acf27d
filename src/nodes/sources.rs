// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Source nodes: materialize tables from databases, files, HTTP endpoints,
//! webhook payloads or inline configuration.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{FlowNode, FlowValue, InputMap};
use crate::engine::context::ExecutionContext;
use crate::errors::{NodeError, NodeErrorKind};
use crate::table::{CellValue, Table};

/// Parse CSV text into a table, inferring cell types per column.
pub(crate) fn table_from_csv(data: &[u8], delimiter: u8) -> Result<Table, String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(data);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        let mut row = Vec::with_capacity(headers.len());
        for i in 0..headers.len() {
            row.push(cell_from_text(record.get(i).unwrap_or("")));
        }
        rows.push(row);
    }
    Table::from_rows(&headers, rows)
}

fn cell_from_text(text: &str) -> CellValue {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return CellValue::Null;
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return CellValue::Integer(v);
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        return CellValue::Float(v);
    }
    match trimmed {
        "true" | "True" => CellValue::Boolean(true),
        "false" | "False" => CellValue::Boolean(false),
        _ => CellValue::String(text.to_string()),
    }
}

/// Resolve a parameter mapping against the input map: each entry maps a
/// parameter name to the input key whose value should fill it.
fn mapped_parameters(
    mapping: &Map<String, Value>,
    inputs: &InputMap,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for (param, input_key) in mapping {
        let Some(key) = input_key.as_str() else {
            continue;
        };
        if let Some(value) = inputs.scalar(key) {
            resolved.insert(param.clone(), value);
        }
    }
    resolved
}

// ---------------------------------------------------------------------------
// table_reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TableReaderConfig {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

/// Read a database table slice. Checks read authorization before issuing
/// the query.
pub struct TableReaderNode {
    id: String,
    config: TableReaderConfig,
}

impl TableReaderNode {
    pub fn new(id: String, config: TableReaderConfig) -> Self {
        Self { id, config }
    }

    fn build_query(&self) -> String {
        let full_name = match &self.config.schema {
            Some(schema) => format!("{schema}.{}", self.config.table),
            None => self.config.table.clone(),
        };
        let mut query = format!("SELECT * FROM {full_name}");
        if let Some(clause) = &self.config.where_clause {
            query.push_str(&format!(" WHERE {clause}"));
        }
        if let Some(limit) = self.config.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        query
    }
}

#[async_trait]
impl FlowNode for TableReaderNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "table_reader"
    }

    async fn invoke(
        &self,
        _inputs: &InputMap,
        ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let user = ctx.user.identity.as_ref();
        let allowed = ctx
            .services
            .db
            .can_read(user, self.config.schema.as_deref(), &self.config.table)
            .await;
        if !allowed {
            return Err(NodeError::new(
                &self.id,
                NodeErrorKind::PermissionDenied,
                format!("read access denied for table '{}'", self.config.table),
            ));
        }

        let query = self.build_query();
        tracing::debug!(node_id = %self.id, %query, "executing table query");
        let table = ctx
            .services
            .db
            .query(&query, &Map::new())
            .await
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Database, e.to_string()))?;
        tracing::info!(node_id = %self.id, rows = table.row_count(), table = %self.config.table, "table read complete");
        Ok(FlowValue::Table(table))
    }
}

// ---------------------------------------------------------------------------
// custom_sql
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CustomSqlConfig {
    pub query: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub parameter_mapping: Map<String, Value>,
}

/// Run a parameterized read-only statement; named parameters come from the
/// static config merged with mapped values from the input map.
pub struct CustomSqlNode {
    id: String,
    config: CustomSqlConfig,
}

impl CustomSqlNode {
    pub fn new(id: String, config: CustomSqlConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for CustomSqlNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "custom_sql"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let mut params = self.config.parameters.clone();
        for (name, value) in mapped_parameters(&self.config.parameter_mapping, inputs) {
            params.insert(name, value);
        }

        let table = ctx
            .services
            .db
            .query(&self.config.query, &params)
            .await
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Database, e.to_string()))?;
        tracing::info!(node_id = %self.id, rows = table.row_count(), "sql query complete");
        Ok(FlowValue::Table(table))
    }
}

// ---------------------------------------------------------------------------
// file_input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReadOptions {
    #[serde(default)]
    pub delimiter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInputConfig {
    pub path: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub read_options: ReadOptions,
}

fn default_format() -> String {
    "auto".to_string()
}

/// Read a file into a table. Format is auto-detected from the extension
/// unless pinned in config; `excel` and `parquet` are recognized but not
/// supported by this build.
pub struct FileInputNode {
    id: String,
    config: FileInputConfig,
}

impl FileInputNode {
    pub fn new(id: String, config: FileInputConfig) -> Self {
        Self { id, config }
    }

    fn resolve_format(&self) -> String {
        if self.config.format != "auto" {
            return self.config.format.clone();
        }
        let extension = self
            .config
            .path
            .rsplit('.')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match extension.as_str() {
            "json" => "json".to_string(),
            "xlsx" | "xls" => "excel".to_string(),
            "parquet" => "parquet".to_string(),
            _ => "csv".to_string(),
        }
    }
}

#[async_trait]
impl FlowNode for FileInputNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "file_input"
    }

    async fn invoke(
        &self,
        _inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let format = self.resolve_format();
        let bytes = tokio::fs::read(&self.config.path)
            .await
            .map_err(|e| {
                NodeError::new(
                    &self.id,
                    NodeErrorKind::Io,
                    format!("cannot read '{}': {e}", self.config.path),
                )
            })?;

        let table = match format.as_str() {
            "csv" => {
                let delimiter = self
                    .config
                    .read_options
                    .delimiter
                    .as_deref()
                    .and_then(|d| d.bytes().next())
                    .unwrap_or(b',');
                table_from_csv(&bytes, delimiter)
                    .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Io, e))?
            }
            "json" => {
                let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    NodeError::new(&self.id, NodeErrorKind::Io, format!("invalid JSON: {e}"))
                })?;
                Table::from_json_value(&value)
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Unsupported,
                    format!("unsupported file format: {other}"),
                ))
            }
        };

        tracing::info!(node_id = %self.id, rows = table.row_count(), path = %self.config.path, "file read complete");
        Ok(FlowValue::Table(table))
    }
}

// ---------------------------------------------------------------------------
// api_endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEndpointConfig {
    pub url: String,
    #[serde(default = "default_get")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub parameter_mapping: Map<String, Value>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub data_key: Option<String>,
}

fn default_get() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    30
}

/// Fetch JSON from an HTTP endpoint and tabulate the response.
pub struct ApiEndpointNode {
    id: String,
    config: ApiEndpointConfig,
}

impl ApiEndpointNode {
    pub fn new(id: String, config: ApiEndpointConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for ApiEndpointNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "api_endpoint"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let http_err =
            |message: String| NodeError::new(&self.id, NodeErrorKind::Http, message);

        let method = reqwest::Method::from_bytes(self.config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| http_err(format!("invalid HTTP method '{}'", self.config.method)))?;

        let mut params = self.config.params.clone();
        for (name, value) in mapped_parameters(&self.config.parameter_mapping, inputs) {
            params.insert(name, value);
        }
        let query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.clone(), scalar_text(v)))
            .collect();

        let mut request = ctx
            .services
            .http
            .request(method, &self.config.url)
            .timeout(Duration::from_secs(self.config.timeout))
            .query(&query);
        for (name, value) in &self.config.headers {
            request = request.header(name, scalar_text(value));
        }

        let response = request
            .send()
            .await
            .map_err(|e| http_err(format!("request to {} failed: {e}", self.config.url)))?
            .error_for_status()
            .map_err(|e| http_err(e.to_string()))?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| http_err(format!("response is not JSON: {e}")))?;

        let table = match &payload {
            Value::Array(_) => Table::from_json_value(&payload),
            Value::Object(map) => {
                let key = self.config.data_key.as_deref().unwrap_or("data");
                match map.get(key) {
                    Some(inner) => Table::from_json_value(inner),
                    None => Table::from_json_value(&payload),
                }
            }
            other => {
                return Err(http_err(format!(
                    "unsupported JSON structure in response: {other}"
                )))
            }
        };

        tracing::info!(node_id = %self.id, rows = table.row_count(), url = %self.config.url, "api fetch complete");
        Ok(FlowValue::Table(table))
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// static_data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StaticDataConfig {
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub text_data: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub json_data: Value,
    #[serde(default)]
    pub array_data: Vec<Vec<Value>>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

fn default_source() -> String {
    "text".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

/// Synthesize a table from configuration.
pub struct StaticDataNode {
    id: String,
    config: StaticDataConfig,
}

impl StaticDataNode {
    pub fn new(id: String, config: StaticDataConfig) -> Self {
        Self { id, config }
    }

    fn from_text(&self) -> Result<Table, NodeError> {
        let delimiter = self.config.delimiter.bytes().next().unwrap_or(b',');
        table_from_csv(self.config.text_data.as_bytes(), delimiter)
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))
    }

    fn from_json(&self) -> Result<Table, NodeError> {
        // A string config value holds encoded JSON; anything else is taken
        // as the data itself.
        let value = match &self.config.json_data {
            Value::String(text) => serde_json::from_str(text).map_err(|e| {
                NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("invalid json_data: {e}"),
                )
            })?,
            other => other.clone(),
        };
        Ok(Table::from_json_value(&value))
    }

    fn from_array(&self) -> Result<Table, NodeError> {
        let width = self
            .config
            .array_data
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        let names: Vec<String> = match &self.config.columns {
            Some(names) => names.clone(),
            None => (0..width).map(|i| format!("col_{i}")).collect(),
        };
        let rows: Vec<Vec<CellValue>> = self
            .config
            .array_data
            .iter()
            .map(|row| {
                (0..names.len())
                    .map(|i| row.get(i).map(CellValue::from_json).unwrap_or(CellValue::Null))
                    .collect()
            })
            .collect();
        Table::from_rows(&names, rows)
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Config, e))
    }
}

#[async_trait]
impl FlowNode for StaticDataNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "static_data"
    }

    async fn invoke(
        &self,
        _inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = match self.config.source.as_str() {
            "text" => self.from_text()?,
            "json" => self.from_json()?,
            "array" => self.from_array()?,
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Config,
                    format!("unsupported data source: {other}"),
                ))
            }
        };
        Ok(FlowValue::Table(table))
    }
}

// ---------------------------------------------------------------------------
// webhook_listener
// ---------------------------------------------------------------------------

/// Tabulate the payload bound to the `webhook_data` input handle by the
/// enclosing dispatch; an absent payload yields an empty table.
pub struct WebhookListenerNode {
    id: String,
}

impl WebhookListenerNode {
    pub fn new(id: String) -> Self {
        Self { id }
    }
}

#[async_trait]
impl FlowNode for WebhookListenerNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "webhook_listener"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = match inputs.get("webhook_data") {
            Some(FlowValue::Json(value)) => Table::from_json_value(value),
            Some(FlowValue::Table(table)) => table.clone(),
            _ => Table::new(),
        };
        Ok(FlowValue::Table(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{ExecutionContext, UserContext};
    use crate::table::DataType;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "flow",
            "exec_test",
            UserContext::anonymous(),
            Map::new(),
            crate::engine::context::test_services(),
        )
    }

    #[tokio::test]
    async fn static_array_builds_typed_table() {
        let node = StaticDataNode::new(
            "src".into(),
            serde_json::from_value(json!({
                "source": "array",
                "array_data": [[1, "x"], [2, "y"]],
                "columns": ["id", "name"]
            }))
            .unwrap(),
        );
        let value = node.invoke(&InputMap::new(), &ctx()).await.unwrap();
        let table = value.as_table().unwrap();
        assert_eq!(table.shape(), [2, 2]);
        assert_eq!(table.column("id").unwrap().dtype(), DataType::Integer);
    }

    #[tokio::test]
    async fn static_text_parses_csv_with_types() {
        let node = StaticDataNode::new(
            "src".into(),
            serde_json::from_value(json!({
                "source": "text",
                "text_data": "id,score\n1,9.5\n2,"
            }))
            .unwrap(),
        );
        let value = node.invoke(&InputMap::new(), &ctx()).await.unwrap();
        let table = value.as_table().unwrap();
        assert_eq!(table.cell(0, "score"), Some(&CellValue::Float(9.5)));
        assert_eq!(table.cell(1, "score"), Some(&CellValue::Null));
    }

    #[tokio::test]
    async fn table_reader_checks_authorization() {
        let db = Arc::new(crate::backends::memory::MemoryDatabase::new());
        db.deny_read(None, "secrets");
        let context = ExecutionContext::new(
            "flow",
            "exec_test",
            UserContext::anonymous(),
            Map::new(),
            crate::engine::context::test_services_with_db(db),
        );
        let node = TableReaderNode::new(
            "reader".into(),
            serde_json::from_value(json!({"table": "secrets"})).unwrap(),
        );
        let err = node.invoke(&InputMap::new(), &context).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn file_input_reads_csv_and_rejects_parquet() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a,b\n1,x\n2,y").unwrap();
        let node = FileInputNode::new(
            "f".into(),
            serde_json::from_value(json!({
                "path": file.path().to_string_lossy(),
                "format": "csv"
            }))
            .unwrap(),
        );
        let value = node.invoke(&InputMap::new(), &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 2);

        let node = FileInputNode::new(
            "f".into(),
            serde_json::from_value(json!({
                "path": file.path().to_string_lossy(),
                "format": "parquet"
            }))
            .unwrap(),
        );
        let err = node.invoke(&InputMap::new(), &ctx()).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn webhook_listener_tabulates_payload_shapes() {
        let node = WebhookListenerNode::new("hook".into());

        let mut inputs = InputMap::new();
        inputs.insert(
            "webhook_data",
            FlowValue::Json(json!([{"event": "created"}, {"event": "updated"}])),
        );
        let value = node.invoke(&inputs, &ctx()).await.unwrap();
        assert_eq!(value.as_table().unwrap().row_count(), 2);

        let empty = node.invoke(&InputMap::new(), &ctx()).await.unwrap();
        assert_eq!(empty.as_table().unwrap().row_count(), 0);
    }
}
