// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Sink nodes: observable side effects.
//!
//! Every sink returns its input table unchanged so pipelines can continue
//! past it. Side effects that already happened are not rolled back when a
//! later node fails; operators are expected to know this.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{FlowNode, FlowValue, InputMap};
use crate::backends::{EmailMessage, WriteMode};
use crate::engine::context::ExecutionContext;
use crate::errors::{NodeError, NodeErrorKind};
use crate::table::Table;

// ---------------------------------------------------------------------------
// table_writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TableWriterConfig {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_if_exists")]
    pub if_exists: String,
}

fn default_if_exists() -> String {
    "append".to_string()
}

/// Write the input table to the database. Checks write authorization first.
pub struct TableWriterNode {
    id: String,
    config: TableWriterConfig,
}

impl TableWriterNode {
    pub fn new(id: String, config: TableWriterConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for TableWriterNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "table_writer"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let mode = WriteMode::parse(&self.config.if_exists).ok_or_else(|| {
            NodeError::new(
                &self.id,
                NodeErrorKind::Config,
                format!("unknown if_exists policy '{}'", self.config.if_exists),
            )
        })?;

        let user = ctx.user.identity.as_ref();
        let allowed = ctx
            .services
            .db
            .can_write(user, self.config.schema.as_deref(), &self.config.table)
            .await;
        if !allowed {
            return Err(NodeError::new(
                &self.id,
                NodeErrorKind::PermissionDenied,
                format!("write access denied for table '{}'", self.config.table),
            ));
        }

        let written = ctx
            .services
            .db
            .write_table(self.config.schema.as_deref(), &self.config.table, mode, table)
            .await
            .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Database, e.to_string()))?;
        tracing::info!(node_id = %self.id, rows = written, table = %self.config.table, "table write complete");
        Ok(FlowValue::Table(table.clone()))
    }
}

// ---------------------------------------------------------------------------
// file_writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FileWriterConfig {
    pub path: String,
    #[serde(default = "default_csv")]
    pub format: String,
}

fn default_csv() -> String {
    "csv".to_string()
}

/// Render a table as CSV bytes with a header row.
fn table_to_csv(node_id: &str, table: &Table) -> Result<Vec<u8>, NodeError> {
    let io_err = |e: String| NodeError::new(node_id, NodeErrorKind::Io, e);
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(table.column_names())
        .map_err(|e| io_err(e.to_string()))?;
    for row in 0..table.row_count() {
        let record: Vec<String> = table
            .row(row)
            .into_iter()
            .map(|(_, cell)| if cell.is_null() { String::new() } else { cell.render() })
            .collect();
        writer
            .write_record(&record)
            .map_err(|e| io_err(e.to_string()))?;
    }
    writer.into_inner().map_err(|e| io_err(e.to_string()))
}

/// Write the input table to a local file as CSV or JSON records.
pub struct FileWriterNode {
    id: String,
    config: FileWriterConfig,
}

impl FileWriterNode {
    pub fn new(id: String, config: FileWriterConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for FileWriterNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "file_writer"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let bytes = match self.config.format.as_str() {
            "csv" => table_to_csv(&self.id, table)?,
            "json" => serde_json::to_vec_pretty(&table.to_json_records())
                .map_err(|e| NodeError::new(&self.id, NodeErrorKind::Io, e.to_string()))?,
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Unsupported,
                    format!("unsupported file format: {other}"),
                ))
            }
        };
        tokio::fs::write(&self.config.path, bytes).await.map_err(|e| {
            NodeError::new(
                &self.id,
                NodeErrorKind::Io,
                format!("cannot write '{}': {e}", self.config.path),
            )
        })?;
        tracing::info!(node_id = %self.id, rows = table.row_count(), path = %self.config.path, "file write complete");
        Ok(FlowValue::Table(table.clone()))
    }
}

// ---------------------------------------------------------------------------
// api_request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRequestConfig {
    pub url: String,
    #[serde(default = "default_post")]
    pub method: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_json_format")]
    pub data_format: String,
}

fn default_post() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_json_format() -> String {
    "json".to_string()
}

/// Send the input table to an HTTP endpoint as JSON records or CSV text.
pub struct ApiRequestNode {
    id: String,
    config: ApiRequestConfig,
}

impl ApiRequestNode {
    pub fn new(id: String, config: ApiRequestConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for ApiRequestNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "api_request"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        let http_err = |message: String| NodeError::new(&self.id, NodeErrorKind::Http, message);

        let method = match self.config.method.to_ascii_uppercase().as_str() {
            "POST" => reqwest::Method::POST,
            "PUT" => reqwest::Method::PUT,
            other => return Err(http_err(format!("unsupported HTTP method '{other}'"))),
        };

        let mut request = ctx
            .services
            .http
            .request(method, &self.config.url)
            .timeout(Duration::from_secs(self.config.timeout));
        for (name, value) in &self.config.headers {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            request = request.header(name, text);
        }

        request = match self.config.data_format.as_str() {
            "json" => request.json(&table.to_json_records()),
            "csv" => {
                let body = table_to_csv(&self.id, table)?;
                request.header("Content-Type", "text/csv").body(body)
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Unsupported,
                    format!("unsupported data format: {other}"),
                ))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| http_err(format!("request to {} failed: {e}", self.config.url)))?
            .error_for_status()
            .map_err(|e| http_err(e.to_string()))?;
        tracing::info!(
            node_id = %self.id,
            rows = table.row_count(),
            url = %self.config.url,
            status = response.status().as_u16(),
            "api request complete"
        );
        Ok(FlowValue::Table(table.clone()))
    }
}

// ---------------------------------------------------------------------------
// display_results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayResultsConfig {
    #[serde(default = "default_true")]
    pub show_summary: bool,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl Default for DisplayResultsConfig {
    fn default() -> Self {
        Self {
            show_summary: true,
            max_rows: default_max_rows(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_rows() -> usize {
    100
}

/// Log a structural summary of the table and mark the flow's terminal
/// output.
pub struct DisplayResultsNode {
    id: String,
    config: DisplayResultsConfig,
}

impl DisplayResultsNode {
    pub fn new(id: String, config: DisplayResultsConfig) -> Self {
        Self { id, config }
    }
}

#[async_trait]
impl FlowNode for DisplayResultsNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "display_results"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        _ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        if self.config.show_summary {
            tracing::info!(
                node_id = %self.id,
                rows = table.row_count(),
                columns = ?table.column_names(),
                "display results"
            );
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            let sample = table.row_count().min(self.config.max_rows);
            let records = table.to_json_records();
            tracing::debug!(node_id = %self.id, sample = ?&records[..sample], "sample rows");
        }
        Ok(FlowValue::Table(table.clone()))
    }
}

// ---------------------------------------------------------------------------
// send_notification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SendNotificationConfig {
    #[serde(default = "default_email")]
    pub channel: String,
    // email
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub to_emails: Vec<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    // webhook
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub include_sample_data: bool,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

fn default_email() -> String {
    "email".to_string()
}

fn default_subject() -> String {
    "Data Processing Notification".to_string()
}

fn default_sample_size() -> usize {
    5
}

/// Send a summary of the input table by email or webhook.
pub struct SendNotificationNode {
    id: String,
    config: SendNotificationConfig,
}

impl SendNotificationNode {
    pub fn new(id: String, config: SendNotificationConfig) -> Self {
        Self { id, config }
    }

    fn summary_payload(&self, table: &Table) -> Value {
        let mut payload = json!({
            "type": "data_processing_complete",
            "node_id": self.id,
            "data_summary": {
                "row_count": table.row_count(),
                "column_count": table.column_count(),
                "columns": table.column_names(),
                "data_types": Value::Object(table.dtypes()),
            }
        });
        if self.config.include_sample_data {
            let sample = table.row_count().min(self.config.sample_size);
            let rows: Vec<usize> = (0..sample).collect();
            payload["sample_data"] = Value::Array(
                table
                    .take_rows(&rows)
                    .to_json_records()
                    .into_iter()
                    .map(Value::Object)
                    .collect(),
            );
        }
        payload
    }
}

#[async_trait]
impl FlowNode for SendNotificationNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn node_type(&self) -> &'static str {
        "send_notification"
    }

    async fn invoke(
        &self,
        inputs: &InputMap,
        ctx: &ExecutionContext,
    ) -> Result<FlowValue, NodeError> {
        let table = inputs.require_table(&self.id)?;
        match self.config.channel.as_str() {
            "email" => {
                if self.config.to_emails.is_empty() {
                    return Err(NodeError::new(
                        &self.id,
                        NodeErrorKind::Config,
                        "email notifications require to_emails",
                    ));
                }
                let body = serde_json::to_string_pretty(&self.summary_payload(table))
                    .unwrap_or_default();
                let message = EmailMessage {
                    from: self
                        .config
                        .from_email
                        .clone()
                        .unwrap_or_else(|| "noreply@localhost".to_string()),
                    to: self.config.to_emails.clone(),
                    subject: self.config.subject.clone(),
                    body,
                };
                ctx.services.mailer.send(&message).await.map_err(|e| {
                    NodeError::new(&self.id, NodeErrorKind::Notification, e.to_string())
                })?;
                tracing::info!(node_id = %self.id, recipients = self.config.to_emails.len(), "email notification sent");
            }
            "webhook" => {
                let url = self.config.webhook_url.as_ref().ok_or_else(|| {
                    NodeError::new(
                        &self.id,
                        NodeErrorKind::Config,
                        "webhook notifications require webhook_url",
                    )
                })?;
                let mut request = ctx
                    .services
                    .http
                    .post(url)
                    .timeout(Duration::from_secs(self.config.timeout))
                    .json(&self.summary_payload(table));
                for (name, value) in &self.config.headers {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    request = request.header(name, text);
                }
                request
                    .send()
                    .await
                    .map_err(|e| {
                        NodeError::new(&self.id, NodeErrorKind::Notification, e.to_string())
                    })?
                    .error_for_status()
                    .map_err(|e| {
                        NodeError::new(&self.id, NodeErrorKind::Notification, e.to_string())
                    })?;
                tracing::info!(node_id = %self.id, url = %url, "webhook notification sent");
            }
            other => {
                return Err(NodeError::new(
                    &self.id,
                    NodeErrorKind::Unsupported,
                    format!("unsupported notification channel: {other}"),
                ))
            }
        }
        Ok(FlowValue::Table(table.clone()))
    }
}
