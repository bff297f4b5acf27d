// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Collaborator interfaces consumed by the core.
//!
//! The execution subsystem owns no persistence and no identity: it reads
//! published-API records, checks authorization, and performs database and
//! notification I/O exclusively through the traits in this module. The
//! in-memory implementations in [`memory`] back the test suite and the demo
//! server; production deployments supply their own.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::flow::FlowDefinition;
use crate::table::Table;

/// A published flow addressable by external clients. Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedApi {
    pub id: String,
    pub endpoint_path: String,
    pub version: i64,
    pub is_active: bool,
    pub api_name: String,
    pub flow_definition: FlowDefinition,
}

/// An authenticated identity attached to a dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// Failures reported by collaborator backends.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Write disposition for `table_writer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Append,
    Replace,
    Fail,
}

impl WriteMode {
    pub fn parse(name: &str) -> Option<WriteMode> {
        match name {
            "append" => Some(WriteMode::Append),
            "replace" => Some(WriteMode::Replace),
            "fail" => Some(WriteMode::Fail),
            _ => None,
        }
    }
}

/// Lookup of published-API records by endpoint path.
#[async_trait]
pub trait PublishedApiStore: Send + Sync {
    async fn find_by_path(&self, path: &str) -> Option<PublishedApi>;
}

/// Optional request authentication.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolve a bearer token to an identity, if it is known.
    async fn identify(&self, bearer_token: Option<&str>) -> Option<UserIdentity>;
}

/// Request-scoped database access used by SQL, reader and writer nodes.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    /// Whether the given identity may read the table.
    async fn can_read(&self, user: Option<&UserIdentity>, schema: Option<&str>, table: &str)
        -> bool;

    /// Whether the given identity may write the table.
    async fn can_write(
        &self,
        user: Option<&UserIdentity>,
        schema: Option<&str>,
        table: &str,
    ) -> bool;

    /// Run a parameterized read-only statement.
    async fn query(&self, sql: &str, params: &Map<String, Value>) -> Result<Table, BackendError>;

    /// Write a table, returning the number of rows written.
    async fn write_table(
        &self,
        schema: Option<&str>,
        table: &str,
        mode: WriteMode,
        data: &Table,
    ) -> Result<u64, BackendError>;
}

/// Outbound email used by `send_notification`.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), BackendError>;
}

/// One email notification.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}
