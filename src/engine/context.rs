// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Per-invocation execution state.
//!
//! An [`ExecutionContext`] is created when an executor's `invoke` starts and
//! dropped when it finishes; cached executors never hold one. It carries the
//! request-scoped collaborators (database handle, HTTP client, mailer), the
//! global variable map, every node's recorded output, and an ordered
//! execution log.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::backends::{DatabaseHandle, Mailer, UserIdentity};
use crate::nodes::FlowValue;

/// Request-scoped collaborators handed to nodes.
///
/// The database handle is supplied per request and never cached inside
/// executors; the HTTP client is a cheap clone of the process-wide client.
#[derive(Clone)]
pub struct Services {
    pub db: Arc<dyn DatabaseHandle>,
    pub http: reqwest::Client,
    pub mailer: Arc<dyn Mailer>,
}

/// Who triggered this invocation, as seen by authorization checks and logs.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
    pub identity: Option<UserIdentity>,
}

impl UserContext {
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// An anonymous context for direct invocations and tests.
    pub fn anonymous() -> UserContext {
        UserContext {
            request_id: format!("req_{}", Uuid::new_v4()),
            timestamp: Utc::now(),
            client_ip: "unknown".to_string(),
            user_agent: "unknown".to_string(),
            identity: None,
        }
    }

    /// JSON rendering matching the dispatch contract.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("request_id".into(), Value::String(self.request_id.clone()));
        map.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        map.insert("client_ip".into(), Value::String(self.client_ip.clone()));
        map.insert("user_agent".into(), Value::String(self.user_agent.clone()));
        if let Some(identity) = &self.identity {
            map.insert("user_id".into(), Value::String(identity.user_id.clone()));
            map.insert("username".into(), Value::String(identity.username.clone()));
            if let Some(workspace) = &identity.workspace_id {
                map.insert("workspace_id".into(), Value::String(workspace.clone()));
            }
            map.insert("is_authenticated".into(), Value::Bool(true));
        } else {
            map.insert("is_authenticated".into(), Value::Bool(false));
        }
        map
    }
}

/// One record in the ordered execution log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub node_id: String,
    pub output_kind: &'static str,
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

/// State for exactly one flow invocation.
pub struct ExecutionContext {
    pub flow_id: String,
    pub execution_id: String,
    pub user: UserContext,
    pub globals: Map<String, Value>,
    pub services: Services,
    pub started_at: DateTime<Utc>,
    node_outputs: HashMap<String, FlowValue>,
    log: Vec<LogEntry>,
}

impl ExecutionContext {
    pub fn new(
        flow_id: impl Into<String>,
        execution_id: impl Into<String>,
        user: UserContext,
        globals: Map<String, Value>,
        services: Services,
    ) -> ExecutionContext {
        ExecutionContext {
            flow_id: flow_id.into(),
            execution_id: execution_id.into(),
            user,
            globals,
            services,
            started_at: Utc::now(),
            node_outputs: HashMap::new(),
            log: Vec::new(),
        }
    }

    /// Record a node's output. Each node writes exactly once per invocation.
    pub fn record_output(&mut self, node_id: &str, value: FlowValue, execution_time: f64) {
        debug_assert!(
            !self.node_outputs.contains_key(node_id),
            "node '{node_id}' recorded twice"
        );
        self.log.push(LogEntry {
            node_id: node_id.to_string(),
            output_kind: value.kind(),
            execution_time,
            timestamp: Utc::now(),
        });
        self.node_outputs.insert(node_id.to_string(), value);
    }

    pub fn output(&self, node_id: &str) -> Option<&FlowValue> {
        self.node_outputs.get(node_id)
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }
}

/// Services wired to the in-memory backends, for tests.
#[cfg(test)]
pub(crate) fn test_services() -> Services {
    use crate::backends::memory::{MemoryDatabase, MemoryMailer};
    Services {
        db: Arc::new(MemoryDatabase::new()),
        http: reqwest::Client::new(),
        mailer: Arc::new(MemoryMailer::new()),
    }
}

/// Services wired to a specific database handle, for tests.
#[cfg(test)]
pub(crate) fn test_services_with_db(db: Arc<dyn DatabaseHandle>) -> Services {
    use crate::backends::memory::MemoryMailer;
    Services {
        db,
        http: reqwest::Client::new(),
        mailer: Arc::new(MemoryMailer::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_are_recorded_once_with_log_entries() {
        let mut ctx = ExecutionContext::new(
            "flow",
            "exec_1",
            UserContext::anonymous(),
            Map::new(),
            test_services(),
        );
        ctx.record_output("a", FlowValue::Bool(true), 0.1);
        assert!(matches!(ctx.output("a"), Some(FlowValue::Bool(true))));
        assert_eq!(ctx.log().len(), 1);
        assert_eq!(ctx.log()[0].output_kind, "bool");
    }

    #[test]
    fn anonymous_user_context_serializes_unauthenticated() {
        let user = UserContext::anonymous();
        let json = user.to_json();
        assert_eq!(json["is_authenticated"], Value::Bool(false));
        assert!(json.get("user_id").is_none());
    }
}
