// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Flow executor: compile a validated definition once, run it per request.
//!
//! # Construction
//!
//! `FlowExecutor::new` builds the graph arena, computes the topological
//! order and level cohorts, instantiates every node through the registry,
//! and precomputes try/catch protection scopes. Any validation failure
//! aborts construction; a constructed executor never fails structurally at
//! invoke time. Executors are immutable after construction and carry no
//! per-request state, so a cached instance services any number of
//! concurrent invocations.
//!
//! # Invocation
//!
//! `invoke` walks the topological order on one logical task. For each node
//! it resolves the live incoming edges, routes upstream outputs into the
//! input map under `sourceHandle` / `targetHandle` / source-id keys (in
//! that precedence), merges global variables without overwriting
//! handle-bound keys, and records the output exactly once.
//!
//! Branch gating: an incoming edge from a `conditional_branch` whose
//! `true`/`false` handle disagrees with the emitted boolean is dead. A node
//! is suppressed when every gating edge pointed at it is dead, or when all
//! of its incoming edges are dead; a suppressed node is skipped, its output
//! registers as null, and downstream nodes treat it as absent.
//!
//! Failure handling: when a node raises and a try/catch scope covers it,
//! the configured fallback table is recorded as the failing node's output
//! and execution continues; otherwise the invocation aborts with the first
//! failure. Scopes are bounded by the nearest `merge` or terminus on both
//! sides of the guard.

use std::collections::HashSet;
use std::time::Instant;

use serde_json::{json, Map, Value};

use crate::engine::context::{ExecutionContext, Services, UserContext};
use crate::errors::{FlowError, ValidationError};
use crate::flow::graph::FlowGraph;
use crate::flow::{FlowDefinition, NodeSpec};
use crate::nodes::control::TryCatchConfig;
use crate::nodes::{registry, FlowNode, FlowValue, InputMap};
use crate::observability::messages::engine::{
    FlowExecutionCompleted, FlowExecutionStarted, NodeFailedWithFallback, NodeSuppressed,
};
use crate::observability::messages::StructuredLog;

/// One invocation's request-scoped arguments.
pub struct Invocation {
    pub input_data: Map<String, Value>,
    pub execution_id: String,
    pub user: UserContext,
    pub services: Services,
}

/// The final value of an invocation: a single value, or one value per
/// terminal node when several distinct terminals produced output.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowResult {
    Value(FlowValue),
    Many(Vec<(String, FlowValue)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRole {
    Data,
    Utility,
    Conditional,
    TryCatch,
    Merge,
}

struct GuardScope {
    config: TryCatchConfig,
    members: HashSet<usize>,
}

/// Compiled, reusable runtime object for one flow.
pub struct FlowExecutor {
    flow_id: String,
    specs: Vec<NodeSpec>,
    edge_count: usize,
    graph: FlowGraph,
    order: Vec<usize>,
    levels: Vec<Vec<usize>>,
    nodes: Vec<Option<std::sync::Arc<dyn FlowNode>>>,
    roles: Vec<NodeRole>,
    guards: Vec<GuardScope>,
}

impl FlowExecutor {
    /// Compile a flow definition. Fails on any validation error, including
    /// unknown node types and unusable configs.
    pub fn new(definition: &FlowDefinition) -> Result<FlowExecutor, ValidationError> {
        let graph = FlowGraph::build(definition)?;
        let order = graph.topological_order()?;
        let levels = graph.execution_levels()?;

        let mut roles = Vec::with_capacity(definition.nodes.len());
        let mut nodes = Vec::with_capacity(definition.nodes.len());
        for spec in &definition.nodes {
            let role = match spec.node_type.as_str() {
                t if registry::is_utility(t) => NodeRole::Utility,
                "conditional_branch" => NodeRole::Conditional,
                "try_catch" => NodeRole::TryCatch,
                "merge" => NodeRole::Merge,
                _ => NodeRole::Data,
            };
            roles.push(role);
            nodes.push(match role {
                NodeRole::Utility => None,
                _ => Some(registry::build_node(spec)?),
            });
        }

        let guards = Self::build_guards(definition, &graph, &roles)?;

        tracing::info!(
            flow_id = definition.id.as_deref().unwrap_or("unknown"),
            nodes = definition.nodes.len(),
            edges = definition.edges.len(),
            "flow executor compiled"
        );

        Ok(FlowExecutor {
            flow_id: definition.id.clone().unwrap_or_else(|| "unknown".to_string()),
            specs: definition.nodes.clone(),
            edge_count: definition.edges.len(),
            graph,
            order,
            levels,
            nodes,
            roles,
            guards,
        })
    }

    /// Protection scope per try/catch: the nodes reachable from the guard
    /// and the upstream chain feeding it, bounded by `merge` nodes on both
    /// sides. The first declared guard covering a failing node wins.
    fn build_guards(
        definition: &FlowDefinition,
        graph: &FlowGraph,
        roles: &[NodeRole],
    ) -> Result<Vec<GuardScope>, ValidationError> {
        let mut guards = Vec::new();
        for (i, spec) in definition.nodes.iter().enumerate() {
            if roles[i] != NodeRole::TryCatch {
                continue;
            }
            let config: TryCatchConfig =
                serde_json::from_value(Value::Object(spec.config.clone())).map_err(|e| {
                    ValidationError::InvalidNodeConfig {
                        node_id: spec.id.clone(),
                        reason: e.to_string(),
                    }
                })?;

            let mut members = HashSet::new();
            // Downstream until merge or terminus.
            let mut stack: Vec<usize> = graph.successors(i).to_vec();
            while let Some(node) = stack.pop() {
                if roles[node] == NodeRole::Merge || !members.insert(node) {
                    continue;
                }
                stack.extend(graph.successors(node));
            }
            // Upstream producers feeding the guard, same bound.
            let mut stack: Vec<usize> = graph.incoming(i).iter().map(|e| e.source).collect();
            while let Some(node) = stack.pop() {
                if roles[node] == NodeRole::Merge || !members.insert(node) {
                    continue;
                }
                stack.extend(graph.incoming(node).iter().map(|e| e.source));
            }
            members.remove(&i);
            guards.push(GuardScope { config, members });
        }
        Ok(guards)
    }

    /// Drive the flow to completion for one request.
    pub async fn invoke(&self, invocation: Invocation) -> Result<FlowResult, FlowError> {
        let Invocation {
            input_data,
            execution_id,
            user,
            services,
        } = invocation;

        let globals = self.seed_globals(input_data);
        let mut ctx = ExecutionContext::new(
            self.flow_id.clone(),
            execution_id,
            user,
            globals,
            services,
        );
        let mut suppressed = vec![false; self.graph.len()];

        FlowExecutionStarted {
            flow_id: &ctx.flow_id,
            execution_id: &ctx.execution_id,
            node_count: self.graph.len(),
        }
        .log();
        let started = Instant::now();

        for &node_index in &self.order {
            if self.roles[node_index] == NodeRole::Utility {
                continue;
            }
            let node_id = self.graph.id(node_index).to_string();

            // Classify incoming edges. An edge is dead when its source was
            // suppressed, or when it is a true/false handle off a
            // conditional branch that decided the other way. A node whose
            // gating edges all decided against it is suppressed even if a
            // plain data edge is still live.
            let incoming = self.graph.incoming(node_index);
            let mut live = Vec::with_capacity(incoming.len());
            let mut gate_count = 0usize;
            let mut live_gate_count = 0usize;
            for edge in incoming {
                let is_gate = self.roles[edge.source] == NodeRole::Conditional
                    && matches!(edge.source_handle.as_deref(), Some("true") | Some("false"));
                if is_gate {
                    gate_count += 1;
                }
                if suppressed[edge.source] {
                    continue;
                }
                if is_gate {
                    let handle = edge.source_handle.as_deref().unwrap_or_default();
                    let branch = matches!(
                        ctx.output(self.graph.id(edge.source)),
                        Some(FlowValue::Bool(true))
                    );
                    if (handle == "true") != branch {
                        continue;
                    }
                    live_gate_count += 1;
                }
                live.push(edge);
            }
            let gated_off = gate_count > 0 && live_gate_count == 0;

            if gated_off || (!incoming.is_empty() && live.is_empty()) {
                suppressed[node_index] = true;
                NodeSuppressed {
                    node_id: &node_id,
                    execution_id: &ctx.execution_id,
                }
                .log();
                ctx.record_output(&node_id, FlowValue::Null, 0.0);
                continue;
            }

            // Handle precedence: sourceHandle, then targetHandle, then the
            // source node id.
            let mut inputs = InputMap::new();
            for edge in &live {
                let source_id = self.graph.id(edge.source);
                let Some(output) = ctx.output(source_id) else {
                    continue;
                };
                if output.is_null() {
                    continue;
                }
                let key = edge
                    .source_handle
                    .clone()
                    .or_else(|| edge.target_handle.clone())
                    .unwrap_or_else(|| source_id.to_string());
                inputs.insert(key, output.clone());
            }
            for (key, value) in &ctx.globals {
                inputs.insert(key.clone(), FlowValue::Json(value.clone()));
            }

            let node = self.nodes[node_index]
                .as_ref()
                .expect("non-utility nodes are instantiated at construction");
            let node_started = Instant::now();
            let outcome = node.invoke(&inputs, &ctx).await;
            let elapsed = node_started.elapsed().as_secs_f64();

            match outcome {
                Ok(value) => {
                    tracing::debug!(
                        node_id = %node_id,
                        execution_id = %ctx.execution_id,
                        kind = value.kind(),
                        elapsed,
                        "node executed"
                    );
                    ctx.record_output(&node_id, value, elapsed);
                }
                Err(error) => {
                    let guard = self
                        .guards
                        .iter()
                        .find(|guard| guard.members.contains(&node_index));
                    match guard {
                        Some(guard) => {
                            let fallback = guard
                                .config
                                .fallback(inputs.first_table())
                                .map_err(|reason| {
                                    crate::errors::NodeError::new(
                                        &node_id,
                                        crate::errors::NodeErrorKind::Config,
                                        reason,
                                    )
                                })?;
                            NodeFailedWithFallback {
                                node_id: &node_id,
                                execution_id: &ctx.execution_id,
                                error: &error,
                                fallback_rows: fallback.row_count(),
                            }
                            .log();
                            ctx.record_output(&node_id, FlowValue::Table(fallback), elapsed);
                        }
                        None => {
                            tracing::error!(
                                node_id = %node_id,
                                execution_id = %ctx.execution_id,
                                error = %error,
                                elapsed,
                                "node failed"
                            );
                            return Err(FlowError::Node(error));
                        }
                    }
                }
            }
        }

        let result = self.final_result(&ctx, &suppressed);
        FlowExecutionCompleted {
            flow_id: &ctx.flow_id,
            execution_id: &ctx.execution_id,
            nodes_executed: ctx.log().len(),
            elapsed: started.elapsed().as_secs_f64(),
        }
        .log();
        Ok(result)
    }

    /// Seed global variables: request inputs first, then utility nodes in
    /// declaration order. `trigger` data and `set_get_variable` overwrite;
    /// `flow_parameter` only fills gaps.
    fn seed_globals(&self, input_data: Map<String, Value>) -> Map<String, Value> {
        let mut globals = input_data;
        for spec in &self.specs {
            match spec.node_type.as_str() {
                "trigger" => {
                    if let Some(Value::Object(data)) = spec.config.get("trigger_data") {
                        for (key, value) in data {
                            globals.insert(key.clone(), value.clone());
                        }
                    }
                }
                "flow_parameter" => {
                    if let Some(name) = spec.config.get("parameter_name").and_then(Value::as_str) {
                        let default = spec
                            .config
                            .get("default_value")
                            .cloned()
                            .unwrap_or(Value::Null);
                        globals.entry(name.to_string()).or_insert(default);
                    }
                }
                "set_get_variable" => {
                    if let Some(name) = spec.config.get("variable_name").and_then(Value::as_str) {
                        if let Some(value) = spec.config.get("variable_value") {
                            if !value.is_null() {
                                globals.insert(name.to_string(), value.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        globals
    }

    /// Pick the invocation's final value from the recorded outputs.
    fn final_result(&self, ctx: &ExecutionContext, suppressed: &[bool]) -> FlowResult {
        let terminals: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&n| {
                self.roles[n] != NodeRole::Utility
                    && self.graph.successors(n).is_empty()
                    && !suppressed[n]
            })
            .collect();

        let terminal_values: Vec<(String, FlowValue)> = terminals
            .iter()
            .filter_map(|&n| {
                let id = self.graph.id(n);
                ctx.output(id)
                    .filter(|v| !v.is_null())
                    .map(|v| (id.to_string(), v.clone()))
            })
            .collect();

        match terminal_values.len() {
            1 => FlowResult::Value(terminal_values.into_iter().next().unwrap().1),
            0 => {
                // Nothing terminal produced a value; fall back to the last
                // executed node.
                let last = self
                    .order
                    .iter()
                    .rev()
                    .find(|&&n| self.roles[n] != NodeRole::Utility && !suppressed[n])
                    .map(|&n| self.graph.id(n));
                match last.and_then(|id| ctx.output(id)) {
                    Some(value) => FlowResult::Value(value.clone()),
                    None => FlowResult::Value(FlowValue::Null),
                }
            }
            _ => {
                // Prefer the last display node, then a unanimous value,
                // otherwise report every terminal.
                let last_display = self
                    .order
                    .iter()
                    .rev()
                    .find(|&&n| {
                        self.specs[n].node_type == "display_results" && !suppressed[n]
                    })
                    .and_then(|&n| ctx.output(self.graph.id(n)))
                    .filter(|v| !v.is_null());
                if let Some(value) = last_display {
                    return FlowResult::Value(value.clone());
                }
                let first = &terminal_values[0].1;
                if terminal_values.iter().all(|(_, v)| v == first) {
                    return FlowResult::Value(first.clone());
                }
                FlowResult::Many(terminal_values)
            }
        }
    }

    /// Flow metadata surfaced by the worker stats endpoint.
    pub fn flow_info(&self) -> Value {
        let order_ids: Vec<&str> = self.order.iter().map(|&n| self.graph.id(n)).collect();
        let entry_nodes: Vec<&str> = self
            .order
            .iter()
            .copied()
            .filter(|&n| self.graph.in_degree(n) == 0)
            .map(|n| self.graph.id(n))
            .collect();
        let terminal_nodes: Vec<&str> = self
            .order
            .iter()
            .copied()
            .filter(|&n| self.graph.successors(n).is_empty())
            .map(|n| self.graph.id(n))
            .collect();
        let levels: Vec<Vec<&str>> = self
            .levels
            .iter()
            .map(|level| level.iter().map(|&n| self.graph.id(n)).collect())
            .collect();
        json!({
            "flow_id": self.flow_id,
            "node_count": self.specs.len(),
            "edge_count": self.edge_count,
            "execution_order": order_ids,
            "entry_nodes": entry_nodes,
            "output_nodes": terminal_nodes,
            "levels": levels,
        })
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }
}
