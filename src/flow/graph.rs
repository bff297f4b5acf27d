// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Flow graph validation and topological scheduling.
//!
//! [`FlowGraph::build`] checks the structural rules (non-empty node set,
//! unique non-empty ids, resolvable edge endpoints, no duplicate edges, no
//! self-loops) and compiles the definition into an arena of integer
//! indices. [`FlowGraph::topological_order`] runs Kahn's algorithm with a
//! declaration-order tie-break, so the same definition always schedules the
//! same way; on a cyclic graph it extracts one concrete cycle path with a
//! DFS over the residual nodes. [`FlowGraph::execution_levels`] groups the
//! order into parallel cohorts for diagnostics.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::ValidationError;
use crate::flow::FlowDefinition;

/// One incoming edge, as seen from its target.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRef {
    pub source: usize,
    pub source_handle: Option<String>,
    pub target_handle: Option<String>,
}

/// Index-based view of a validated flow definition.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    successors: Vec<Vec<usize>>,
    incoming: Vec<Vec<EdgeRef>>,
}

impl FlowGraph {
    /// Validate the definition's structure and build the arena.
    ///
    /// # Errors
    /// - [`ValidationError::EmptyFlow`] for a flow with no nodes.
    /// - [`ValidationError::EmptyNodeId`] / [`ValidationError::DuplicateNodeId`]
    ///   for unusable identifiers.
    /// - [`ValidationError::UnknownEdgeEndpoint`] if an edge references a
    ///   node outside the flow.
    /// - [`ValidationError::DuplicateEdge`] for a repeated
    ///   `(source, handle) -> (target, handle)` link.
    /// - [`ValidationError::SelfLoop`] for an edge from a node to itself.
    pub fn build(definition: &FlowDefinition) -> Result<FlowGraph, ValidationError> {
        if definition.nodes.is_empty() {
            return Err(ValidationError::EmptyFlow);
        }

        let mut ids = Vec::with_capacity(definition.nodes.len());
        let mut index = HashMap::with_capacity(definition.nodes.len());
        for (i, node) in definition.nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                return Err(ValidationError::EmptyNodeId { index: i });
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
            }
            ids.push(node.id.clone());
        }

        let mut successors = vec![Vec::new(); ids.len()];
        let mut incoming = vec![Vec::new(); ids.len()];
        let mut seen_edges = HashSet::new();

        for edge in &definition.edges {
            let source = *index.get(&edge.source).ok_or_else(|| {
                ValidationError::UnknownEdgeEndpoint {
                    node_id: edge.source.clone(),
                    side: "source",
                }
            })?;
            let target = *index.get(&edge.target).ok_or_else(|| {
                ValidationError::UnknownEdgeEndpoint {
                    node_id: edge.target.clone(),
                    side: "target",
                }
            })?;
            if source == target {
                return Err(ValidationError::SelfLoop {
                    node_id: edge.source.clone(),
                });
            }
            let key = (
                source,
                edge.source_handle.clone(),
                target,
                edge.target_handle.clone(),
            );
            if !seen_edges.insert(key) {
                return Err(ValidationError::DuplicateEdge {
                    from_node: edge.source.clone(),
                    target: edge.target.clone(),
                });
            }

            successors[source].push(target);
            incoming[target].push(EdgeRef {
                source,
                source_handle: edge.source_handle.clone(),
                target_handle: edge.target_handle.clone(),
            });
        }

        Ok(FlowGraph {
            ids,
            index,
            successors,
            incoming,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, node: usize) -> &str {
        &self.ids[node]
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn successors(&self, node: usize) -> &[usize] {
        &self.successors[node]
    }

    pub fn incoming(&self, node: usize) -> &[EdgeRef] {
        &self.incoming[node]
    }

    pub fn in_degree(&self, node: usize) -> usize {
        self.incoming[node].len()
    }

    /// Total execution order via Kahn's algorithm.
    ///
    /// The ready queue is seeded in declaration order and nodes released by
    /// the same pop are enqueued by declaration index, making the order
    /// deterministic for a given definition.
    pub fn topological_order(&self) -> Result<Vec<usize>, ValidationError> {
        let mut in_degree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            let mut released: Vec<usize> = Vec::new();
            for &next in &self.successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    released.push(next);
                }
            }
            released.sort_unstable();
            queue.extend(released);
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            let visited: HashSet<usize> = order.into_iter().collect();
            let remaining: Vec<usize> = (0..self.len()).filter(|n| !visited.contains(n)).collect();
            Err(ValidationError::CycleDetected {
                path: self.cycle_path(&remaining),
            })
        }
    }

    /// Parallel cohorts: each level holds the nodes whose inputs are all
    /// satisfied by earlier levels. Produced for diagnostics; the executor
    /// itself runs the total order sequentially.
    pub fn execution_levels(&self) -> Result<Vec<Vec<usize>>, ValidationError> {
        let mut in_degree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut remaining: HashSet<usize> = (0..self.len()).collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let mut level: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&n| in_degree[n] == 0)
                .collect();
            if level.is_empty() {
                let leftover: Vec<usize> = remaining.iter().copied().collect();
                return Err(ValidationError::CycleDetected {
                    path: self.cycle_path(&leftover),
                });
            }
            level.sort_unstable();
            for &node in &level {
                remaining.remove(&node);
                for &next in &self.successors[node] {
                    in_degree[next] -= 1;
                }
            }
            levels.push(level);
        }

        Ok(levels)
    }

    /// Extract one concrete cycle among the residual nodes, as node ids.
    fn cycle_path(&self, remaining: &[usize]) -> Vec<String> {
        let residual: HashSet<usize> = remaining.iter().copied().collect();
        let mut visited = HashSet::new();

        for &start in remaining {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if let Some(cycle) =
                self.cycle_dfs(start, &residual, &mut visited, &mut path, &mut on_path)
            {
                return cycle.into_iter().map(|n| self.ids[n].clone()).collect();
            }
        }

        // No back edge found among the residual nodes; report them as-is.
        remaining.iter().map(|&n| self.ids[n].clone()).collect()
    }

    fn cycle_dfs(
        &self,
        node: usize,
        residual: &HashSet<usize>,
        visited: &mut HashSet<usize>,
        path: &mut Vec<usize>,
        on_path: &mut HashSet<usize>,
    ) -> Option<Vec<usize>> {
        if on_path.contains(&node) {
            let start = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut cycle: Vec<usize> = path[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }

        path.push(node);
        on_path.insert(node);
        for &next in &self.successors[node] {
            if residual.contains(&next) {
                if let Some(cycle) = self.cycle_dfs(next, residual, visited, path, on_path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        on_path.remove(&node);
        None
    }
}
