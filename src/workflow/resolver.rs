//! Dependency resolution over the workflow node graph.
//!
//! The graph is the union of explicit [`Edge`]s and each node's
//! `dependencies` list. Ordering uses Kahn's algorithm; any node left with
//! a non-zero in-degree after the queue drains sits on (or behind) a cycle.

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{Edge, Node, Workflow};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeOrigin {
    Edge,
    Dependency,
}

#[derive(Debug, Clone)]
struct GraphEdge {
    source: String,
    target: String,
    origin: EdgeOrigin,
}

/// Resolves execution order, layers and readiness for a node graph.
///
/// Holds its own copy of the node IDs and edges; the workflow it was built
/// from is never touched.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    /// Node IDs in declaration order (first occurrence wins)
    nodes: Vec<String>,
    known: HashSet<String>,
    duplicates: Vec<String>,
    empty_ids: Vec<usize>,
    edges: Vec<GraphEdge>,
}

impl DependencyResolver {
    /// Build a resolver from node and edge lists.
    pub fn new(nodes: &[Node], edges: &[Edge]) -> Self {
        let mut ordered = Vec::with_capacity(nodes.len());
        let mut known = HashSet::with_capacity(nodes.len());
        let mut duplicates = Vec::new();
        let mut empty_ids = Vec::new();

        for (position, node) in nodes.iter().enumerate() {
            if node.id.trim().is_empty() {
                empty_ids.push(position);
                continue;
            }
            if known.insert(node.id.clone()) {
                ordered.push(node.id.clone());
            } else {
                duplicates.push(node.id.clone());
            }
        }

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut graph_edges = Vec::new();
        let explicit = edges.iter().map(|e| {
            (
                e.source_node_id.clone(),
                e.target_node_id.clone(),
                EdgeOrigin::Edge,
            )
        });
        let declared = nodes.iter().flat_map(|n| {
            n.dependencies
                .iter()
                .map(move |dep| (dep.clone(), n.id.clone(), EdgeOrigin::Dependency))
        });
        for (source, target, origin) in explicit.chain(declared) {
            if seen.insert((source.clone(), target.clone())) {
                graph_edges.push(GraphEdge {
                    source,
                    target,
                    origin,
                });
            }
        }

        Self {
            nodes: ordered,
            known,
            duplicates,
            empty_ids,
            edges: graph_edges,
        }
    }

    /// Build a resolver for a workflow.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        Self::new(&workflow.nodes, &workflow.edges)
    }

    /// Number of distinct nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node IDs in declaration order.
    pub fn node_ids(&self) -> &[String] {
        &self.nodes
    }

    /// Adjacency list and in-degree map over edges whose endpoints both exist.
    fn build_graph(&self) -> (HashMap<&str, Vec<&str>>, HashMap<&str, usize>) {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.as_str(), 0)).collect();

        for edge in &self.edges {
            if !self.known.contains(&edge.source) || !self.known.contains(&edge.target) {
                continue;
            }
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
            if let Some(degree) = in_degree.get_mut(edge.target.as_str()) {
                *degree += 1;
            }
        }

        (adjacency, in_degree)
    }

    /// Topologically ordered node IDs (Kahn's algorithm).
    ///
    /// Fails with [`Error::CyclicGraph`] naming the nodes that could not be
    /// ordered; no partial order is returned.
    pub fn resolve_execution_order(&self) -> Result<Vec<String>> {
        let (adjacency, mut in_degree) = self.build_graph();

        let mut queue: VecDeque<&str> = self
            .nodes
            .iter()
            .map(|n| n.as_str())
            .filter(|n| in_degree.get(n) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(successors) = adjacency.get(id) {
                for &next in successors {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .filter(|n| in_degree.get(n.as_str()).copied().unwrap_or(0) > 0)
                .cloned()
                .collect();
            return Err(Error::CyclicGraph(stuck));
        }

        Ok(order)
    }

    fn ensure_known(&self, id: &str) -> Result<()> {
        if self.known.contains(id) {
            Ok(())
        } else {
            Err(Error::NodeNotFound(id.to_string()))
        }
    }

    /// Direct predecessors of `id`.
    pub fn node_dependencies(&self, id: &str) -> Result<Vec<String>> {
        self.ensure_known(id)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| e.target == id)
            .map(|e| e.source.clone())
            .collect())
    }

    /// Direct successors of `id`.
    pub fn node_dependents(&self, id: &str) -> Result<Vec<String>> {
        self.ensure_known(id)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| e.source == id)
            .map(|e| e.target.clone())
            .collect())
    }

    /// Every node reachable from `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &str) -> Result<Vec<String>> {
        self.ensure_known(id)?;
        let (adjacency, _) = self.build_graph();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        let mut reached = Vec::new();

        while let Some(current) = queue.pop_front() {
            for &next in adjacency.get(current).into_iter().flatten() {
                if next != id && visited.insert(next) {
                    reached.push(next.to_string());
                    queue.push_back(next);
                }
            }
        }

        Ok(reached)
    }

    /// Check the graph is well formed.
    ///
    /// Collects every problem found (empty or duplicate IDs, references to
    /// unknown nodes, cycles) into a single [`Error::WorkflowValidation`].
    pub fn validate_workflow(&self) -> Result<()> {
        let mut issues = Vec::new();

        for position in &self.empty_ids {
            issues.push(Error::InvalidReference(format!(
                "node at position {} has an empty id",
                position
            )));
        }

        for id in &self.duplicates {
            issues.push(Error::DuplicateNode(id.clone()));
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if self.known.contains(endpoint) {
                    continue;
                }
                let message = match edge.origin {
                    EdgeOrigin::Edge => format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, endpoint
                    ),
                    EdgeOrigin::Dependency => format!(
                        "node '{}' depends on unknown node '{}'",
                        edge.target, endpoint
                    ),
                };
                issues.push(Error::InvalidReference(message));
            }
        }

        if let Err(cycle) = self.resolve_execution_order() {
            issues.push(cycle);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::WorkflowValidation(issues))
        }
    }

    /// Group nodes by their longest distance from a start node.
    ///
    /// Levels are relaxed along the topological order, so each node lands one
    /// layer past its deepest predecessor. Layer contents are deterministic;
    /// IDs within a layer are sorted only for stable output.
    pub fn execution_layers(&self) -> Result<Vec<Vec<String>>> {
        let order = self.resolve_execution_order()?;
        let (adjacency, _) = self.build_graph();

        let mut levels: HashMap<&str, usize> = HashMap::with_capacity(order.len());
        for id in &order {
            let level = levels.get(id.as_str()).copied().unwrap_or(0);
            levels.entry(id.as_str()).or_insert(0);
            for &next in adjacency.get(id.as_str()).into_iter().flatten() {
                let candidate = level + 1;
                let entry = levels.entry(next).or_insert(candidate);
                if *entry < candidate {
                    *entry = candidate;
                }
            }
        }

        let depth = levels.values().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut layers: Vec<Vec<String>> = vec![Vec::new(); depth];
        for (id, level) in levels {
            layers[level].push(id.to_string());
        }
        for layer in &mut layers {
            layer.sort();
        }

        Ok(layers)
    }

    /// True iff every direct dependency of `id` is in `executed`.
    pub fn can_execute(&self, id: &str, executed: &HashSet<String>) -> Result<bool> {
        self.ensure_known(id)?;
        Ok(self
            .edges
            .iter()
            .filter(|e| e.target == id)
            .all(|e| executed.contains(&e.source)))
    }
}
