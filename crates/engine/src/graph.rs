//! Graph construction and ordering. Build this before executing a workflow.
//!
//! Rules enforced by [`Graph::build`]:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every edge must reference valid node IDs (both `source` and `target`).
//! 3. Every node must convert into a [`Node`] (known type, valid action payload).
//!
//! Acyclicity is checked separately by [`Graph::detect_cycle`], because a
//! cyclic graph is an early exit for the orchestrator rather than a failed run.

use std::collections::{HashMap, VecDeque};

use crate::models::WorkflowDefinition;
use crate::node::Node;
use crate::EngineError;

/// Adjacency, in-degree and node lookup for one workflow definition.
///
/// Nodes keep their definition order; all internal tables index into it.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    adjacency: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl Graph {
    /// Build the graph tables from a definition in O(nodes + edges).
    ///
    /// # Errors
    /// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
    /// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
    /// - [`EngineError::UnknownNodeType`] / [`EngineError::InvalidNode`] if a
    ///   node does not validate.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, EngineError> {
        // -------------------------------------------------------------------
        // 1. Ensure node IDs are unique
        // -------------------------------------------------------------------
        let mut index: HashMap<String, usize> = HashMap::with_capacity(definition.nodes.len());
        for (i, node) in definition.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(EngineError::DuplicateNodeId(node.id.clone()));
            }
        }

        // -------------------------------------------------------------------
        // 2. Validate edge endpoints and fill adjacency
        // -------------------------------------------------------------------
        let n = definition.nodes.len();
        let mut adjacency = vec![Vec::new(); n];
        let mut predecessors = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for edge in &definition.edges {
            let Some(&from) = index.get(&edge.source) else {
                return Err(EngineError::UnknownNodeReference {
                    node_id: edge.source.clone(),
                    side: "source",
                });
            };
            let Some(&to) = index.get(&edge.target) else {
                return Err(EngineError::UnknownNodeReference {
                    node_id: edge.target.clone(),
                    side: "target",
                });
            };
            adjacency[from].push(to);
            predecessors[to].push(from);
            in_degree[to] += 1;
        }

        // -------------------------------------------------------------------
        // 3. Close the node shapes
        // -------------------------------------------------------------------
        let nodes = definition
            .nodes
            .iter()
            .map(Node::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            nodes,
            index,
            adjacency,
            predecessors,
            in_degree,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Direct predecessors of `id`, one entry per incoming edge.
    pub fn predecessors(&self, id: &str) -> Vec<&str> {
        match self.index.get(id) {
            Some(&i) => self.predecessors[i]
                .iter()
                .map(|&p| self.nodes[p].id.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// True when some node is unreachable by Kahn's walk, i.e. sits on or
    /// behind a cycle.
    pub fn detect_cycle(&self) -> bool {
        self.kahn().len() < self.nodes.len()
    }

    /// Topological order of node IDs.
    ///
    /// Nodes that become ready together run in the order they entered the
    /// ready queue, which is seeded in definition order. On a cyclic graph
    /// the result is shorter than [`Graph::len`].
    pub fn order(&self) -> Vec<String> {
        self.kahn()
            .into_iter()
            .map(|i| self.nodes[i].id.clone())
            .collect()
    }

    // Works on a copy of the in-degree table so the graph stays reusable.
    fn kahn(&self) -> Vec<usize> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut visited = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            visited.push(i);
            for &next in &self.adjacency[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        visited
    }
}

/// Validate a workflow definition and return its execution order.
///
/// # Errors
/// Everything [`Graph::build`] rejects, plus [`EngineError::CycleDetected`].
pub fn validate_dag(definition: &WorkflowDefinition) -> Result<Vec<String>, EngineError> {
    let graph = Graph::build(definition)?;
    if graph.detect_cycle() {
        return Err(EngineError::CycleDetected);
    }
    Ok(graph.order())
}
