// src/flow/mod.rs
// Directed-graph execution of assistant agents
use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentError, AssistantAgent};
use crate::models::TextMessage;

pub const COMPLETED_STOP_REASON: &str = "Digraph execution is complete";

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node '{0}' is added more than once")]
    DuplicateNode(String),

    #[error("Edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("Edge {from} -> {to} is added more than once")]
    DuplicateEdge { from: String, to: String },

    #[error("Graph contains a cycle through: {0:?}")]
    Cycle(Vec<String>),

    #[error("Graph has no start node")]
    NoStartNode,

    #[error("Node '{node}' failed: {source}")]
    Agent {
        node: String,
        #[source]
        source: AgentError,
    },
}

/// Validated execution graph: node ids in insertion order plus the
/// successor lists and the topological levels derived from them.
#[derive(Debug, Clone)]
pub struct DiGraph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
    levels: Vec<Vec<String>>,
}

impl DiGraph {
    fn new(nodes: Vec<String>, edge_list: &[(String, String)]) -> Result<Self, FlowError> {
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();

        for (from, to) in edge_list {
            for end in [from, to] {
                if !in_degree.contains_key(end.as_str()) {
                    return Err(FlowError::UnknownNode(end.clone()));
                }
            }
            let successors = edges.entry(from.clone()).or_default();
            if successors.contains(to) {
                return Err(FlowError::DuplicateEdge {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            successors.push(to.clone());
            if let Some(degree) = in_degree.get_mut(to.as_str()) {
                *degree += 1;
            }
        }

        let mut current: Vec<String> = nodes
            .iter()
            .filter(|n| in_degree.get(n.as_str()) == Some(&0))
            .cloned()
            .collect();
        if current.is_empty() {
            return Err(FlowError::NoStartNode);
        }

        // Kahn's algorithm, one level at a time
        let mut levels = Vec::new();
        let mut placed = 0;
        while !current.is_empty() {
            let mut next = HashSet::new();
            for node in &current {
                for succ in edges.get(node).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(succ.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(succ.clone());
                        }
                    }
                }
            }
            placed += current.len();
            levels.push(current);
            current = nodes.iter().filter(|n| next.contains(*n)).cloned().collect();
        }

        if placed < nodes.len() {
            let stuck = nodes
                .iter()
                .filter(|n| in_degree.get(n.as_str()).copied().unwrap_or(0) > 0)
                .cloned()
                .collect();
            return Err(FlowError::Cycle(stuck));
        }

        Ok(Self { nodes, edges, levels })
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn successors(&self, node: &str) -> &[String] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn start_nodes(&self) -> &[String] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Groups of nodes that may run together, in execution order.
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }
}

/// Fluent builder; nodes are keyed by agent name.
#[derive(Default)]
pub struct DiGraphBuilder {
    agents: Vec<AssistantAgent>,
    edges: Vec<(String, String)>,
}

impl DiGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(mut self, agent: AssistantAgent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn add_edge(mut self, from: &str, to: &str) -> Self {
        self.edges.push((from.to_string(), to.to_string()));
        self
    }

    pub fn build(self) -> Result<GraphFlow, FlowError> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name().to_string()) {
                return Err(FlowError::DuplicateNode(agent.name().to_string()));
            }
        }

        let nodes = self.agents.iter().map(|a| a.name().to_string()).collect();
        let graph = DiGraph::new(nodes, &self.edges)?;
        tracing::info!(
            "✅ Graph built: {} nodes, {} levels",
            graph.nodes.len(),
            graph.levels.len()
        );

        let agents = self
            .agents
            .into_iter()
            .map(|agent| (agent.name().to_string(), agent))
            .collect();
        Ok(GraphFlow { graph, agents })
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub messages: Vec<TextMessage>,
    pub stop_reason: Option<String>,
}

pub struct GraphFlow {
    graph: DiGraph,
    agents: HashMap<String, AssistantAgent>,
}

impl GraphFlow {
    pub fn graph(&self) -> &DiGraph {
        &self.graph
    }

    pub async fn run(&mut self, task: &str) -> Result<TaskResult, FlowError> {
        self.run_with_cancellation(task, &CancellationToken::new()).await
    }

    /// Runs the graph level by level. Every node of a level runs
    /// concurrently and receives the task plus all earlier replies. Agents
    /// keep their context afterwards.
    pub async fn run_with_cancellation(
        &mut self,
        task: &str,
        cancellation: &CancellationToken,
    ) -> Result<TaskResult, FlowError> {
        let mut messages = vec![TextMessage::new("user", task)];

        for level in self.graph.levels.clone() {
            let inbound = messages.clone();

            let mut running = Vec::with_capacity(level.len());
            for node in &level {
                let mut agent = self
                    .agents
                    .remove(node)
                    .ok_or_else(|| FlowError::UnknownNode(node.clone()))?;
                let inbound = &inbound;
                running.push(async move {
                    let result = agent.on_messages(inbound, cancellation).await;
                    (agent, result)
                });
            }

            let mut failure = None;
            for (agent, result) in join_all(running).await {
                let node = agent.name().to_string();
                match result {
                    Ok(reply) => {
                        tracing::debug!("Node {} produced {} chars", node, reply.content.len());
                        messages.push(reply);
                    }
                    Err(source) => {
                        tracing::error!("Node {} failed: {}", node, source);
                        failure.get_or_insert(FlowError::Agent { node: node.clone(), source });
                    }
                }
                self.agents.insert(node, agent);
            }

            if let Some(err) = failure {
                return Err(err);
            }
        }

        Ok(TaskResult {
            messages,
            stop_reason: Some(COMPLETED_STOP_REASON.to_string()),
        })
    }
}
