//! Validated, indexed view of a workflow.
//!
//! A `WorkflowGraph` is built once when a workflow enters the catalog. Node
//! settings are parsed into `NodeSpec`s, adjacency and inbound edge counts are
//! indexed, and every node's `step_order` (shortest edge distance from any
//! trigger, breadth-first over the static graph) is precomputed. Step order
//! never depends on how runs actually traverse the graph.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Result, VisitflowError};
use crate::settings::{action_frequency, ActionFrequency, NodeSpec};
use crate::types::{Edge, Node, NodeKind, Workflow, WorkflowStatus};

#[derive(Debug)]
pub struct WorkflowGraph {
    workflow: Workflow,
    index: HashMap<String, usize>,
    specs: Vec<NodeSpec>,
    outgoing: HashMap<String, Vec<usize>>,
    inbound: HashMap<String, usize>,
    step_order: HashMap<String, u32>,
}

impl WorkflowGraph {
    /// Validate a workflow and build its indexes.
    pub fn new(workflow: Workflow) -> Result<Self> {
        if workflow.id.trim().is_empty() {
            return Err(VisitflowError::Validation("workflow id is empty".into()));
        }

        let mut index = HashMap::with_capacity(workflow.nodes.len());
        let mut specs = Vec::with_capacity(workflow.nodes.len());
        for (i, node) in workflow.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(VisitflowError::Validation(format!(
                    "duplicate node id '{}' in workflow {}",
                    node.id, workflow.id
                )));
            }
            let spec = NodeSpec::parse(node.kind, &node.title, &node.settings).map_err(|e| {
                VisitflowError::Validation(format!("node '{}': {}", node.id, e))
            })?;
            specs.push(spec);
        }

        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut inbound: HashMap<String, usize> = HashMap::new();
        for (i, edge) in workflow.edges.iter().enumerate() {
            for end in [&edge.source, &edge.target] {
                if !index.contains_key(end) {
                    return Err(VisitflowError::Validation(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
            *inbound.entry(edge.target.clone()).or_default() += 1;
        }

        let mut graph = Self {
            workflow,
            index,
            specs,
            outgoing,
            inbound,
            step_order: HashMap::new(),
        };
        graph.step_order = graph.compute_step_order();
        Ok(graph)
    }

    fn compute_step_order(&self) -> HashMap<String, u32> {
        let mut order = HashMap::new();
        let mut queue = VecDeque::new();
        for node in self.triggers() {
            order.insert(node.id.clone(), 0u32);
            queue.push_back(node.id.as_str());
        }
        while let Some(id) = queue.pop_front() {
            let depth = order[id];
            for edge in self.outgoing(id) {
                if !order.contains_key(&edge.target) {
                    order.insert(edge.target.clone(), depth + 1);
                    queue.push_back(edge.target.as_str());
                }
            }
        }
        order
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn id(&self) -> &str {
        &self.workflow.id
    }

    pub fn site_id(&self) -> &str {
        &self.workflow.site_id
    }

    pub fn name(&self) -> &str {
        &self.workflow.name
    }

    pub fn is_active(&self) -> bool {
        self.workflow.status == WorkflowStatus::Active
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.workflow.nodes[i])
    }

    pub fn spec(&self, id: &str) -> Option<&NodeSpec> {
        self.index.get(id).map(|&i| &self.specs[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&Node, &NodeSpec)> {
        self.workflow.nodes.iter().zip(self.specs.iter())
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Node> {
        self.workflow
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Trigger)
    }

    /// Outgoing edges in definition order.
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(id)
            .map(|idx| idx.iter().map(|&i| &self.workflow.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn inbound_count(&self, id: &str) -> usize {
        self.inbound.get(id).copied().unwrap_or(0)
    }

    /// Edge distance from the nearest trigger; `None` if unreachable.
    pub fn step_order(&self, id: &str) -> Option<u32> {
        self.step_order.get(id).copied()
    }

    pub fn frequency(&self, id: &str) -> ActionFrequency {
        self.node(id)
            .map(|n| action_frequency(&n.settings))
            .unwrap_or_default()
    }

    /// Cooldown configured by a Frequency Cap directly after the trigger.
    pub fn cooldown_for(&self, trigger_id: &str) -> Option<u64> {
        self.outgoing(trigger_id).into_iter().find_map(|edge| {
            match self.spec(&edge.target) {
                Some(NodeSpec::FrequencyCap { cooldown_secs }) => *cooldown_secs,
                _ => None,
            }
        })
    }

    /// Node ids no trigger can reach.
    pub fn unreachable(&self) -> HashSet<&str> {
        self.workflow
            .nodes
            .iter()
            .filter(|n| !self.step_order.contains_key(&n.id))
            .map(|n| n.id.as_str())
            .collect()
    }
}
