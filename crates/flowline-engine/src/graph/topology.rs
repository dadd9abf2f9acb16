use std::collections::{BTreeMap, BTreeSet};

use flowline_core::error::Result;
use flowline_core::traits::NodeRepository;
use flowline_core::types::{Connection, NodeDefinition, NodeId, NodeKind, WorkflowId};

/// The static node graph of one workflow definition.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub workflow_id: WorkflowId,
    nodes: BTreeMap<NodeId, NodeDefinition>,
    connections: Vec<Connection>,
    back_edges: BTreeSet<(NodeId, NodeId)>,
}

impl Topology {
    pub fn new(
        workflow_id: WorkflowId,
        nodes: Vec<NodeDefinition>,
        connections: Vec<Connection>,
    ) -> Self {
        let nodes: BTreeMap<NodeId, NodeDefinition> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        let back_edges = classify_back_edges(&nodes, &connections);
        Self {
            workflow_id,
            nodes,
            connections,
            back_edges,
        }
    }

    pub async fn load(repo: &dyn NodeRepository, workflow_id: &WorkflowId) -> Result<Self> {
        let nodes = repo.workflow_nodes(workflow_id).await?;
        let connections = repo.workflow_connections(workflow_id).await?;
        Ok(Self::new(workflow_id.clone(), nodes, connections))
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.values()
    }

    pub fn kind(&self, id: &NodeId) -> NodeKind {
        self.nodes
            .get(id)
            .map(|n| n.kind)
            .unwrap_or(NodeKind::Processor)
    }

    pub fn outgoing<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| &c.from_node_id == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| &c.to_node_id == id)
    }

    /// Distinct source node ids with an edge into `id`.
    pub fn predecessors(&self, id: &NodeId) -> BTreeSet<NodeId> {
        self.incoming(id).map(|c| c.from_node_id.clone()).collect()
    }

    /// True when `from -> to` closes a cycle, i.e. it leads back to a node
    /// still being walked from the entry points.
    pub fn is_back_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        self.back_edges.contains(&(from.clone(), to.clone()))
    }

    /// Predecessors a first pass through the graph has to wait for. Sources
    /// of back-edges are left out; they only ever re-trigger `id` as a loop.
    pub fn static_upstream(&self, id: &NodeId) -> BTreeSet<NodeId> {
        self.incoming(id)
            .filter(|c| !self.is_back_edge(&c.from_node_id, id))
            .map(|c| c.from_node_id.clone())
            .collect()
    }

    /// Every node reachable from `id` by following edges, excluding `id`
    /// unless it sits on a cycle.
    pub fn reachable_from(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut worklist: Vec<NodeId> = self.outgoing(id).map(|c| c.to_node_id.clone()).collect();
        while let Some(next) = worklist.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            worklist.extend(self.outgoing(&next).map(|c| c.to_node_id.clone()));
        }
        seen
    }

    /// Every node with a path into `id`, walked iteratively so cycles terminate.
    pub fn ancestors_of(&self, id: &NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut worklist: Vec<NodeId> = self.predecessors(id).into_iter().collect();
        while let Some(next) = worklist.pop() {
            if &next == id || !seen.insert(next.clone()) {
                continue;
            }
            worklist.extend(self.predecessors(&next));
            order.push(next);
        }
        order
    }
}

/// Depth-first walk from Start nodes, then from nodes without incoming
/// edges, then from anything left over. An edge into a node that is still
/// on the walk stack is a back-edge.
fn classify_back_edges(
    nodes: &BTreeMap<NodeId, NodeDefinition>,
    connections: &[Connection],
) -> BTreeSet<(NodeId, NodeId)> {
    let mut adjacency: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
    let mut has_incoming = BTreeSet::new();
    for conn in connections {
        adjacency
            .entry(&conn.from_node_id)
            .or_default()
            .push(&conn.to_node_id);
        has_incoming.insert(&conn.to_node_id);
    }

    let roots = nodes
        .values()
        .filter(|n| n.kind == NodeKind::Start)
        .map(|n| &n.id)
        .chain(nodes.keys().filter(|id| !has_incoming.contains(id)))
        .chain(nodes.keys());

    // 1 = on the walk stack, 2 = finished
    let mut marks: BTreeMap<&NodeId, u8> = BTreeMap::new();
    let mut back = BTreeSet::new();
    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, 1);
        let mut stack: Vec<(&NodeId, usize)> = vec![(root, 0)];
        while let Some((node, next)) = stack.last_mut() {
            let node: &NodeId = *node;
            let targets = adjacency.get(node).map(Vec::as_slice).unwrap_or_default();
            match targets.get(*next) {
                Some(&target) => {
                    *next += 1;
                    match marks.get(target).copied() {
                        Some(1) => {
                            back.insert((node.clone(), target.clone()));
                        }
                        Some(_) => {}
                        None => {
                            marks.insert(target, 1);
                            stack.push((target, 0));
                        }
                    }
                }
                None => {
                    marks.insert(node, 2);
                    stack.pop();
                }
            }
        }
    }
    back
}

#[cfg(test)]
mod tests {
    use super::*;

    fn looped() -> Topology {
        Topology::new(
            WorkflowId::from("wf"),
            vec![
                NodeDefinition::start("start"),
                NodeDefinition::agent("draft", "writer"),
                NodeDefinition::human("review", "editor"),
                NodeDefinition::end("end"),
            ],
            vec![
                Connection::always("start", "draft"),
                Connection::always("draft", "review"),
                Connection::always("review", "draft"),
                Connection::always("review", "end"),
            ],
        )
    }

    #[test]
    fn test_edges() {
        let t = looped();
        let review = NodeId::from("review");
        let outs: Vec<_> = t.outgoing(&review).map(|c| c.to_node_id.as_str()).collect();
        assert_eq!(outs, vec!["draft", "end"]);
        assert_eq!(t.predecessors(&NodeId::from("draft")).len(), 2);
        assert_eq!(t.kind(&NodeId::from("end")), NodeKind::End);
    }

    #[test]
    fn test_walks_terminate_on_cycles() {
        let t = looped();
        let ancestors = t.ancestors_of(&NodeId::from("end"));
        assert_eq!(ancestors.len(), 3);
        assert!(!ancestors.contains(&NodeId::from("end")));

        let reach = t.reachable_from(&NodeId::from("draft"));
        assert!(reach.contains(&NodeId::from("draft")));
        assert!(reach.contains(&NodeId::from("end")));
        assert!(!reach.contains(&NodeId::from("start")));
    }

    #[test]
    fn test_back_edges_leave_static_upstream() {
        let t = looped();
        let draft = NodeId::from("draft");
        let review = NodeId::from("review");
        assert!(t.is_back_edge(&review, &draft));
        assert!(!t.is_back_edge(&draft, &review));

        let upstream: Vec<_> = t.static_upstream(&draft).into_iter().collect();
        assert_eq!(upstream, vec![NodeId::from("start")]);
        assert_eq!(t.static_upstream(&review).len(), 1);
        assert_eq!(t.static_upstream(&NodeId::from("end")).len(), 1);
    }

    #[test]
    fn test_self_loop_is_back_edge() {
        let t = Topology::new(
            WorkflowId::from("wf"),
            vec![
                NodeDefinition::start("start"),
                NodeDefinition::agent("poll", "poller"),
                NodeDefinition::end("end"),
            ],
            vec![
                Connection::always("start", "poll"),
                Connection::always("poll", "poll"),
                Connection::always("poll", "end"),
            ],
        );
        let poll = NodeId::from("poll");
        assert!(t.is_back_edge(&poll, &poll));
        assert_eq!(t.static_upstream(&poll).len(), 1);
    }

    #[test]
    fn test_acyclic_graph_has_no_back_edges() {
        let t = Topology::new(
            WorkflowId::from("wf"),
            vec![
                NodeDefinition::start("start"),
                NodeDefinition::agent("a", "x"),
                NodeDefinition::agent("b", "y"),
                NodeDefinition::end("end"),
            ],
            vec![
                Connection::always("start", "a"),
                Connection::always("start", "b"),
                Connection::always("a", "end"),
                Connection::always("b", "end"),
            ],
        );
        assert_eq!(t.static_upstream(&NodeId::from("end")).len(), 2);
        assert!(t.back_edges.is_empty());
    }
}
