use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use flowline_core::types::{NodeId, NodeInstanceId};

/// Upstream bookkeeping for one node instance.
///
/// `completed_upstream` holds the upstream instances that have been
/// resolved: they finished and their edge was evaluated. Those whose edge
/// actually held are also in `activated_upstream`. `ready` always equals
/// "every upstream resolved", which is trivially true with no upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDependency {
    pub node_instance_id: NodeInstanceId,
    pub node_id: NodeId,
    pub upstream: BTreeSet<NodeInstanceId>,
    #[serde(default)]
    pub completed_upstream: BTreeSet<NodeInstanceId>,
    #[serde(default)]
    pub activated_upstream: BTreeSet<NodeInstanceId>,
    #[serde(default)]
    pub ready: bool,
}

impl NodeDependency {
    pub fn new(
        node_instance_id: NodeInstanceId,
        node_id: NodeId,
        upstream: impl IntoIterator<Item = NodeInstanceId>,
    ) -> Self {
        let mut dep = Self {
            node_instance_id,
            node_id,
            upstream: upstream.into_iter().collect(),
            completed_upstream: BTreeSet::new(),
            activated_upstream: BTreeSet::new(),
            ready: false,
        };
        dep.refresh();
        dep
    }

    /// Record that `upstream_id` finished and whether its edge held.
    /// Returns true if anything changed. Unknown ids are ignored.
    pub fn resolve(&mut self, upstream_id: &NodeInstanceId, activated: bool) -> bool {
        if !self.upstream.contains(upstream_id) {
            return false;
        }
        let mut changed = self.completed_upstream.insert(upstream_id.clone());
        if activated {
            changed |= self.activated_upstream.insert(upstream_id.clone());
        }
        self.refresh();
        changed
    }

    /// Recompute `ready` from the sets.
    pub fn refresh(&mut self) {
        self.completed_upstream.retain(|id| self.upstream.contains(id));
        self.activated_upstream
            .retain(|id| self.completed_upstream.contains(id));
        self.ready = self.completed_upstream.len() == self.upstream.len();
    }

    /// Ready and reached by at least one held edge (or a root).
    pub fn is_triggerable(&self) -> bool {
        self.ready && (self.upstream.is_empty() || !self.activated_upstream.is_empty())
    }

    /// Every upstream resolved but none of their edges held.
    pub fn is_dormant(&self) -> bool {
        self.ready && !self.upstream.is_empty() && self.activated_upstream.is_empty()
    }
}
