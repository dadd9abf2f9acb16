use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowline_core::types::{NodeId, NodeInstanceId};

pub const MAIN_PATH: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Active,
    Completed,
    Failed,
    Branched,
}

/// An independent traversal through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPath {
    pub path_id: String,
    pub parent_path_id: Option<String>,
    pub status: PathStatus,
    /// Node ids that started or finished in this path; drives loop detection.
    #[serde(default)]
    pub visited_nodes: BTreeSet<NodeId>,
    /// Loop-backs created per node id.
    #[serde(default)]
    pub loop_count: BTreeMap<NodeId, u32>,
    /// Nodes that hit the loop cap; no further loop-backs are attempted.
    #[serde(default)]
    pub exhausted: BTreeSet<NodeId>,
    /// Latest output per node id.
    #[serde(default)]
    pub accumulated_outputs: BTreeMap<NodeId, Value>,
    /// Downstream node ids chosen by a user, per node instance.
    #[serde(default)]
    pub user_selections: BTreeMap<NodeInstanceId, Vec<NodeId>>,
    /// Set when a node of this path failed; cleared by an operator retry.
    #[serde(default)]
    pub has_failure: bool,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPath {
    pub fn main() -> Self {
        Self::new(MAIN_PATH.to_string(), None)
    }

    pub fn new(path_id: String, parent_path_id: Option<String>) -> Self {
        Self {
            path_id,
            parent_path_id,
            status: PathStatus::Active,
            visited_nodes: BTreeSet::new(),
            loop_count: BTreeMap::new(),
            exhausted: BTreeSet::new(),
            accumulated_outputs: BTreeMap::new(),
            user_selections: BTreeMap::new(),
            has_failure: false,
            created_at: Utc::now(),
        }
    }

    /// A new Active path carrying this path's accumulated state.
    pub fn fork(&self, path_id: String) -> Self {
        Self {
            path_id,
            parent_path_id: Some(self.path_id.clone()),
            status: PathStatus::Active,
            visited_nodes: self.visited_nodes.clone(),
            loop_count: self.loop_count.clone(),
            exhausted: self.exhausted.clone(),
            accumulated_outputs: self.accumulated_outputs.clone(),
            user_selections: self.user_selections.clone(),
            has_failure: false,
            created_at: Utc::now(),
        }
    }

    /// Re-derive the status from whether the path still has live work.
    /// A branched path keeps its marker once its own work is done.
    pub fn settle(&mut self, has_live_work: bool) {
        self.status = match (has_live_work, self.status) {
            (true, _) => PathStatus::Active,
            (false, PathStatus::Branched) => PathStatus::Branched,
            (false, _) if self.has_failure => PathStatus::Failed,
            (false, _) => PathStatus::Completed,
        };
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, PathStatus::Completed | PathStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fork_clones_state() {
        let mut main = ExecutionPath::main();
        main.visited_nodes.insert(NodeId::from("a"));
        main.loop_count.insert(NodeId::from("a"), 2);
        main.accumulated_outputs.insert(NodeId::from("a"), json!({"x": 1}));
        main.has_failure = true;

        let child = main.fork("p-1".into());
        assert_eq!(child.parent_path_id.as_deref(), Some(MAIN_PATH));
        assert_eq!(child.status, PathStatus::Active);
        assert!(child.visited_nodes.contains(&NodeId::from("a")));
        assert_eq!(child.loop_count[&NodeId::from("a")], 2);
        assert_eq!(child.accumulated_outputs.len(), 1);
        assert!(!child.has_failure);
    }

    #[test]
    fn test_settle() {
        let mut path = ExecutionPath::main();
        path.settle(false);
        assert_eq!(path.status, PathStatus::Completed);

        path.settle(true);
        assert_eq!(path.status, PathStatus::Active);

        path.has_failure = true;
        path.settle(false);
        assert_eq!(path.status, PathStatus::Failed);

        path.status = PathStatus::Branched;
        path.settle(false);
        assert_eq!(path.status, PathStatus::Branched);
        path.settle(true);
        assert_eq!(path.status, PathStatus::Active);
    }
}
