//! Serialized form of an execution context, used for crash recovery.
//!
//! Sets are `BTreeSet`s and maps are `BTreeMap`s, so they serialize as
//! sorted arrays/objects and come back as the same types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowline_core::error::{FlowError, Result};
use flowline_core::types::{NodeInstanceId, WorkflowId, WorkflowInstanceId};

use super::dependency::NodeDependency;
use super::path::ExecutionPath;
use super::state::{ExecutionRecord, NodeState};

/// Per-instance data other than dependencies and node states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionData {
    pub workflow_id: WorkflowId,
    pub paths: BTreeMap<String, ExecutionPath>,
    pub pending_triggers: BTreeSet<NodeInstanceId>,
    #[serde(default)]
    pub global: Value,
    #[serde(default)]
    pub outputs: BTreeMap<NodeInstanceId, Value>,
    #[serde(default)]
    pub records: Vec<ExecutionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub workflow_instance_id: WorkflowInstanceId,
    pub execution_context: ExecutionData,
    pub node_dependencies: BTreeMap<NodeInstanceId, NodeDependency>,
    pub node_states: BTreeMap<NodeInstanceId, NodeState>,
    pub last_updated: DateTime<Utc>,
}

impl ContextSnapshot {
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| FlowError::Snapshot(e.to_string()))
    }

    /// Parse and sanity-check a stored snapshot.
    pub fn from_value(value: Value) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_value(value).map_err(|e| FlowError::Snapshot(e.to_string()))?;
        snapshot.check()?;
        Ok(snapshot)
    }

    fn check(&self) -> Result<()> {
        for (id, dep) in &self.node_dependencies {
            if &dep.node_instance_id != id {
                return Err(FlowError::Snapshot(format!(
                    "dependency keyed {} describes {}",
                    id, dep.node_instance_id
                )));
            }
            if !self.node_states.contains_key(id) {
                return Err(FlowError::Snapshot(format!(
                    "dependency for unknown node instance {}",
                    id
                )));
            }
            if dep.ready != (dep.completed_upstream.len() == dep.upstream.len()) {
                return Err(FlowError::Snapshot(format!(
                    "ready flag out of sync for {}",
                    id
                )));
            }
        }
        for id in &self.execution_context.pending_triggers {
            if !self.node_states.contains_key(id) {
                return Err(FlowError::Snapshot(format!(
                    "trigger for unknown node instance {}",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::types::NodeId;
    use serde_json::json;

    fn sample() -> ContextSnapshot {
        let a = NodeInstanceId::from("a");
        let b = NodeInstanceId::from("b");
        let mut node_states = BTreeMap::new();
        node_states.insert(a.clone(), NodeState::pending(a.clone(), NodeId::from("a")));
        node_states.insert(b.clone(), NodeState::pending(b.clone(), NodeId::from("b")));
        let mut node_dependencies = BTreeMap::new();
        node_dependencies.insert(a.clone(), NodeDependency::new(a.clone(), NodeId::from("a"), []));
        node_dependencies.insert(
            b.clone(),
            NodeDependency::new(b.clone(), NodeId::from("b"), [a.clone()]),
        );
        let mut execution_context = ExecutionData::default();
        execution_context
            .paths
            .insert("main".into(), ExecutionPath::main());
        execution_context.pending_triggers.insert(a);
        ContextSnapshot {
            workflow_instance_id: WorkflowInstanceId::from("wfi"),
            execution_context,
            node_dependencies,
            node_states,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_wire_field_names() {
        let value = sample().to_value().unwrap();
        for key in [
            "workflowInstanceId",
            "executionContext",
            "nodeDependencies",
            "nodeStates",
            "lastUpdated",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["executionContext"]["pendingTriggers"], json!(["a"]));
    }

    #[test]
    fn test_round_trip_keeps_sets() {
        let snapshot = sample();
        let restored = ContextSnapshot::from_value(snapshot.to_value().unwrap()).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_rejects_inconsistent_snapshot() {
        let mut value = sample().to_value().unwrap();
        value["nodeDependencies"]["b"]["ready"] = json!(true);
        assert!(matches!(
            ContextSnapshot::from_value(value),
            Err(FlowError::Snapshot(_))
        ));

        assert!(ContextSnapshot::from_value(json!({"nope": 1})).is_err());
    }
}
