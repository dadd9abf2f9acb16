use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowline_core::types::{NodeId, NodeInstance, NodeInstanceId, NodeInstanceStatus};

/// In-memory state of a node instance.
///
/// `Ready` only exists in memory; it is persisted as `pending`, and recovery
/// recomputes readiness from the dependency map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Claimed for execution but not finished.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Ready | Self::Executing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn to_persisted(self) -> NodeInstanceStatus {
        match self {
            Self::Pending | Self::Ready => NodeInstanceStatus::Pending,
            Self::Executing => NodeInstanceStatus::Running,
            Self::Completed => NodeInstanceStatus::Completed,
            Self::Failed => NodeInstanceStatus::Failed,
            Self::Cancelled => NodeInstanceStatus::Cancelled,
            Self::Skipped => NodeInstanceStatus::Skipped,
        }
    }

    pub fn from_persisted(status: NodeInstanceStatus) -> Self {
        match status {
            NodeInstanceStatus::Pending | NodeInstanceStatus::Waiting => Self::Pending,
            NodeInstanceStatus::Running => Self::Executing,
            NodeInstanceStatus::Completed => Self::Completed,
            NodeInstanceStatus::Failed => Self::Failed,
            NodeInstanceStatus::Cancelled => Self::Cancelled,
            NodeInstanceStatus::Skipped => Self::Skipped,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_instance_id: NodeInstanceId,
    pub node_id: NodeId,
    pub status: NodeStatus,
    /// `None` until an activated edge (or a branch) claims the instance.
    #[serde(default)]
    pub path_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub loop_iteration: Option<u32>,
    #[serde(default)]
    pub parent_instance_id: Option<NodeInstanceId>,
    /// A retry instance superseded this failure.
    #[serde(default)]
    pub retried: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeState {
    pub fn pending(node_instance_id: NodeInstanceId, node_id: NodeId) -> Self {
        Self {
            node_instance_id,
            node_id,
            status: NodeStatus::Pending,
            path_id: None,
            retry_count: 0,
            loop_iteration: None,
            parent_instance_id: None,
            retried: false,
            error: None,
            completed_at: None,
        }
    }

    pub fn from_instance(instance: &NodeInstance) -> Self {
        Self {
            node_instance_id: instance.id.clone(),
            node_id: instance.node_id.clone(),
            status: NodeStatus::from_persisted(instance.status),
            path_id: instance.execution_path_id.clone(),
            retry_count: instance.retry_count,
            loop_iteration: instance.loop_iteration,
            parent_instance_id: instance.parent_instance_id.clone(),
            retried: false,
            error: instance.error_message.clone(),
            completed_at: instance.completed_at,
        }
    }
}

/// One attempt to run a node instance within a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub path_id: String,
    pub node_instance_id: NodeInstanceId,
    pub node_id: NodeId,
    /// 1-based count of attempts of this node id within the path.
    pub execution_count: u32,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}
