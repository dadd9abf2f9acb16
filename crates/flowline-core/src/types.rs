use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlowError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn from_string(s: &str) -> Self {
                Self(s.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a static workflow definition.
    WorkflowId
);
string_id!(
    /// Identifier of a static node in a workflow definition.
    NodeId
);
string_id!(
    /// Identifier of one run of a workflow.
    WorkflowInstanceId
);
string_id!(
    /// Identifier of one execution slot of a node within a workflow run.
    NodeInstanceId
);
string_id!(
    /// Identifier of a dispatched unit of human or agent work.
    TaskId
);

/// Implements `as_str` / `FromStr` / `Display` for a unit-only status enum.
macro_rules! status_strings {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = FlowError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(FlowError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Kind of a static node. Parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    Processor,
    End,
}

status_strings!(NodeKind {
    Start => "start",
    Processor => "processor",
    End => "end",
});

impl NodeKind {
    /// Start and End nodes complete on their own; only processors get tasks.
    pub fn is_auto_complete(&self) -> bool {
        matches!(self, Self::Start | Self::End)
    }
}

/// Who does the work bound to a processor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Human,
    Agent,
    Mixed,
}

status_strings!(TaskType {
    Human => "human",
    Agent => "agent",
    Mixed => "mixed",
});

/// Processor bound to a `Processor` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorBinding {
    /// Whether the work goes to a human, an agent, or both.
    pub kind: TaskType,
    /// User the human part of the work is assigned to.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Agent the automated part of the work is submitted to.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Free-form instructions copied into the task input.
    #[serde(default)]
    pub instructions: Option<String>,
}

/// A statically-defined node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: NodeId,
    #[serde(default)]
    pub workflow_id: WorkflowId,
    pub name: String,
    #[serde(deserialize_with = "deserialize_node_kind")]
    pub kind: NodeKind,
    #[serde(default)]
    pub processor: Option<ProcessorBinding>,
}

fn deserialize_node_kind<'de, D>(deserializer: D) -> Result<NodeKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl NodeDefinition {
    pub fn start(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::End)
    }

    /// Processor node worked on by an agent.
    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let mut node = Self::with_kind(id, NodeKind::Processor);
        node.processor = Some(ProcessorBinding {
            kind: TaskType::Agent,
            user_id: None,
            agent_id: Some(agent_id.into()),
            instructions: None,
        });
        node
    }

    /// Processor node worked on by a human.
    pub fn human(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut node = Self::with_kind(id, NodeKind::Processor);
        node.processor = Some(ProcessorBinding {
            kind: TaskType::Human,
            user_id: Some(user_id.into()),
            agent_id: None,
            instructions: None,
        });
        node
    }

    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: NodeId(id),
            workflow_id: WorkflowId(String::new()),
            kind,
            processor: None,
        }
    }

    /// Task type derived from the processor binding; processors without a
    /// binding are treated as human work.
    pub fn task_type(&self) -> TaskType {
        self.processor
            .as_ref()
            .map(|p| p.kind)
            .unwrap_or(TaskType::Human)
    }
}

/// A directed edge between two static nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    /// Condition config in its JSON wire format; `None` means unconditional.
    #[serde(default)]
    pub condition_config: Option<serde_json::Value>,
}

impl Connection {
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_node_id: NodeId(from.into()),
            to_node_id: NodeId(to.into()),
            condition_config: None,
        }
    }

    pub fn when(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: serde_json::Value,
    ) -> Self {
        Self {
            from_node_id: NodeId(from.into()),
            to_node_id: NodeId(to.into()),
            condition_config: Some(condition),
        }
    }
}

/// A complete static workflow graph, as loaded from a definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl WorkflowDefinition {
    /// Stamp the workflow id onto every node.
    pub fn normalized(mut self) -> Self {
        for node in &mut self.nodes {
            node.workflow_id = self.id.clone();
        }
        self
    }

    /// Basic structural checks: unique node ids, at least one start node,
    /// connections between known nodes.
    pub fn check(&self) -> crate::error::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(FlowError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        if !self.nodes.iter().any(|n| n.kind == NodeKind::Start) {
            return Err(FlowError::Validation(format!(
                "workflow '{}' has no start node",
                self.id
            )));
        }
        for conn in &self.connections {
            for end in [&conn.from_node_id, &conn.to_node_id] {
                if !seen.contains(end) {
                    return Err(FlowError::Validation(format!(
                        "connection references unknown node '{}'",
                        end
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(WorkflowStatus {
    Pending => "pending",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Persisted status of a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeInstanceStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Never reached: every incoming edge resolved without activating.
    Skipped,
}

status_strings!(NodeInstanceStatus {
    Pending => "pending",
    Waiting => "waiting",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
    Skipped => "skipped",
});

impl NodeInstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Waiting,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(TaskStatus {
    Pending => "pending",
    Assigned => "assigned",
    Waiting => "waiting",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Who a task is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Assignee {
    User(String),
    Agent(String),
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub input_data: serde_json::Value,
    /// Externally supplied data merged into every node's global context.
    #[serde(default)]
    pub context_data: serde_json::Value,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(
        workflow_id: WorkflowId,
        name: impl Into<String>,
        input_data: serde_json::Value,
        context_data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowInstanceId::new(),
            workflow_id,
            name: name.into(),
            status: WorkflowStatus::Pending,
            input_data,
            context_data,
            output_data: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// One execution slot of a static node within a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub node_id: NodeId,
    pub status: NodeInstanceStatus,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Set on instances created by a loop-back.
    #[serde(default)]
    pub loop_iteration: Option<u32>,
    /// Instance whose completion (loop) or failure (retry) produced this one.
    #[serde(default)]
    pub parent_instance_id: Option<NodeInstanceId>,
    #[serde(default)]
    pub execution_path_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeInstance {
    pub fn new(workflow_instance_id: WorkflowInstanceId, node_id: NodeId) -> Self {
        Self {
            id: NodeInstanceId::new(),
            workflow_instance_id,
            node_id,
            status: NodeInstanceStatus::Pending,
            input_data: None,
            output_data: None,
            error_message: None,
            retry_count: 0,
            loop_iteration: None,
            parent_instance_id: None,
            execution_path_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// A dispatched unit of human or agent work bound to a node instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskId,
    pub node_instance_id: NodeInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<Assignee>,
    pub title: String,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(default)]
    pub output_data: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn new(
        node_instance_id: NodeInstanceId,
        workflow_instance_id: WorkflowInstanceId,
        task_type: TaskType,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            node_instance_id,
            workflow_instance_id,
            task_type,
            status: TaskStatus::Pending,
            assignee: None,
            title: title.into(),
            input_data: serde_json::Value::Null,
            output_data: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Outcome of handing a task to the agent service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    Queued,
    Rejected,
}
