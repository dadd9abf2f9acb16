use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Caller errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Not authorized: {0}")]
    Authorization(String),

    // Engine errors
    #[error("Condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    #[error("Loop limit exceeded for node {node_id} on path {path_id} (limit {limit})")]
    LoopLimitExceeded {
        node_id: String,
        path_id: String,
        limit: u32,
    },

    #[error("Invalid transition for node instance {node_instance_id}: {from} -> {to}")]
    InvalidTransition {
        node_instance_id: String,
        from: String,
        to: String,
    },

    #[error("Persistence inconsistency: {0}")]
    PersistenceInconsistency(String),

    #[error("Task {task_id} timed out after {timeout_secs}s")]
    Timeout { task_id: String, timeout_secs: u64 },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
