pub mod context;
pub mod dependency;
pub mod path;
pub mod snapshot;
pub mod state;
pub mod topology;

pub use context::{ExecutionContext, ReadyNode};
pub use dependency::NodeDependency;
pub use path::{ExecutionPath, PathStatus, MAIN_PATH};
pub use snapshot::{ContextSnapshot, ExecutionData};
pub use state::{ExecutionRecord, NodeState, NodeStatus};
pub use topology::Topology;
