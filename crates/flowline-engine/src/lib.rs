pub mod agent;
pub mod condition;
pub mod graph;
pub mod orchestrator;
pub mod registry;

pub use agent::{AgentOutcome, LocalAgentService};
pub use condition::{ConditionConfig, ConditionEngine};
pub use graph::{ContextSnapshot, ExecutionContext, ExecutionPath, NodeStatus, ReadyNode, Topology};
pub use orchestrator::Orchestrator;
pub use registry::ContextRegistry;

use std::sync::Arc;

use flowline_core::config::AppConfig;
use flowline_core::event::EventBus;
use flowline_core::traits::{AgentTaskService, Repositories};

/// A wired engine: registry plus orchestrator sharing one event bus.
pub struct Engine {
    pub registry: Arc<ContextRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub event_bus: Arc<EventBus>,
}

impl Engine {
    pub fn new(config: &AppConfig, repos: Repositories, agents: Arc<dyn AgentTaskService>) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let conditions = Arc::new(ConditionEngine::new(config.conditions.clone()));
        let registry = Arc::new(ContextRegistry::new(
            repos.clone(),
            conditions,
            event_bus.clone(),
            config.engine.clone(),
            config.registry.clone(),
        ));
        let orchestrator = Orchestrator::new(
            repos,
            registry.clone(),
            agents,
            event_bus.clone(),
            config.engine.clone(),
        );
        Self {
            registry,
            orchestrator,
            event_bus,
        }
    }
}
