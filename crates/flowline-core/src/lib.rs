pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use event::{EngineEvent, EventBus, ListenerId, ListenerSet};
pub use traits::Repositories;
pub use types::*;
