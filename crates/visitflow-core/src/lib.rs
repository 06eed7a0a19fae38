pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod settings;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, VisitflowError};
pub use event::{EventBus, EventJournal};
pub use graph::WorkflowGraph;
pub use types::*;
