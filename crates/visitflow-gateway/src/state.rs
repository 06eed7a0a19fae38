use std::sync::Arc;

use visitflow_core::event::EventJournal;
use visitflow_core::traits::{DeadLetterQueue, TagStore, WorkflowCatalog};
use visitflow_engine::TriggerDetector;
use visitflow_worker::ExecutionWorker;

/// Shared application state for axum handlers.
pub struct AppState {
    pub catalog: Arc<dyn WorkflowCatalog>,
    pub journal: Arc<EventJournal>,
    pub tags: Arc<dyn TagStore>,
    pub dlq: Arc<dyn DeadLetterQueue>,
    pub detector: Arc<TriggerDetector>,
    pub worker: Arc<ExecutionWorker>,
    /// Paths returned by funnel analysis.
    pub top_paths: usize,
}
