pub mod analytics;
pub mod funnel;
pub mod memory;
pub mod sqlite;

pub use analytics::{summarize, WorkflowSummary};
pub use funnel::{FunnelAnalyzer, FunnelReport};
pub use memory::{MemoryCatalog, MemoryStore};
pub use sqlite::SqliteStore;
