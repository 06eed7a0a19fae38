pub mod branch;
pub mod conditions;
pub mod detector;
pub mod dispatch;
pub mod executor;
pub mod frequency;
pub mod join;
pub mod run_log;
pub mod timers;

pub use conditions::ConditionEvaluator;
pub use detector::{RunHandle, TriggerDetector};
pub use dispatch::{ActionDispatcher, Dispatch, LoggingActionHandler};
pub use executor::{GraphExecutor, Run};
pub use frequency::FrequencyGovernor;
pub use join::{JoinArrival, JoinKey, JoinStateTable, RunTrack};
pub use run_log::RunLogger;
pub use timers::SignalTimers;
