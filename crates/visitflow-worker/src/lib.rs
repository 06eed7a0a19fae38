pub mod actions;
pub mod queue;
pub mod retry;
pub mod template;
pub mod transport;
pub mod worker;

pub use actions::email::{email_provider, ResendEmailProvider, SimulatedEmailProvider};
pub use actions::webhook::WebhookSender;
pub use queue::{JobQueue, WorkerPool};
pub use retry::{RetryFailure, RetryPolicy};
pub use template::Template;
pub use transport::ReqwestTransport;
pub use worker::ExecutionWorker;
