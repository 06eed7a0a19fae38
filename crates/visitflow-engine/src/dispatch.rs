use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::settings::{storage_mappings, LocalAction, NodeSpec};
use visitflow_core::traits::{JobSink, LocalActionHandler};
use visitflow_core::types::{Job, Node, RunRef, VisitorContext};

/// How an action left the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Ran locally; the outcome is final.
    Completed { elapsed_ms: u64 },
    /// Handed to the execution worker, which records the outcome.
    Enqueued { job_id: String },
}

/// Runs local actions in place and enqueues authoritative ones.
pub struct ActionDispatcher {
    local: Arc<dyn LocalActionHandler>,
    jobs: Arc<dyn JobSink>,
}

impl ActionDispatcher {
    pub fn new(local: Arc<dyn LocalActionHandler>, jobs: Arc<dyn JobSink>) -> Self {
        Self { local, jobs }
    }

    pub async fn dispatch(
        &self,
        run: &RunRef,
        ctx: &VisitorContext,
        node: &Node,
        spec: &NodeSpec,
    ) -> Result<Dispatch> {
        if spec.is_authoritative() {
            let job = build_job(run, ctx, node);
            let job_id = job.id.clone();
            self.jobs.enqueue(job).await?;
            debug!(run_id = %run.run_id, node_id = %node.id, job_id = %job_id, "Action enqueued");
            return Ok(Dispatch::Enqueued { job_id });
        }

        let start = Instant::now();
        match spec {
            NodeSpec::Local(action) => self.local.perform(action, ctx).await?,
            NodeSpec::Unknown { title, .. } => {
                warn!(title = %title, node_id = %node.id, "Unknown action, passing through");
            }
            other => {
                return Err(VisitflowError::Validation(format!(
                    "node '{}' is not a dispatchable action: {:?}",
                    node.id, other
                )))
            }
        }
        Ok(Dispatch::Completed {
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Server-side stand-in for the page runtime: local actions have no page to
/// render into, so they are logged.
pub struct LoggingActionHandler;

impl LocalActionHandler for LoggingActionHandler {
    fn perform(&self, action: &LocalAction, ctx: &VisitorContext) -> BoxFuture<'_, Result<()>> {
        let action = action.clone();
        let site_id = ctx.site_id.clone();
        let visitor_id = ctx.visitor_id.clone();
        Box::pin(async move {
            info!(site_id = %site_id, visitor_id = %visitor_id, ?action, "Local action");
            Ok(())
        })
    }
}

/// Job payload for an authoritative action, with mapped localStorage values.
pub fn build_job(run: &RunRef, ctx: &VisitorContext, node: &Node) -> Job {
    let mut job = Job::new(run, &node.id);
    job.identified_user = ctx.identified_user.clone();
    for mapping in storage_mappings(&node.settings) {
        if let Some(value) = ctx.local_storage.get(&mapping.local_storage_key) {
            job.local_storage.insert(mapping.payload_key, value.clone());
        }
    }
    job
}
