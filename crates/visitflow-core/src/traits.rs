use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::graph::WorkflowGraph;
use crate::settings::LocalAction;
use crate::types::*;

/// Source of validated workflows, filtered by site and status.
pub trait WorkflowCatalog: Send + Sync + 'static {
    /// Active workflows for a site.
    fn active_workflows(&self, site_id: &str) -> BoxFuture<'_, Result<Vec<Arc<WorkflowGraph>>>>;

    /// Look up a workflow regardless of status.
    fn get(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<Arc<WorkflowGraph>>>>;

    /// Atomically bump the workflow's completion counter, returning the new value.
    fn increment_completions(&self, workflow_id: &str) -> BoxFuture<'_, Result<u64>>;
}

/// Visitor identity/tag store.
pub trait TagStore: Send + Sync + 'static {
    fn has_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<bool>>;

    /// Upsert a tag into the visitor's tag set. Adding an existing tag is a no-op.
    fn add_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<()>>;

    fn remove_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<()>>;

    fn tags(&self, site_id: &str, visitor_id: &str) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Scoped key-value persistence for frequency, cooldown, and cache state.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, scope: &StorageScope, key: &str) -> BoxFuture<'_, Result<Option<String>>>;

    fn set(&self, scope: &StorageScope, key: &str, value: &str) -> BoxFuture<'_, Result<()>>;

    fn remove(&self, scope: &StorageScope, key: &str) -> BoxFuture<'_, Result<()>>;

    /// Drop every entry in a scope (e.g. end of session).
    fn clear(&self, scope: &StorageScope) -> BoxFuture<'_, Result<()>>;
}

/// Append-only lifecycle event sink.
pub trait EventRecorder: Send + Sync + 'static {
    fn record(&self, event: LifecycleEvent) -> BoxFuture<'_, Result<()>>;

    fn record_batch(&self, events: Vec<LifecycleEvent>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let n = events.len();
            for event in events {
                self.record(event).await?;
            }
            Ok(n)
        })
    }

    /// Events for a workflow within a time range, in append order.
    fn query(
        &self,
        workflow_id: &str,
        range: TimeRange,
    ) -> BoxFuture<'_, Result<Vec<LifecycleEvent>>>;
}

/// Terminal store for actions that exhausted their retry budget.
pub trait DeadLetterQueue: Send + Sync + 'static {
    fn push(&self, entry: DlqEntry) -> BoxFuture<'_, Result<()>>;

    /// Most recent entries first.
    fn list(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DlqEntry>>>;

    /// Remove and return an entry, for manual replay.
    fn take(&self, id: &str) -> BoxFuture<'_, Result<Option<DlqEntry>>>;
}

/// Outbound HTTP request, already template-substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Generic outbound HTTP transport used for webhooks and provider APIs.
pub trait HttpTransport: Send + Sync + 'static {
    /// Transport failures are errors; any HTTP status is a response.
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Transactional email provider.
pub trait EmailProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<()>>;
}

/// Renders best-effort page actions (modals, banners, redirects).
pub trait LocalActionHandler: Send + Sync + 'static {
    fn perform(&self, action: &LocalAction, ctx: &VisitorContext) -> BoxFuture<'_, Result<()>>;
}

/// Accepts authoritative actions for asynchronous execution.
pub trait JobSink: Send + Sync + 'static {
    fn enqueue(&self, job: Job) -> BoxFuture<'_, Result<()>>;
}
