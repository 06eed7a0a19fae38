use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use visitflow_core::config::{AppConfig, RetrySection};
use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::event::EventJournal;
use visitflow_core::settings::NodeSpec;
use visitflow_core::traits::{
    DeadLetterQueue, EmailMessage, EmailProvider, HttpTransport, TagStore, WorkflowCatalog,
};
use visitflow_core::types::{ActionOutcome, DlqEntry, EventKind, Job, LifecycleEvent};

use crate::actions::custom_code;
use crate::actions::webhook::WebhookSender;
use crate::retry::RetryPolicy;
use crate::template::Template;

/// Executes authoritative actions pulled off the job queue.
///
/// Each job ends in exactly one recorded outcome: `Action Executed`, or
/// `Action Failed` (plus a DLQ entry when delivery retries ran out).
pub struct ExecutionWorker {
    catalog: Arc<dyn WorkflowCatalog>,
    journal: Arc<EventJournal>,
    tags: Arc<dyn TagStore>,
    dlq: Arc<dyn DeadLetterQueue>,
    webhook: WebhookSender,
    email: Arc<dyn EmailProvider>,
    retry: RetrySection,
}

impl ExecutionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn WorkflowCatalog>,
        journal: Arc<EventJournal>,
        tags: Arc<dyn TagStore>,
        dlq: Arc<dyn DeadLetterQueue>,
        transport: Arc<dyn HttpTransport>,
        email: Arc<dyn EmailProvider>,
        config: &AppConfig,
    ) -> Self {
        Self {
            catalog,
            journal,
            tags,
            dlq,
            webhook: WebhookSender::new(transport, &config.webhook)
                .classify_errors(config.worker.classify_errors),
            email,
            retry: config.retry.clone(),
        }
    }

    /// Run one job to its terminal outcome.
    ///
    /// Returns `NotFound` without recording anything when the workflow or
    /// node no longer exists. Action failures are reported in the outcome,
    /// not as errors.
    pub async fn process(&self, job: &Job) -> Result<ActionOutcome> {
        let graph = self
            .catalog
            .get(&job.workflow_id)
            .await?
            .ok_or_else(|| VisitflowError::NotFound(format!("workflow '{}'", job.workflow_id)))?;
        let (node, spec) = match (graph.node(&job.node_id), graph.spec(&job.node_id)) {
            (Some(node), Some(spec)) => (node, spec),
            _ => {
                return Err(VisitflowError::NotFound(format!(
                    "node '{}' in workflow '{}'",
                    job.node_id, job.workflow_id
                )))
            }
        };
        if !spec.is_authoritative() {
            return Err(VisitflowError::Validation(format!(
                "node '{}' ({}) is not a server action",
                node.id, node.title
            )));
        }

        let run = job.run_ref();
        let step_order = graph.step_order(&node.id);
        let template = Template::new(job);
        let start = Instant::now();

        match self.perform(spec, job, &template).await {
            Ok(message) => {
                let elapsed = start.elapsed().as_millis() as u64;
                self.journal
                    .append(
                        LifecycleEvent::new(&run, node, EventKind::ActionExecuted, step_order)
                            .with_success(true)
                            .with_elapsed(elapsed)
                            .with_detail(message.clone()),
                    )
                    .await;
                match self.catalog.increment_completions(&job.workflow_id).await {
                    Ok(total) => debug!(workflow_id = %job.workflow_id, total, "Completion counted"),
                    Err(e) => warn!(workflow_id = %job.workflow_id, error = %e, "Failed to count completion"),
                }
                info!(
                    workflow_id = %job.workflow_id,
                    node_id = %job.node_id,
                    visitor_id = %job.visitor_id,
                    action = %node.title,
                    elapsed_ms = elapsed,
                    "Server action executed"
                );
                Ok(ActionOutcome::ok(message))
            }
            Err(e) => {
                let reason = match &e {
                    VisitflowError::DeliveryExhausted {
                        attempts, reason, ..
                    } => {
                        let entry = DlqEntry::new(node.title.clone(), job.clone(), reason.clone(), *attempts);
                        if let Err(dlq_err) = self.dlq.push(entry).await {
                            error!(job_id = %job.id, error = %dlq_err, "Failed to write dead letter");
                        }
                        reason.clone()
                    }
                    other => other.to_string(),
                };
                self.journal
                    .append(
                        LifecycleEvent::new(&run, node, EventKind::ActionFailed, step_order)
                            .with_success(false)
                            .with_elapsed(start.elapsed().as_millis() as u64)
                            .with_detail(reason.clone()),
                    )
                    .await;
                warn!(
                    workflow_id = %job.workflow_id,
                    node_id = %job.node_id,
                    action = %node.title,
                    error = %e,
                    "Server action failed"
                );
                Ok(ActionOutcome::failed(reason))
            }
        }
    }

    /// Queue-side entry point: logs the outcome instead of returning it.
    pub async fn handle(&self, job: Job) {
        match self.process(&job).await {
            Ok(_) => {}
            Err(VisitflowError::NotFound(what)) => {
                warn!(job_id = %job.id, missing = %what, "Dropping job for missing workflow node");
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Job could not be processed"),
        }
    }

    /// Remove a dead letter and run its job again.
    pub async fn replay(&self, dlq_id: &str) -> Result<ActionOutcome> {
        let entry = self
            .dlq
            .take(dlq_id)
            .await?
            .ok_or_else(|| VisitflowError::NotFound(format!("dead letter '{}'", dlq_id)))?;
        info!(dlq_id, action = %entry.action, attempts = entry.attempts, "Replaying dead letter");
        self.process(&entry.payload).await
    }

    async fn perform(&self, spec: &NodeSpec, job: &Job, template: &Template<'_>) -> Result<String> {
        match spec {
            NodeSpec::Webhook(settings) => {
                let request = self.webhook.build_request(settings, job, template)?;
                let webhook = &self.webhook;
                RetryPolicy::from(self.retry.webhook.clone())
                    .run("Webhook", move |_| webhook.send(request.clone()))
                    .await
                    .map_err(|f| f.into_error("Webhook"))?;
                Ok("Webhook sent successfully".into())
            }
            NodeSpec::SendEmail(settings) => {
                let message = EmailMessage {
                    to: template.render(&settings.to).trim().to_string(),
                    subject: template.render(&settings.subject),
                    body: template.render(&settings.body),
                };
                if !message.to.contains('@') {
                    return Err(VisitflowError::Validation(format!(
                        "Send Email: recipient '{}' is not an address",
                        message.to
                    )));
                }
                let email = self.email.as_ref();
                RetryPolicy::from(self.retry.email.clone())
                    .run("Send Email", move |_| email.send(message.clone()))
                    .await
                    .map_err(|f| f.into_error("Send Email"))?;
                Ok(format!("Email sent via {}", self.email.name()))
            }
            NodeSpec::AddTag { tag_name } => {
                let tag = self.render_tag(tag_name, template)?;
                let (tags, site, visitor) = (self.tags.as_ref(), &job.site_id, &job.visitor_id);
                let name = tag.as_str();
                RetryPolicy::from(self.retry.default.clone())
                    .run("Add Tag", move |_| tags.add_tag(site, visitor, name))
                    .await
                    .map_err(|f| f.into_error("Add Tag"))?;
                Ok(format!("Tag '{}' added", tag))
            }
            NodeSpec::RemoveTag { tag_name } => {
                let tag = self.render_tag(tag_name, template)?;
                let (tags, site, visitor) = (self.tags.as_ref(), &job.site_id, &job.visitor_id);
                let name = tag.as_str();
                RetryPolicy::from(self.retry.default.clone())
                    .run("Remove Tag", move |_| tags.remove_tag(site, visitor, name))
                    .await
                    .map_err(|f| f.into_error("Remove Tag"))?;
                Ok(format!("Tag '{}' removed", tag))
            }
            NodeSpec::CustomCode(code) => {
                custom_code::run(code, job, template, self.tags.as_ref()).await
            }
            other => Err(VisitflowError::Validation(format!(
                "unsupported server action: {:?}",
                other
            ))),
        }
    }

    fn render_tag(&self, tag_name: &str, template: &Template<'_>) -> Result<String> {
        let tag = template.render(tag_name).trim().to_string();
        if tag.is_empty() {
            return Err(VisitflowError::Validation(format!(
                "tag '{}' renders empty",
                tag_name
            )));
        }
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use visitflow_core::event::EventBus;
    use visitflow_core::types::{Edge, Node, RunId, RunRef, Workflow, WorkflowStatus};
    use visitflow_store::{MemoryCatalog, MemoryStore};
    use visitflow_test_utils::{webhook_workflow, RecordingEmailProvider, ScriptedTransport};

    const HOOK_URL: &str = "https://hooks.example.com/in";

    struct Harness {
        worker: ExecutionWorker,
        store: Arc<MemoryStore>,
        catalog: Arc<MemoryCatalog>,
        transport: Arc<ScriptedTransport>,
        email: Arc<RecordingEmailProvider>,
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.webhook.jitter = false;
        config.retry.email.jitter = false;
        config.retry.default.jitter = false;
        config
    }

    async fn harness(transport: ScriptedTransport, config: AppConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.upsert(webhook_workflow(HOOK_URL)).await.unwrap();
        catalog.upsert(extras_workflow()).await.unwrap();
        let journal = Arc::new(EventJournal::new(store.clone(), Arc::new(EventBus::default())));
        let transport = Arc::new(transport);
        let email = Arc::new(RecordingEmailProvider::new());
        let worker = ExecutionWorker::new(
            catalog.clone(),
            journal,
            store.clone(),
            store.clone(),
            transport.clone(),
            email.clone(),
            &config,
        );
        Harness {
            worker,
            store,
            catalog,
            transport,
            email,
        }
    }

    fn extras_workflow() -> Workflow {
        Workflow {
            id: "wf-extras".into(),
            site_id: "site-1".into(),
            name: "Extras".into(),
            status: WorkflowStatus::Active,
            nodes: vec![
                Node::trigger("trigger", "Exit Intent"),
                Node::action("mail", "Send Email").with_settings(json!({
                    "emailTo": "{{user.email}}",
                    "emailSubject": "Still thinking, {{user.name}}?",
                    "emailBody": "Your {{localStorage.plan}} trial"
                })),
                Node::action("code", "Custom Code").with_settings(json!({
                    "operations": [
                        {"op": "add_tag", "tag": "exit-{{localStorage.plan}}"},
                        {"op": "fail", "message": "stop here"}
                    ]
                })),
                Node::action("modal", "Show Modal").with_settings(json!({"modalTitle": "Wait"})),
            ],
            edges: vec![
                Edge::new("trigger", "mail"),
                Edge::new("trigger", "code"),
                Edge::new("trigger", "modal"),
            ],
        }
    }

    fn job(workflow_id: &str, node_id: &str) -> Job {
        let run = RunRef {
            run_id: RunId::new(),
            workflow_id: workflow_id.into(),
            site_id: "site-1".into(),
            visitor_id: "visitor-1".into(),
        };
        let mut job = Job::new(&run, node_id);
        job.local_storage.insert("plan".into(), "pro".into());
        job.identified_user = Some(serde_json::from_value(json!({"email": "ada@example.com", "name": "Ada"})).unwrap());
        job
    }

    fn last_kind(store: &MemoryStore) -> Option<EventKind> {
        store.all_events().last().map(|e| e.kind)
    }

    #[tokio::test(start_paused = true)]
    async fn test_webhook_succeeds_on_fifth_attempt() {
        let h = harness(ScriptedTransport::failing_then_ok(4), config()).await;
        let outcome = h.worker.process(&job("wf-webhook", "hook")).await.unwrap();

        assert!(outcome.success);
        assert_eq!(h.transport.requests().len(), 5);
        assert!(h.store.list(10).await.unwrap().is_empty());
        assert_eq!(last_kind(&h.store), Some(EventKind::ActionExecuted));
        assert_eq!(h.catalog.completions("wf-webhook"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_webhook_exhaustion_goes_to_dlq_once() {
        let h = harness(ScriptedTransport::always(500, "boom"), config()).await;
        let outcome = h.worker.process(&job("wf-webhook", "hook")).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(h.transport.requests().len(), 5);
        let dlq = h.store.list(10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "Webhook failed: 500 boom");
        assert_eq!(dlq[0].attempts, 5);
        assert_eq!(dlq[0].action, "Webhook");
        assert_eq!(last_kind(&h.store), Some(EventKind::ActionFailed));
        assert_eq!(h.catalog.completions("wf-webhook"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classified_rejection_skips_retries() {
        let mut config = config();
        config.worker.classify_errors = true;
        let h = harness(ScriptedTransport::always(404, "no such hook"), config).await;
        let outcome = h.worker.process(&job("wf-webhook", "hook")).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(h.transport.requests().len(), 1);
        assert_eq!(h.store.list(10).await.unwrap()[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_webhook_request_is_templated() {
        let h = harness(ScriptedTransport::ok(), config()).await;
        h.worker.process(&job("wf-webhook", "hook")).await.unwrap();

        let sent = h.transport.requests();
        assert_eq!(sent[0].url, HOOK_URL);
        assert_eq!(sent[0].headers["X-Source"], "site-1");
        let body: serde_json::Value = serde_json::from_str(sent[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["visitor"], "visitor-1");
        assert_eq!(body["plan"], "pro");
        assert_eq!(body["identifiedUser"]["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn test_missing_workflow_is_not_found() {
        let h = harness(ScriptedTransport::ok(), config()).await;
        let err = h.worker.process(&job("wf-gone", "hook")).await.unwrap_err();
        assert!(matches!(err, VisitflowError::NotFound(_)));
        let err = h.worker.process(&job("wf-webhook", "nope")).await.unwrap_err();
        assert!(matches!(err, VisitflowError::NotFound(_)));
        assert!(h.store.all_events().is_empty());
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_local_action_is_not_a_job() {
        let h = harness(ScriptedTransport::ok(), config()).await;
        let err = h.worker.process(&job("wf-extras", "modal")).await.unwrap_err();
        assert!(matches!(err, VisitflowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_add_tag_updates_visitor() {
        let h = harness(ScriptedTransport::ok(), config()).await;
        let outcome = h.worker.process(&job("wf-webhook", "tag")).await.unwrap();
        assert!(outcome.success);
        assert!(h.store.has_tag("site-1", "visitor-1", "signed-up").await.unwrap());
    }

    #[tokio::test]
    async fn test_email_rendered_and_sent() {
        let h = harness(ScriptedTransport::ok(), config()).await;
        let outcome = h.worker.process(&job("wf-extras", "mail")).await.unwrap();
        assert!(outcome.success);
        let sent = h.email.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].subject, "Still thinking, Ada?");
        assert_eq!(sent[0].body, "Your pro trial");
    }

    #[tokio::test]
    async fn test_custom_code_failure_is_captured_without_dlq() {
        let h = harness(ScriptedTransport::ok(), config()).await;
        let outcome = h.worker.process(&job("wf-extras", "code")).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Custom code failed: stop here"));
        assert!(h.store.list(10).await.unwrap().is_empty());
        assert_eq!(last_kind(&h.store), Some(EventKind::ActionFailed));
        assert!(h.store.has_tag("site-1", "visitor-1", "exit-pro").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_drains_dead_letter() {
        let h = harness(ScriptedTransport::always(500, "down"), config()).await;
        h.worker.process(&job("wf-webhook", "hook")).await.unwrap();
        let entry = h.store.list(1).await.unwrap().remove(0);

        let recovered = ExecutionWorker::new(
            h.catalog.clone(),
            Arc::new(EventJournal::new(h.store.clone(), Arc::new(EventBus::default()))),
            h.store.clone(),
            h.store.clone(),
            Arc::new(ScriptedTransport::ok()),
            h.email.clone(),
            &config(),
        );
        let outcome = recovered.replay(&entry.id).await.unwrap();
        assert!(outcome.success);
        assert!(h.store.list(10).await.unwrap().is_empty());
        assert_eq!(h.catalog.completions("wf-webhook"), 1);
        assert!(matches!(
            recovered.replay(&entry.id).await,
            Err(VisitflowError::NotFound(_))
        ));
    }
}
