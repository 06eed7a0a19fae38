//! Test doubles and fixtures shared by the Visitflow crates.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::json;

use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::settings::LocalAction;
use visitflow_core::traits::{
    EmailMessage, EmailProvider, HttpRequest, HttpResponse, HttpTransport, JobSink,
    LocalActionHandler,
};
use visitflow_core::types::{
    Edge, EventKind, Job, LifecycleEvent, Node, VisitorContext, Workflow, WorkflowStatus,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event kinds in recorded order.
pub fn kinds(events: &[LifecycleEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

/// Whether `wanted` appears in `events` as an ordered subsequence.
pub fn contains_in_order(events: &[EventKind], wanted: &[EventKind]) -> bool {
    let mut it = events.iter();
    wanted.iter().all(|w| it.any(|e| e == w))
}

// ── Local actions ───────────────────────────────────────────────

/// Records every local action it is asked to perform.
#[derive(Default)]
pub struct RecordingActionHandler {
    performed: Mutex<Vec<LocalAction>>,
    failure: Option<String>,
}

impl RecordingActionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler whose every action fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            performed: Mutex::new(Vec::new()),
            failure: Some(message.to_string()),
        }
    }

    /// Successfully performed actions.
    pub fn performed(&self) -> Vec<LocalAction> {
        lock(&self.performed).clone()
    }
}

impl LocalActionHandler for RecordingActionHandler {
    fn perform(&self, action: &LocalAction, _ctx: &VisitorContext) -> BoxFuture<'_, Result<()>> {
        let action = action.clone();
        Box::pin(async move {
            if let Some(message) = &self.failure {
                return Err(VisitflowError::delivery("local", message.clone()));
            }
            lock(&self.performed).push(action);
            Ok(())
        })
    }
}

// ── Job sink ────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingJobSink {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingJobSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.jobs).clone()
    }
}

impl JobSink for RecordingJobSink {
    fn enqueue(&self, job: Job) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            lock(&self.jobs).push(job);
            Ok(())
        })
    }
}

// ── HTTP ────────────────────────────────────────────────────────

/// Replays scripted responses in order; repeats the last one once exhausted.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    fallback: HttpResponse,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<HttpResponse>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: ok(200, "ok"),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always answers 200.
    pub fn ok() -> Self {
        Self::new(Vec::new())
    }

    /// `failures` network errors followed by a 200.
    pub fn failing_then_ok(failures: usize) -> Self {
        let mut script: Vec<Result<HttpResponse>> = (0..failures)
            .map(|i| Err(VisitflowError::Http(format!("connection reset (attempt {})", i + 1))))
            .collect();
        script.push(Ok(ok(200, "ok")));
        Self::new(script)
    }

    /// Every call answers with `status`.
    pub fn always(status: u16, body: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ok(status, body),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }
}

fn ok(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        body: body.to_string(),
    }
}

impl HttpTransport for ScriptedTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            lock(&self.requests).push(request);
            match lock(&self.script).pop_front() {
                Some(next) => next,
                None => Ok(self.fallback.clone()),
            }
        })
    }
}

// ── Email ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingEmailProvider {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingEmailProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        lock(&self.sent).clone()
    }
}

impl EmailProvider for RecordingEmailProvider {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, message: EmailMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            lock(&self.sent).push(message);
            Ok(())
        })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Page View "/pricing" → URL Path contains "/pricing" → Branch Split 70/30
/// → Show Modal (A) | Show Banner (B).
pub fn pricing_workflow() -> Workflow {
    Workflow {
        id: "wf-pricing".into(),
        site_id: "site-1".into(),
        name: "Pricing page offer".into(),
        status: WorkflowStatus::Active,
        nodes: vec![
            Node::trigger("trigger", "Page View").with_settings(json!({"url": "/pricing"})),
            Node::condition("on-pricing", "URL Path")
                .with_settings(json!({"url": "/pricing", "urlMatchType": "contains"})),
            Node::condition("split", "Branch Split")
                .with_settings(json!({"variantAPercent": 70, "variantBPercent": 30})),
            Node::action("modal", "Show Modal")
                .with_settings(json!({"modalTitle": "Talk to sales", "modalContent": "Enterprise plans"})),
            Node::action("banner", "Show Banner").with_settings(json!({"bannerContent": "20% off annual"})),
        ],
        edges: vec![
            Edge::new("trigger", "on-pricing"),
            Edge::new("on-pricing", "split"),
            Edge::labeled("split", "modal", "A"),
            Edge::labeled("split", "banner", "B"),
        ],
    }
}

/// Custom Event "signup" → Webhook to `url` → Add Tag "signed-up".
pub fn webhook_workflow(url: &str) -> Workflow {
    Workflow {
        id: "wf-webhook".into(),
        site_id: "site-1".into(),
        name: "Signup webhook".into(),
        status: WorkflowStatus::Active,
        nodes: vec![
            Node::trigger("trigger", "Custom Event").with_settings(json!({"customEventName": "signup"})),
            Node::action("hook", "Webhook").with_settings(json!({
                "webhookUrl": url,
                "webhookMethod": "POST",
                "webhookHeaders": {"X-Source": "{{siteId}}"},
                "webhookBody": "{\"visitor\": \"{{visitorId}}\", \"plan\": \"{{localStorage.plan}}\"}",
                "localStorageData": [{"localStorageKey": "plan", "payloadKey": "plan"}]
            })),
            Node::action("tag", "Add Tag").with_settings(json!({"tagName": "signed-up"})),
        ],
        edges: vec![Edge::new("trigger", "hook"), Edge::new("hook", "tag")],
    }
}

/// A visitor on the pricing site at `url`.
pub fn visitor(url: &str) -> VisitorContext {
    VisitorContext::new("site-1", "visitor-1").with_url(url)
}

/// Write `contents` to a config file in a fresh temp dir.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {}", e));
    let path = dir.path().join("visitflow.toml");
    std::fs::write(&path, contents).unwrap_or_else(|e| panic!("write config: {}", e));
    (dir, path)
}
