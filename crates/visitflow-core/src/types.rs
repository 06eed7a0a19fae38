use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VisitflowError};

/// Unique identifier for one execution of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Workflow definition ─────────────────────────────────────────

/// The three node kinds composing a workflow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(alias = "trigger")]
    Trigger,
    #[serde(alias = "condition")]
    Condition,
    #[serde(alias = "action")]
    Action,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "Trigger",
            Self::Condition => "Condition",
            Self::Action => "Action",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub title: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            settings: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn trigger(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Trigger, title)
    }

    pub fn condition(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Condition, title)
    }

    pub fn action(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Action, title)
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }

    pub fn labeled(
        source: impl Into<String>,
        target: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: Some(label.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Paused,
    Draft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub site_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

// ── Visitor context & signals ───────────────────────────────────

/// Attributes of a visitor who has identified themselves to the site.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl IdentifiedUser {
    /// Look up a named field as a string, falling back to free-form attributes.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "id" => self.id.clone(),
            "email" => self.email.clone(),
            "name" => self.name.clone(),
            other => self.attributes.get(other).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
        }
    }
}

/// Everything the engine knows about the visitor at the moment a signal arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorContext {
    pub site_id: String,
    pub visitor_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub referrer: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub is_returning: bool,
    #[serde(default)]
    pub identified_user: Option<IdentifiedUser>,
    #[serde(default)]
    pub local_storage: HashMap<String, String>,
    /// Tags the page already knows the visitor carries.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Visitor-local wall clock, used by time-window conditions.
    #[serde(default = "local_now")]
    pub now: DateTime<FixedOffset>,
}

fn local_now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

impl VisitorContext {
    pub fn new(site_id: impl Into<String>, visitor_id: impl Into<String>) -> Self {
        let visitor_id = visitor_id.into();
        Self {
            site_id: site_id.into(),
            session_id: format!("{}-session", visitor_id),
            visitor_id,
            url: String::new(),
            referrer: String::new(),
            user_agent: String::new(),
            is_returning: false,
            identified_user: None,
            local_storage: HashMap::new(),
            tags: Vec::new(),
            now: local_now(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn session_scope(&self) -> StorageScope {
        StorageScope::Session {
            visitor_id: self.visitor_id.clone(),
            session_id: self.session_id.clone(),
        }
    }

    pub fn durable_scope(&self) -> StorageScope {
        StorageScope::Durable {
            visitor_id: self.visitor_id.clone(),
        }
    }
}

/// Upstream funnel event forwarded to funnel-type triggers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelSignal {
    pub funnel_id: String,
    pub event_type: String,
    #[serde(default)]
    pub step_index: Option<u32>,
    #[serde(default)]
    pub time_spent: Option<u64>,
    #[serde(default)]
    pub value: Option<f64>,
}

/// Typed environment signal produced by the page or by trigger timers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    PageView,
    TimeSpent { seconds: u64 },
    ScrollDepth { percent: u32 },
    ExitIntent,
    ElementClick { selector: String },
    Inactivity { seconds: u64 },
    CustomEvent { name: String },
    Funnel(FunnelSignal),
}

impl Signal {
    /// The trigger node title this signal can fire.
    pub fn trigger_type(&self) -> &'static str {
        match self {
            Self::PageView => "Page View",
            Self::TimeSpent { .. } => "Time Spent",
            Self::ScrollDepth { .. } => "Scroll Depth",
            Self::ExitIntent => "Exit Intent",
            Self::ElementClick { .. } => "Element Click",
            Self::Inactivity { .. } => "Inactivity",
            Self::CustomEvent { .. } => "Custom Event",
            Self::Funnel(_) => "Funnel",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ScrollDepth { percent } if *percent > 100 => Err(
                VisitflowError::InvalidSignal(format!("scroll depth {}% out of range", percent)),
            ),
            Self::ElementClick { selector } if selector.trim().is_empty() => Err(
                VisitflowError::InvalidSignal("element click without selector".into()),
            ),
            Self::CustomEvent { name } if name.trim().is_empty() => Err(
                VisitflowError::InvalidSignal("custom event without name".into()),
            ),
            Self::Funnel(f) if f.funnel_id.trim().is_empty() => Err(
                VisitflowError::InvalidSignal("funnel event without funnel_id".into()),
            ),
            _ => Ok(()),
        }
    }
}

// ── Persistence scopes & keys ───────────────────────────────────

/// Lifetime of a stored frequency/cooldown/cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageScope {
    Session {
        visitor_id: String,
        session_id: String,
    },
    Durable {
        visitor_id: String,
    },
}

impl StorageScope {
    /// Stable string form used as a storage partition.
    pub fn partition(&self) -> String {
        match self {
            Self::Session {
                visitor_id,
                session_id,
            } => format!("session:{}:{}", visitor_id, session_id),
            Self::Durable { visitor_id } => format!("durable:{}", visitor_id),
        }
    }
}

/// Deterministic key for frequency and cooldown state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrequencyKey(String);

impl FrequencyKey {
    pub fn action(workflow_id: &str, node_id: &str) -> Self {
        Self(format!("visitflow_action_{}_{}", workflow_id, node_id))
    }

    pub fn cooldown(workflow_id: &str, trigger_type: &str) -> Self {
        Self(format!("visitflow_cooldown_{}_{}", workflow_id, trigger_type))
    }

    pub fn funnel_gate(workflow_id: &str) -> Self {
        Self(format!("visitflow_funnel_shown_{}", workflow_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ── Lifecycle events ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Trigger")]
    Trigger,
    #[serde(rename = "Step Entered")]
    StepEntered,
    #[serde(rename = "Condition Evaluated")]
    ConditionEvaluated,
    #[serde(rename = "Step Completed")]
    StepCompleted,
    #[serde(rename = "Action Started")]
    ActionStarted,
    #[serde(rename = "Action Executed")]
    ActionExecuted,
    #[serde(rename = "Action Failed")]
    ActionFailed,
    #[serde(rename = "Action Skipped")]
    ActionSkipped,
    #[serde(rename = "Step Failed")]
    StepFailed,
    #[serde(rename = "Workflow Completed")]
    WorkflowCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "Trigger",
            Self::StepEntered => "Step Entered",
            Self::ConditionEvaluated => "Condition Evaluated",
            Self::StepCompleted => "Step Completed",
            Self::ActionStarted => "Action Started",
            Self::ActionExecuted => "Action Executed",
            Self::ActionFailed => "Action Failed",
            Self::ActionSkipped => "Action Skipped",
            Self::StepFailed => "Step Failed",
            Self::WorkflowCompleted => "Workflow Completed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a run, carried by every event and every job it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRef {
    pub run_id: RunId,
    pub workflow_id: String,
    pub site_id: String,
    pub visitor_id: String,
}

/// One immutable traversal step of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub run_id: RunId,
    pub workflow_id: String,
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub visitor_id: String,
    pub node_id: String,
    pub node_title: String,
    pub node_type: NodeKind,
    #[serde(rename = "event", alias = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub step_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(run: &RunRef, node: &Node, kind: EventKind, step_order: Option<u32>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            site_id: run.site_id.clone(),
            visitor_id: run.visitor_id.clone(),
            node_id: node.id.clone(),
            node_title: node.title.clone(),
            node_type: node.kind,
            kind,
            step_order,
            success: None,
            execution_time_ms: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn with_elapsed(mut self, ms: u64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Inclusive time bounds for event queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| *ts >= s) && self.end.map_or(true, |e| *ts <= e)
    }

    /// Bounds given as RFC 3339 timestamps or `YYYY-MM-DD` dates. A date-only
    /// end bound covers the whole day. Blank bounds are open.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        Ok(Self {
            start: parse_bound(start, false)?,
            end: parse_bound(end, true)?,
        })
    }
}

fn parse_bound(raw: Option<&str>, end: bool) -> Result<Option<DateTime<Utc>>> {
    let Some(s) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| VisitflowError::Validation(format!("invalid date '{}'", s)))?;
    let at = if end {
        day.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        day.and_hms_opt(0, 0, 0)
    };
    Ok(at.map(|t| t.and_utc()))
}

// ── Jobs & dead letters ─────────────────────────────────────────

/// Authoritative action queued for the execution worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub run_id: RunId,
    pub workflow_id: String,
    pub node_id: String,
    pub site_id: String,
    pub visitor_id: String,
    #[serde(default)]
    pub identified_user: Option<IdentifiedUser>,
    #[serde(default, rename = "localStorageData")]
    pub local_storage: HashMap<String, String>,
    #[serde(default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(run: &RunRef, node_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            node_id: node_id.into(),
            site_id: run.site_id.clone(),
            visitor_id: run.visitor_id.clone(),
            identified_user: None,
            local_storage: HashMap::new(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn run_ref(&self) -> RunRef {
        RunRef {
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            site_id: self.site_id.clone(),
            visitor_id: self.visitor_id.clone(),
        }
    }
}

/// Terminal record of an action that could not be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub id: String,
    pub action: String,
    pub payload: Job,
    pub reason: String,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn new(action: impl Into<String>, payload: Job, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
            reason: reason.into(),
            attempts,
            enqueued_at: Utc::now(),
        }
    }
}

/// Result of running one authoritative action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }
}
