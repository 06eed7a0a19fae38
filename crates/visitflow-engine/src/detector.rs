use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use visitflow_core::error::Result;
use visitflow_core::settings::{FunnelTrigger, NodeSpec};
use visitflow_core::traits::WorkflowCatalog;
use visitflow_core::types::{FunnelSignal, Node, Signal, VisitorContext};

use crate::conditions::url_matches;
use crate::executor::{GraphExecutor, Run};
use crate::frequency::FrequencyGovernor;

/// A started run and the task traversing it.
pub struct RunHandle {
    pub run: Arc<Run>,
    handle: JoinHandle<()>,
}

impl RunHandle {
    /// Wait until the synchronous traversal has finished. Join timers and
    /// enqueued jobs may still be outstanding.
    pub async fn finished(self) -> Arc<Run> {
        if let Err(e) = self.handle.await {
            warn!(run_id = %self.run.id, error = %e, "Run task aborted");
        }
        self.run
    }
}

/// Maps signals onto trigger nodes of active workflows and starts runs.
pub struct TriggerDetector {
    catalog: Arc<dyn WorkflowCatalog>,
    governor: Arc<FrequencyGovernor>,
    executor: GraphExecutor,
}

impl TriggerDetector {
    pub fn new(
        catalog: Arc<dyn WorkflowCatalog>,
        governor: Arc<FrequencyGovernor>,
        executor: GraphExecutor,
    ) -> Self {
        Self {
            catalog,
            governor,
            executor,
        }
    }

    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    pub async fn detect(&self, signal: &Signal, ctx: &VisitorContext) -> Result<Vec<RunHandle>> {
        self.detect_at(signal, ctx, Utc::now()).await
    }

    /// Start one run per matching, non-suppressed trigger. Invalid signals
    /// are logged and start nothing.
    pub async fn detect_at(
        &self,
        signal: &Signal,
        ctx: &VisitorContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunHandle>> {
        if let Err(e) = signal.validate() {
            warn!(site_id = %ctx.site_id, visitor_id = %ctx.visitor_id, error = %e, "Ignoring invalid signal");
            return Ok(Vec::new());
        }

        let workflows = self.catalog.active_workflows(&ctx.site_id).await?;
        let mut started = Vec::new();

        for graph in workflows {
            if !graph.is_active() {
                continue;
            }
            let matched: Vec<Node> = match_signal(graph.triggers().map(|t| (t, graph.spec(&t.id))), signal, ctx)
                .cloned()
                .collect();

            for trigger in matched {
                if !self.governor.try_fire(&graph, &trigger, ctx, now).await {
                    continue;
                }
                debug!(workflow_id = %graph.id(), trigger = %trigger.title, "Trigger fired");
                let run = Arc::new(Run::new(graph.clone(), trigger.id.clone(), ctx.clone()));
                let executor = self.executor.clone();
                let handle = tokio::spawn({
                    let run = run.clone();
                    async move { executor.execute(run).await }
                });
                started.push(RunHandle { run, handle });
            }
        }
        Ok(started)
    }
}

/// Trigger nodes whose type and settings accept `signal`.
pub fn match_signal<'a>(
    triggers: impl Iterator<Item = (&'a Node, Option<&'a NodeSpec>)> + 'a,
    signal: &'a Signal,
    ctx: &'a VisitorContext,
) -> impl Iterator<Item = &'a Node> + 'a {
    triggers.filter_map(move |(node, spec)| {
        let spec = spec?;
        (node.title == signal.trigger_type() && trigger_matches(spec, signal, ctx)).then_some(node)
    })
}

/// Whether a trigger's settings accept a signal of its own type.
pub fn trigger_matches(spec: &NodeSpec, signal: &Signal, ctx: &VisitorContext) -> bool {
    match (spec, signal) {
        (NodeSpec::PageView(m), Signal::PageView) => url_matches(m, &ctx.url),
        (NodeSpec::TimeSpent { seconds }, Signal::TimeSpent { seconds: elapsed }) => elapsed >= seconds,
        (NodeSpec::ScrollDepth { percent }, Signal::ScrollDepth { percent: reached }) => reached >= percent,
        (NodeSpec::ExitIntent, Signal::ExitIntent) => true,
        (NodeSpec::ElementClick { selector }, Signal::ElementClick { selector: clicked }) => {
            selector.trim() == clicked.trim()
        }
        (NodeSpec::Inactivity { seconds }, Signal::Inactivity { seconds: idle }) => idle >= seconds,
        (NodeSpec::CustomEvent { event_name }, Signal::CustomEvent { name }) => event_name == name,
        (NodeSpec::Funnel(filter), Signal::Funnel(event)) => funnel_matches(filter, event, ctx),
        (NodeSpec::Unknown { .. }, _) => true,
        _ => false,
    }
}

fn funnel_matches(filter: &FunnelTrigger, event: &FunnelSignal, ctx: &VisitorContext) -> bool {
    if event.funnel_id.is_empty() || event.event_type.is_empty() {
        return false;
    }
    if filter.funnel_id.as_deref().is_some_and(|id| id != event.funnel_id) {
        return false;
    }
    if filter.event_type.as_deref().is_some_and(|t| t != event.event_type) {
        return false;
    }
    if let (Some(want), Some(got)) = (filter.step_index, event.step_index) {
        if want != got {
            return false;
        }
    }
    if let (Some(minutes), Some(spent)) = (filter.time_threshold_minutes, event.time_spent) {
        if spent > 0 && spent < minutes * 60 {
            return false;
        }
    }
    if !filter.segments.is_empty() {
        let in_segment = filter.segments.iter().any(|segment| {
            ctx.tags.iter().any(|t| t == segment)
                || (segment == "new-visitors" && !ctx.is_returning)
                || (segment == "returning-visitors" && ctx.is_returning)
        });
        if !in_segment {
            return false;
        }
    }
    if let Some(value) = event.value {
        if filter.min_value.is_some_and(|min| value < min) {
            return false;
        }
        if filter.max_value.is_some_and(|max| value > max) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use visitflow_core::event::{EventBus, EventJournal};
    use visitflow_core::types::{Edge, EventKind, Workflow, WorkflowStatus};
    use visitflow_store::{MemoryCatalog, MemoryStore};
    use visitflow_test_utils::{RecordingActionHandler, RecordingJobSink};

    use crate::conditions::ConditionEvaluator;
    use crate::dispatch::ActionDispatcher;

    fn spec(node: &Node) -> NodeSpec {
        NodeSpec::parse(node.kind, &node.title, &node.settings).unwrap()
    }

    fn ctx(url: &str) -> VisitorContext {
        VisitorContext::new("site1", "v1").with_url(url)
    }

    #[test]
    fn test_threshold_triggers() {
        let c = ctx("https://shop.test/");
        let scroll = Node::trigger("s", "Scroll Depth").with_settings(json!({"scrollDepth": 50}));
        assert!(trigger_matches(&spec(&scroll), &Signal::ScrollDepth { percent: 50 }, &c));
        assert!(trigger_matches(&spec(&scroll), &Signal::ScrollDepth { percent: 75 }, &c));
        assert!(!trigger_matches(&spec(&scroll), &Signal::ScrollDepth { percent: 49 }, &c));

        let spent = Node::trigger("t", "Time Spent").with_settings(json!({"seconds": 10}));
        assert!(!trigger_matches(&spec(&spent), &Signal::TimeSpent { seconds: 9 }, &c));
        assert!(trigger_matches(&spec(&spent), &Signal::TimeSpent { seconds: 10 }, &c));

        let idle = Node::trigger("i", "Inactivity");
        assert!(!trigger_matches(&spec(&idle), &Signal::Inactivity { seconds: 29 }, &c));
        assert!(trigger_matches(&spec(&idle), &Signal::Inactivity { seconds: 30 }, &c));
    }

    #[test]
    fn test_page_view_and_custom_event() {
        let pv = Node::trigger("p", "Page View").with_settings(json!({"url": "/pricing"}));
        assert!(trigger_matches(&spec(&pv), &Signal::PageView, &ctx("https://shop.test/pricing/enterprise")));
        assert!(!trigger_matches(&spec(&pv), &Signal::PageView, &ctx("https://shop.test/blog")));
        assert!(!trigger_matches(&spec(&pv), &Signal::ExitIntent, &ctx("https://shop.test/pricing")));

        let ce = Node::trigger("c", "Custom Event").with_settings(json!({"customEventName": "signup"}));
        let c = ctx("/");
        assert!(trigger_matches(&spec(&ce), &Signal::CustomEvent { name: "signup".into() }, &c));
        assert!(!trigger_matches(&spec(&ce), &Signal::CustomEvent { name: "login".into() }, &c));
    }

    #[test]
    fn test_funnel_filters() {
        let node = Node::trigger("f", "Funnel").with_settings(json!({
            "funnelId": "checkout",
            "eventType": "dropoff",
            "userSegment": "vip, returning-visitors",
            "minValue": 10
        }));
        let filter = spec(&node);
        let event = FunnelSignal {
            funnel_id: "checkout".into(),
            event_type: "dropoff".into(),
            value: Some(25.0),
            ..Default::default()
        };
        let mut c = ctx("/cart");
        assert!(!trigger_matches(&filter, &Signal::Funnel(event.clone()), &c));

        c.is_returning = true;
        assert!(trigger_matches(&filter, &Signal::Funnel(event.clone()), &c));

        c.is_returning = false;
        c.tags.push("vip".into());
        assert!(trigger_matches(&filter, &Signal::Funnel(event.clone()), &c));

        let cheap = FunnelSignal {
            value: Some(5.0),
            ..event.clone()
        };
        assert!(!trigger_matches(&filter, &Signal::Funnel(cheap), &c));

        let other = FunnelSignal {
            funnel_id: "signup".into(),
            ..event
        };
        assert!(!trigger_matches(&filter, &Signal::Funnel(other), &c));
    }

    struct Fixture {
        detector: TriggerDetector,
        store: Arc<MemoryStore>,
        local: Arc<RecordingActionHandler>,
    }

    async fn fixture(workflow: Workflow) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.upsert(workflow).await.unwrap();
        let local = Arc::new(RecordingActionHandler::new());
        let governor = Arc::new(FrequencyGovernor::new(store.clone(), 86_400));
        let executor = GraphExecutor::new(
            Arc::new(EventJournal::new(store.clone(), Arc::new(EventBus::default()))),
            Arc::new(ConditionEvaluator::new(store.clone(), store.clone(), 300)),
            governor.clone(),
            Arc::new(ActionDispatcher::new(local.clone(), Arc::new(RecordingJobSink::new()))),
        );
        Fixture {
            detector: TriggerDetector::new(catalog, governor, executor),
            store,
            local,
        }
    }

    fn workflow(status: WorkflowStatus) -> Workflow {
        Workflow {
            id: "wf1".into(),
            site_id: "site1".into(),
            name: "exit offer".into(),
            status,
            nodes: vec![
                Node::trigger("t", "Exit Intent"),
                Node::condition("cap", "Frequency Cap").with_settings(json!({"cooldownSeconds": 60})),
                Node::action("m", "Show Modal"),
            ],
            edges: vec![Edge::new("t", "cap"), Edge::new("cap", "m")],
        }
    }

    #[tokio::test]
    async fn test_detect_starts_run_and_respects_cooldown() {
        let f = fixture(workflow(WorkflowStatus::Active)).await;
        let c = ctx("https://shop.test/");
        let t0 = Utc::now();

        let runs = f.detector.detect_at(&Signal::ExitIntent, &c, t0).await.unwrap();
        assert_eq!(runs.len(), 1);
        for r in runs {
            assert!(r.finished().await.is_completed());
        }
        assert_eq!(f.local.performed().len(), 1);

        let suppressed = f
            .detector
            .detect_at(&Signal::ExitIntent, &c, t0 + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert!(suppressed.is_empty());

        let again = f
            .detector
            .detect_at(&Signal::ExitIntent, &c, t0 + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_and_invalid_signals_start_nothing() {
        let f = fixture(workflow(WorkflowStatus::Active)).await;
        let c = ctx("https://shop.test/");
        assert!(f.detector.detect(&Signal::PageView, &c).await.unwrap().is_empty());
        let invalid = Signal::ScrollDepth { percent: 140 };
        assert!(f.detector.detect(&invalid, &c).await.unwrap().is_empty());

        use visitflow_core::traits::EventRecorder;
        let events = f.store.query("wf1", Default::default()).await.unwrap();
        assert!(events.iter().all(|e| e.kind != EventKind::Trigger));
    }

    #[tokio::test]
    async fn test_paused_workflow_is_ignored() {
        let f = fixture(workflow(WorkflowStatus::Paused)).await;
        let runs = f
            .detector
            .detect(&Signal::ExitIntent, &ctx("https://shop.test/"))
            .await
            .unwrap();
        assert!(runs.is_empty());
    }
}
