//! Per-visitor traversal of a workflow DAG.
//!
//! A run starts at a trigger node and walks outgoing edges. Conditions gate
//! their path, Branch Splits pick exactly one outgoing edge, Joins wait for
//! every inbound branch (or a timeout), and all other nodes fan out to every
//! outgoing edge as independent sub-traversals of the same run. Every step is
//! appended to the event journal; a run emits "Workflow Completed" once, the
//! first time any path reaches a terminal node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use visitflow_core::event::EventJournal;
use visitflow_core::graph::WorkflowGraph;
use visitflow_core::settings::NodeSpec;
use visitflow_core::types::{EventKind, LifecycleEvent, Node, NodeKind, RunId, RunRef, VisitorContext};

use crate::branch::{pick_variant, select_edge};
use crate::conditions::ConditionEvaluator;
use crate::dispatch::{ActionDispatcher, Dispatch};
use crate::frequency::FrequencyGovernor;
use crate::join::{JoinArrival, JoinKey, JoinStateTable};

/// One execution of a workflow for one visitor interaction.
pub struct Run {
    pub id: RunId,
    pub graph: Arc<WorkflowGraph>,
    pub ctx: VisitorContext,
    pub trigger_id: String,
    pub started_at: DateTime<Utc>,
    completed: AtomicBool,
}

impl Run {
    pub fn new(graph: Arc<WorkflowGraph>, trigger_id: impl Into<String>, ctx: VisitorContext) -> Self {
        Self {
            id: RunId::new(),
            graph,
            ctx,
            trigger_id: trigger_id.into(),
            started_at: Utc::now(),
            completed: AtomicBool::new(false),
        }
    }

    pub fn run_ref(&self) -> RunRef {
        RunRef {
            run_id: self.id.clone(),
            workflow_id: self.graph.id().to_string(),
            site_id: self.ctx.site_id.clone(),
            visitor_id: self.ctx.visitor_id.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// True for exactly one caller.
    fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::SeqCst)
    }
}

/// Walks workflow graphs. Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct GraphExecutor {
    journal: Arc<EventJournal>,
    conditions: Arc<ConditionEvaluator>,
    governor: Arc<FrequencyGovernor>,
    dispatcher: Arc<ActionDispatcher>,
    joins: Arc<JoinStateTable>,
    shutdown: CancellationToken,
}

impl GraphExecutor {
    pub fn new(
        journal: Arc<EventJournal>,
        conditions: Arc<ConditionEvaluator>,
        governor: Arc<FrequencyGovernor>,
        dispatcher: Arc<ActionDispatcher>,
    ) -> Self {
        Self {
            journal,
            conditions,
            governor,
            dispatcher,
            joins: Arc::new(JoinStateTable::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    pub fn joins(&self) -> &Arc<JoinStateTable> {
        &self.joins
    }

    /// Stop pending waits and join timers. Enqueued jobs are unaffected.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.joins.clear();
    }

    /// Emit the "Trigger" event and traverse from the trigger node to completion.
    pub async fn execute(&self, run: Arc<Run>) {
        let _track = self.joins.track(&run.id);
        let Some(trigger) = run.graph.node(&run.trigger_id).cloned() else {
            warn!(workflow_id = %run.graph.id(), trigger_id = %run.trigger_id, "Trigger node not found");
            return;
        };
        info!(
            workflow_id = %run.graph.id(),
            run_id = %run.id,
            visitor_id = %run.ctx.visitor_id,
            trigger = %trigger.title,
            "Run started"
        );
        self.emit(&run, &trigger, EventKind::Trigger, |e| e.with_success(true))
            .await;
        self.advance(run, trigger.id).await;
    }

    fn emit<'a>(
        &'a self,
        run: &'a Run,
        node: &'a Node,
        kind: EventKind,
        decorate: impl FnOnce(LifecycleEvent) -> LifecycleEvent + Send + 'a,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let event = LifecycleEvent::new(&run.run_ref(), node, kind, run.graph.step_order(&node.id));
            self.journal.append(decorate(event)).await;
        })
    }

    /// Follow every outgoing edge of `node_id`, or complete the run at a leaf.
    fn advance(&self, run: Arc<Run>, node_id: String) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            let targets: Vec<String> = run
                .graph
                .outgoing(&node_id)
                .into_iter()
                .map(|e| e.target.clone())
                .collect();
            if targets.is_empty() {
                this.complete(&run, &node_id).await;
                return;
            }
            let branches = targets
                .into_iter()
                .map(|target| this.visit(run.clone(), target));
            join_all(branches).await;
        })
    }

    fn visit(&self, run: Arc<Run>, node_id: String) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move { this.visit_node(run, node_id).await })
    }

    async fn visit_node(&self, run: Arc<Run>, node_id: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let graph = run.graph.clone();
        let (Some(node), Some(spec)) = (graph.node(&node_id), graph.spec(&node_id)) else {
            warn!(workflow_id = %graph.id(), node_id = %node_id, "Edge target missing, path ends");
            return;
        };

        self.emit(&run, node, EventKind::StepEntered, |e| e).await;

        match node.kind {
            NodeKind::Condition => {
                if let NodeSpec::Join { timeout_secs } = spec {
                    self.arrive_at_join(run, node, *timeout_secs).await;
                    return;
                }
                let passed = self.conditions.evaluate(spec, &run.ctx).await;
                self.emit(&run, node, EventKind::ConditionEvaluated, |e| e.with_success(passed))
                    .await;
                if !passed {
                    debug!(run_id = %run.id, node_id = %node.id, title = %node.title, "Condition failed, path stops");
                    self.emit(&run, node, EventKind::StepFailed, |e| {
                        e.with_success(false).with_detail("condition not met")
                    })
                    .await;
                    return;
                }
                self.emit(&run, node, EventKind::StepCompleted, |e| e.with_success(true))
                    .await;

                if let NodeSpec::BranchSplit(split) = spec {
                    let variant = pick_variant(&split.weights, rand::random::<f64>());
                    let edges = graph.outgoing(&node.id);
                    match select_edge(split, variant, &edges) {
                        Some(edge) => {
                            debug!(run_id = %run.id, node_id = %node.id, variant, target = %edge.target, "Branch selected");
                            self.visit(run.clone(), edge.target.clone()).await;
                        }
                        None => self.complete(&run, &node.id).await,
                    }
                    return;
                }
            }
            NodeKind::Action => {
                if let NodeSpec::Wait { seconds } = spec {
                    if !self.wait(*seconds).await {
                        return;
                    }
                } else {
                    self.run_action(&run, node, spec).await;
                }
                self.emit(&run, node, EventKind::StepCompleted, |e| e).await;
            }
            NodeKind::Trigger => {
                self.emit(&run, node, EventKind::StepCompleted, |e| e).await;
            }
        }

        self.advance(run, node_id).await;
    }

    async fn run_action(&self, run: &Arc<Run>, node: &Node, spec: &NodeSpec) {
        let workflow_id = run.graph.id();
        let frequency = run.graph.frequency(&node.id);

        if !self
            .governor
            .action_allowed(&run.ctx, workflow_id, &node.id, frequency)
            .await
        {
            debug!(run_id = %run.id, node_id = %node.id, ?frequency, "Action skipped by frequency policy");
            self.emit(run, node, EventKind::ActionSkipped, |e| e.with_detail("frequency_limit"))
                .await;
            return;
        }

        self.emit(run, node, EventKind::ActionStarted, |e| e).await;
        match self
            .dispatcher
            .dispatch(&run.run_ref(), &run.ctx, node, spec)
            .await
        {
            Ok(Dispatch::Completed { elapsed_ms }) => {
                self.emit(run, node, EventKind::ActionExecuted, |e| {
                    e.with_success(true).with_elapsed(elapsed_ms)
                })
                .await;
                self.governor
                    .record_action(&run.ctx, workflow_id, &node.id, frequency)
                    .await;
            }
            Ok(Dispatch::Enqueued { .. }) => {
                self.governor
                    .record_action(&run.ctx, workflow_id, &node.id, frequency)
                    .await;
            }
            Err(e) => {
                warn!(run_id = %run.id, node_id = %node.id, error = %e, "Action failed");
                self.emit(run, node, EventKind::ActionFailed, |ev| {
                    ev.with_success(false).with_detail(e.to_string())
                })
                .await;
            }
        }
    }

    /// Sleep for a Wait action. Returns false if shut down meanwhile.
    async fn wait(&self, seconds: u64) -> bool {
        if seconds == 0 {
            return true;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => true,
        }
    }

    async fn arrive_at_join(&self, run: Arc<Run>, node: &Node, timeout_secs: u64) {
        let key = JoinKey::new(run.graph.id(), &node.id, &run.id);
        let required = run.graph.inbound_count(&node.id);
        self.emit(&run, node, EventKind::ConditionEvaluated, |e| e.with_success(true))
            .await;

        match self.joins.arrive(&key, required) {
            JoinArrival::Wait { received, required } => {
                debug!(run_id = %run.id, node_id = %node.id, received, required, "Join waiting");
                if timeout_secs > 0 {
                    if let Some(token) = self.joins.arm_timer(&key) {
                        self.spawn_join_timer(run, node.clone(), key, token, timeout_secs);
                    }
                }
            }
            JoinArrival::Release => {
                self.release_join(run, node, "all branches arrived").await;
            }
            JoinArrival::AlreadyReleased => {
                debug!(run_id = %run.id, node_id = %node.id, "Join already released, late branch ends");
            }
        }
    }

    fn spawn_join_timer(
        &self,
        run: Arc<Run>,
        node: Node,
        key: JoinKey,
        token: CancellationToken,
        timeout_secs: u64,
    ) {
        let this = self.clone();
        let track = self.joins.track(&run.id);
        tokio::spawn(async move {
            let _track = track;
            tokio::select! {
                _ = token.cancelled() => {}
                _ = this.shutdown.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                    if this.joins.expire(&key) {
                        info!(run_id = %run.id, node_id = %node.id, timeout_secs, "Join timed out, continuing");
                        this.release_join(run, &node, "timeout").await;
                    }
                }
            }
        });
    }

    async fn release_join(&self, run: Arc<Run>, node: &Node, reason: &'static str) {
        self.emit(&run, node, EventKind::StepCompleted, |e| {
            e.with_success(true).with_detail(reason)
        })
        .await;
        self.advance(run, node.id.clone()).await;
    }

    async fn complete(&self, run: &Run, node_id: &str) {
        if !run.mark_completed() {
            return;
        }
        if let Some(node) = run.graph.node(node_id) {
            self.emit(run, node, EventKind::WorkflowCompleted, |e| e.with_success(true))
                .await;
        }
        info!(workflow_id = %run.graph.id(), run_id = %run.id, "Run completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use visitflow_core::event::EventBus;
    use visitflow_core::types::{Edge, Workflow, WorkflowStatus};
    use visitflow_store::MemoryStore;
    use visitflow_test_utils::{kinds, RecordingActionHandler, RecordingJobSink};

    struct Harness {
        executor: GraphExecutor,
        store: Arc<MemoryStore>,
        local: Arc<RecordingActionHandler>,
        jobs: Arc<RecordingJobSink>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let local = Arc::new(RecordingActionHandler::new());
        let jobs = Arc::new(RecordingJobSink::new());
        let journal = Arc::new(EventJournal::new(store.clone(), Arc::new(EventBus::default())));
        let executor = GraphExecutor::new(
            journal,
            Arc::new(ConditionEvaluator::new(store.clone(), store.clone(), 300)),
            Arc::new(FrequencyGovernor::new(store.clone(), 0)),
            Arc::new(ActionDispatcher::new(local.clone(), jobs.clone())),
        );
        Harness {
            executor,
            store,
            local,
            jobs,
        }
    }

    fn graph(nodes: Vec<Node>, edges: Vec<Edge>) -> Arc<WorkflowGraph> {
        Arc::new(
            WorkflowGraph::new(Workflow {
                id: "wf1".into(),
                site_id: "site1".into(),
                name: "test".into(),
                status: WorkflowStatus::Active,
                nodes,
                edges,
            })
            .unwrap(),
        )
    }

    fn ctx() -> VisitorContext {
        VisitorContext::new("site1", "v1").with_url("https://shop.test/pricing")
    }

    async fn run(h: &Harness, g: Arc<WorkflowGraph>) -> Arc<Run> {
        let run = Arc::new(Run::new(g, "t", ctx()));
        h.executor.execute(run.clone()).await;
        run
    }

    async fn events(h: &Harness, run: &Run) -> Vec<LifecycleEvent> {
        use visitflow_core::traits::EventRecorder;
        h.store
            .query(run.graph.id(), Default::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.run_id == run.id)
            .collect()
    }

    #[tokio::test]
    async fn test_failed_condition_stops_path() {
        let h = harness();
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::condition("c", "URL Path").with_settings(json!({"url": "/checkout"})),
                Node::action("m", "Show Modal"),
            ],
            vec![Edge::new("t", "c"), Edge::new("c", "m")],
        );
        let r = run(&h, g).await;
        let evs = events(&h, &r).await;
        assert_eq!(
            kinds(&evs),
            vec![
                EventKind::Trigger,
                EventKind::StepEntered,
                EventKind::ConditionEvaluated,
                EventKind::StepFailed
            ]
        );
        assert_eq!(evs[2].success, Some(false));
        assert!(h.local.performed().is_empty());
        assert!(!r.is_completed());
    }

    #[tokio::test]
    async fn test_fan_out_completes_once() {
        let h = harness();
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("a", "Show Modal"),
                Node::action("b", "Show Banner"),
                Node::action("c", "Track Event").with_settings(json!({"eventName": "x"})),
            ],
            vec![Edge::new("t", "a"), Edge::new("t", "b"), Edge::new("t", "c")],
        );
        let r = run(&h, g).await;
        let evs = events(&h, &r).await;
        assert_eq!(h.local.performed().len(), 3);
        let completed = evs
            .iter()
            .filter(|e| e.kind == EventKind::WorkflowCompleted)
            .count();
        assert_eq!(completed, 1);
        assert!(r.is_completed());
    }

    #[tokio::test]
    async fn test_events_per_node_are_ordered() {
        let h = harness();
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("a", "Show Modal"),
                Node::action("b", "Show Banner"),
            ],
            vec![Edge::new("t", "a"), Edge::new("t", "b")],
        );
        let r = run(&h, g).await;
        let evs = events(&h, &r).await;
        for node in ["a", "b"] {
            let seq: Vec<EventKind> = evs
                .iter()
                .filter(|e| e.node_id == node && e.kind != EventKind::WorkflowCompleted)
                .map(|e| e.kind)
                .collect();
            assert_eq!(
                seq,
                vec![
                    EventKind::StepEntered,
                    EventKind::ActionStarted,
                    EventKind::ActionExecuted,
                    EventKind::StepCompleted
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_join_continues_once_after_both_branches() {
        let h = harness();
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("a", "Show Modal"),
                Node::action("b", "Show Banner"),
                Node::condition("j", "Join"),
                Node::action("after", "Track Event").with_settings(json!({"eventName": "joined"})),
            ],
            vec![
                Edge::new("t", "a"),
                Edge::new("t", "b"),
                Edge::new("a", "j"),
                Edge::new("b", "j"),
                Edge::new("j", "after"),
            ],
        );
        let r = run(&h, g).await;
        let evs = events(&h, &r).await;

        let entered_join = evs
            .iter()
            .filter(|e| e.node_id == "j" && e.kind == EventKind::StepEntered)
            .count();
        assert_eq!(entered_join, 2);
        let after_runs = h
            .local
            .performed()
            .iter()
            .filter(|a| matches!(a, visitflow_core::settings::LocalAction::TrackEvent { .. }))
            .count();
        assert_eq!(after_runs, 1);
        assert_eq!(h.executor.joins().pending(), 0);
        // The run is over, so its released join is forgotten
        assert_eq!(h.executor.joins().tombstones(), 0);
        assert!(r.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_releases_partial_arrivals() {
        let h = harness();
        // Only branch "a" reaches the join; "b" is stopped by a failing condition.
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("a", "Show Modal"),
                Node::condition("b", "URL Path").with_settings(json!({"url": "/nowhere"})),
                Node::condition("j", "Join").with_settings(json!({"joinTimeoutSeconds": 5})),
                Node::action("after", "Track Event").with_settings(json!({"eventName": "joined"})),
            ],
            vec![
                Edge::new("t", "a"),
                Edge::new("t", "b"),
                Edge::new("a", "j"),
                Edge::new("b", "j"),
                Edge::new("j", "after"),
            ],
        );
        let r = run(&h, g).await;
        assert!(!r.is_completed());
        assert_eq!(h.executor.joins().pending(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(r.is_completed());
        assert_eq!(h.executor.joins().pending(), 0);
        let evs = events(&h, &r).await;
        assert!(evs
            .iter()
            .any(|e| e.node_id == "j" && e.detail.as_deref() == Some("timeout")));
    }

    #[tokio::test]
    async fn test_authoritative_action_enqueues_without_executed_event() {
        let h = harness();
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("w", "Webhook").with_settings(json!({"webhookUrl": "https://hooks.test"})),
            ],
            vec![Edge::new("t", "w")],
        );
        let r = run(&h, g).await;
        let evs = events(&h, &r).await;
        assert_eq!(h.jobs.jobs().len(), 1);
        assert_eq!(h.jobs.jobs()[0].run_id, r.id);
        assert!(evs.iter().any(|e| e.kind == EventKind::ActionStarted));
        assert!(!evs.iter().any(|e| e.kind == EventKind::ActionExecuted));
    }

    #[tokio::test]
    async fn test_once_per_session_action_is_skipped_second_time() {
        let h = harness();
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("m", "Show Modal").with_settings(json!({"frequency": "once_per_session"})),
            ],
            vec![Edge::new("t", "m")],
        );
        run(&h, g.clone()).await;
        let second = run(&h, g).await;
        let evs = events(&h, &second).await;
        assert_eq!(h.local.performed().len(), 1);
        let skipped = evs.iter().find(|e| e.kind == EventKind::ActionSkipped).unwrap();
        assert_eq!(skipped.detail.as_deref(), Some("frequency_limit"));
        assert!(second.is_completed());
    }

    #[tokio::test]
    async fn test_failed_local_action_does_not_block_siblings() {
        let h = Harness {
            local: Arc::new(RecordingActionHandler::failing("no target")),
            ..harness()
        };
        let executor = GraphExecutor::new(
            h.executor.journal().clone(),
            Arc::new(ConditionEvaluator::new(h.store.clone(), h.store.clone(), 300)),
            Arc::new(FrequencyGovernor::new(h.store.clone(), 0)),
            Arc::new(ActionDispatcher::new(h.local.clone(), h.jobs.clone())),
        );
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("m", "Show Modal"),
                Node::action("w", "Webhook").with_settings(json!({"webhookUrl": "https://hooks.test"})),
            ],
            vec![Edge::new("t", "m"), Edge::new("t", "w")],
        );
        let r = Arc::new(Run::new(g, "t", ctx()));
        executor.execute(r.clone()).await;
        let evs = events(&h, &r).await;
        assert!(evs
            .iter()
            .any(|e| e.node_id == "m" && e.kind == EventKind::ActionFailed));
        assert_eq!(h.jobs.jobs().len(), 1);
        assert!(r.is_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_delays_path() {
        let h = harness();
        let g = graph(
            vec![
                Node::trigger("t", "Page View"),
                Node::action("wait", "Wait").with_settings(json!({"waitSeconds": 30})),
                Node::action("m", "Show Modal"),
            ],
            vec![Edge::new("t", "wait"), Edge::new("wait", "m")],
        );
        let start = tokio::time::Instant::now();
        let r = run(&h, g).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        let evs = events(&h, &r).await;
        assert!(!evs
            .iter()
            .any(|e| e.node_id == "wait" && e.kind == EventKind::ActionExecuted));
        assert_eq!(h.local.performed().len(), 1);
    }
}
