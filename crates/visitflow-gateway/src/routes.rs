use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use visitflow_core::error::VisitflowError;
use visitflow_core::types::{
    ActionOutcome, IdentifiedUser, Job, LifecycleEvent, RunId, RunRef, Signal, TimeRange,
    VisitorContext,
};
use visitflow_store::{summarize, FunnelAnalyzer, WorkflowSummary};

use crate::state::AppState;

fn status_for(e: &VisitflowError) -> StatusCode {
    match e {
        VisitflowError::NotFound(_) => StatusCode::NOT_FOUND,
        VisitflowError::Validation(_) | VisitflowError::InvalidSignal(_) => StatusCode::BAD_REQUEST,
        other => {
            error!(error = %other, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Server actions ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerActionBody {
    pub workflow_id: String,
    pub node_id: String,
    pub site_id: String,
    pub visitor_id: String,
    #[serde(default)]
    pub identified_user: Option<IdentifiedUser>,
    #[serde(default)]
    pub local_storage_data: HashMap<String, String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

// POST /api/v1/workflows/execution/action
pub async fn execute_action(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ServerActionBody>,
) -> Result<Json<ActionOutcome>, StatusCode> {
    let run = RunRef {
        run_id: body
            .run_id
            .as_deref()
            .map(RunId::from_string)
            .unwrap_or_default(),
        workflow_id: body.workflow_id,
        site_id: body.site_id,
        visitor_id: body.visitor_id,
    };
    let mut job = Job::new(&run, body.node_id);
    job.identified_user = body.identified_user;
    job.local_storage = body.local_storage_data;

    state
        .worker
        .process(&job)
        .await
        .map(Json)
        .map_err(|e| status_for(&e))
}

// ── Analytics ───────────────────────────────────────────────────

// POST /api/v1/workflows/analytics/track
pub async fn track_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<LifecycleEvent>,
) -> Result<Json<Value>, StatusCode> {
    state
        .journal
        .recorder()
        .record(event.clone())
        .await
        .map_err(|e| status_for(&e))?;
    state.journal.bus().publish(event);
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct BatchBody {
    #[serde(default)]
    pub events: Vec<LifecycleEvent>,
}

// POST /api/v1/workflows/analytics/track/batch
pub async fn track_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchBody>,
) -> Result<Json<Value>, StatusCode> {
    if body.events.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let processed = state
        .journal
        .recorder()
        .record_batch(body.events.clone())
        .await
        .map_err(|e| status_for(&e))?;
    for event in body.events {
        state.journal.bus().publish(event);
    }
    debug!(processed, "Batch recorded");
    Ok(Json(json!({ "success": true, "processed": processed })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeQuery {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

impl RangeQuery {
    fn to_range(&self) -> Result<TimeRange, StatusCode> {
        TimeRange::parse(self.start_date.as_deref(), self.end_date.as_deref())
            .map_err(|e| status_for(&e))
    }
}

// GET /api/v1/workflows/analytics/funnel/{workflow_id}?startDate&endDate
pub async fn workflow_funnel(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<Value>, StatusCode> {
    let range = q.to_range()?;
    let analyzer = FunnelAnalyzer::new(state.journal.recorder().clone(), state.top_paths);
    let report = analyzer
        .analyze(&workflow_id, range)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(json!({ "success": true, "data": report })))
}

// GET /api/v1/workflows/analytics/workflow/{workflow_id}
pub async fn workflow_summary(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<WorkflowSummary>, StatusCode> {
    let range = q.to_range()?;
    let events = state
        .journal
        .recorder()
        .query(&workflow_id, range)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(summarize(&events)))
}

// ── Workflows, signals, visitors ────────────────────────────────

// GET /api/v1/workflows/site/{site_id}/active
pub async fn active_workflows(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let graphs = state
        .catalog
        .active_workflows(&site_id)
        .await
        .map_err(|e| status_for(&e))?;
    let workflows: Vec<_> = graphs.iter().map(|g| g.workflow()).collect();
    Ok(Json(json!({ "workflows": workflows })))
}

#[derive(Deserialize)]
pub struct SignalBody {
    pub context: VisitorContext,
    pub signal: Signal,
    /// Respond only after every started run has finished traversing.
    #[serde(default)]
    pub wait: bool,
}

// POST /api/v1/signals
pub async fn ingest_signal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignalBody>,
) -> Result<Json<Value>, StatusCode> {
    body.signal.validate().map_err(|e| status_for(&e))?;
    let handles = state
        .detector
        .detect(&body.signal, &body.context)
        .await
        .map_err(|e| status_for(&e))?;

    let mut runs = Vec::with_capacity(handles.len());
    for handle in handles {
        let run = if body.wait {
            handle.finished().await
        } else {
            handle.run.clone()
        };
        runs.push(json!({
            "runId": run.id,
            "workflowId": run.graph.id(),
            "completed": run.is_completed(),
        }));
    }
    Ok(Json(json!({ "triggered": runs.len(), "runs": runs })))
}

#[derive(Deserialize)]
pub struct TagQuery {
    #[serde(default)]
    pub tag: Option<String>,
}

// GET /api/v1/visitor/{site_id}/{visitor_id}/has-tag?tag=
pub async fn has_tag(
    State(state): State<Arc<AppState>>,
    Path((site_id, visitor_id)): Path<(String, String)>,
    Query(q): Query<TagQuery>,
) -> Result<Json<Value>, StatusCode> {
    let tag = q
        .tag
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(StatusCode::BAD_REQUEST)?;
    let has = state
        .tags
        .has_tag(&site_id, &visitor_id, tag)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(json!({ "hasTag": has })))
}

#[derive(Deserialize)]
pub struct DlqQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/v1/dlq?limit=50
pub async fn list_dlq(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DlqQuery>,
) -> Result<Json<Value>, StatusCode> {
    let entries = state
        .dlq
        .list(q.limit)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(json!({ "entries": entries })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use visitflow_core::config::AppConfig;
    use visitflow_core::event::{EventBus, EventJournal};
    use visitflow_core::types::{EventKind, Node};
    use visitflow_engine::{
        ActionDispatcher, ConditionEvaluator, FrequencyGovernor, GraphExecutor, TriggerDetector,
    };
    use visitflow_store::{MemoryCatalog, MemoryStore};
    use visitflow_test_utils::{
        pricing_workflow, webhook_workflow, RecordingActionHandler, RecordingEmailProvider,
        RecordingJobSink, ScriptedTransport,
    };
    use visitflow_worker::ExecutionWorker;

    use crate::server::router;

    async fn state() -> (Arc<AppState>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.upsert(pricing_workflow()).await.unwrap();
        catalog
            .upsert(webhook_workflow("https://hooks.example.com/in"))
            .await
            .unwrap();

        let config = AppConfig::default();
        let journal = Arc::new(EventJournal::new(store.clone(), Arc::new(EventBus::default())));
        let governor = Arc::new(FrequencyGovernor::new(
            store.clone(),
            config.engine.default_cooldown_secs,
        ));
        let executor = GraphExecutor::new(
            journal.clone(),
            Arc::new(ConditionEvaluator::new(store.clone(), store.clone(), 300)),
            governor.clone(),
            Arc::new(ActionDispatcher::new(
                Arc::new(RecordingActionHandler::new()),
                Arc::new(RecordingJobSink::new()),
            )),
        );
        let detector = Arc::new(TriggerDetector::new(catalog.clone(), governor, executor));
        let worker = Arc::new(ExecutionWorker::new(
            catalog.clone(),
            journal.clone(),
            store.clone(),
            store.clone(),
            Arc::new(ScriptedTransport::ok()),
            Arc::new(RecordingEmailProvider::new()),
            &config,
        ));

        let state = Arc::new(AppState {
            catalog,
            journal,
            tags: store.clone(),
            dlq: store.clone(),
            detector,
            worker,
            top_paths: 10,
        });
        (state, store)
    }

    async fn call(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn event(run: &str, node: &Node, kind: EventKind) -> Value {
        json!({
            "runId": run,
            "workflowId": "wf-pricing",
            "siteId": "site-1",
            "visitorId": "visitor-1",
            "nodeId": node.id,
            "nodeTitle": node.title,
            "nodeType": node.kind,
            "type": kind,
            "stepOrder": 0
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state().await;
        let (status, body) = call(&state, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_server_action_then_tag_lookup() {
        let (state, _) = state().await;
        let (status, body) = call(
            &state,
            post(
                "/api/v1/workflows/execution/action",
                json!({
                    "workflowId": "wf-webhook",
                    "nodeId": "tag",
                    "siteId": "site-1",
                    "visitorId": "visitor-1"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = call(&state, get("/api/v1/visitor/site-1/visitor-1/has-tag?tag=signed-up")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasTag"], true);

        let (status, _) = call(&state, get("/api/v1/visitor/site-1/visitor-1/has-tag")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_server_action_for_unknown_workflow_is_404() {
        let (state, _) = state().await;
        let (status, _) = call(
            &state,
            post(
                "/api/v1/workflows/execution/action",
                json!({"workflowId": "gone", "nodeId": "n", "siteId": "s", "visitorId": "v"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tracked_events_feed_funnel_and_summary() {
        let (state, store) = state().await;
        let trigger = Node::trigger("trigger", "Page View");
        let modal = Node::action("modal", "Show Modal");

        let (status, _) = call(
            &state,
            post(
                "/api/v1/workflows/analytics/track",
                event("r1", &trigger, EventKind::Trigger),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &state,
            post(
                "/api/v1/workflows/analytics/track/batch",
                json!({"events": [
                    event("r1", &trigger, EventKind::StepEntered),
                    event("r1", &modal, EventKind::StepEntered),
                    event("r1", &modal, EventKind::ActionExecuted),
                ]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"], 3);
        assert_eq!(store.all_events().len(), 4);

        let (status, body) = call(&state, get("/api/v1/workflows/analytics/funnel/wf-pricing")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["totalRuns"], 1);

        let (_, body) = call(&state, get("/api/v1/workflows/analytics/workflow/wf-pricing")).await;
        assert_eq!(body["totalTriggers"], 1);
        assert_eq!(body["totalCompletions"], 1);
    }

    #[tokio::test]
    async fn test_empty_batch_and_bad_dates_rejected() {
        let (state, _) = state().await;
        let (status, _) = call(
            &state,
            post("/api/v1/workflows/analytics/track/batch", json!({"events": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            get("/api/v1/workflows/analytics/funnel/wf-pricing?startDate=yesterday"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            get("/api/v1/workflows/analytics/funnel/wf-pricing?startDate=2026-01-01&endDate=2026-01-31"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_active_workflows_by_site() {
        let (state, _) = state().await;
        let (_, body) = call(&state, get("/api/v1/workflows/site/site-1/active")).await;
        assert_eq!(body["workflows"].as_array().unwrap().len(), 2);
        let (_, body) = call(&state, get("/api/v1/workflows/site/other/active")).await;
        assert!(body["workflows"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signal_runs_pricing_workflow() {
        let (state, store) = state().await;
        let (status, body) = call(
            &state,
            post(
                "/api/v1/signals",
                json!({
                    "context": {"siteId": "site-1", "visitorId": "visitor-1", "url": "/pricing/enterprise"},
                    "signal": {"type": "page_view"},
                    "wait": true
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["triggered"], 1);
        assert_eq!(body["runs"][0]["workflowId"], "wf-pricing");
        assert_eq!(body["runs"][0]["completed"], true);
        assert!(store
            .all_events()
            .iter()
            .any(|e| e.kind == EventKind::ActionExecuted));
    }

    #[tokio::test]
    async fn test_invalid_signal_rejected() {
        let (state, _) = state().await;
        let (status, _) = call(
            &state,
            post(
                "/api/v1/signals",
                json!({
                    "context": {"siteId": "site-1", "visitorId": "visitor-1"},
                    "signal": {"type": "scroll_depth", "percent": 140}
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dlq_listing() {
        let (state, _) = state().await;
        let (status, body) = call(&state, get("/api/v1/dlq?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["entries"].as_array().unwrap().is_empty());
    }
}
