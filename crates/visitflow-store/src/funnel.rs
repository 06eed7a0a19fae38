//! Batch reconstruction of per-run journeys from the event
//! log, reduced to per-step counts, conversion and drop-off, timing, and the
//! most frequent paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use visitflow_core::error::Result;
use visitflow_core::traits::EventRecorder;
use visitflow_core::types::{EventKind, LifecycleEvent, NodeKind, RunId, TimeRange};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelStep {
    /// `"{title} ({type})"`
    pub name: String,
    pub node_type: NodeKind,
    pub step_order: Option<u32>,
    /// Journeys that entered the step.
    pub count: usize,
    /// Journeys that completed it.
    pub completed: usize,
    pub success_rate: f64,
    pub conversion_rate: f64,
    pub drop_off: f64,
    pub avg_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropOff {
    pub from_step: String,
    pub to_step: String,
    pub drop_off_count: i64,
    pub drop_off_rate: f64,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTiming {
    pub step_name: String,
    pub average_time: u64,
    pub total_executions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathCount {
    pub path: String,
    pub count: usize,
    pub visitors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunnelReport {
    pub total_visitors: usize,
    pub steps: Vec<FunnelStep>,
    pub drop_off_rates: Vec<DropOff>,
    pub average_time_per_step: Vec<StepTiming>,
    pub path_analysis: Vec<PathCount>,
    pub total_runs: usize,
    pub successful_completions: usize,
}

/// One node visit inside a journey.
#[derive(Debug, Clone)]
struct Visit {
    node_id: String,
    title: String,
    node_type: NodeKind,
    step_order: Option<u32>,
    entered_at: DateTime<Utc>,
    completed: bool,
    execution_time_ms: Option<u64>,
}

/// All visits of one run, in arrival order.
#[derive(Debug, Clone)]
struct Journey {
    visitor_id: String,
    visits: Vec<Visit>,
    completed: bool,
}

fn group_journeys(events: &[LifecycleEvent]) -> Vec<Journey> {
    let mut order: Vec<RunId> = Vec::new();
    let mut journeys: HashMap<RunId, Journey> = HashMap::new();

    for event in events {
        if !matches!(
            event.kind,
            EventKind::StepEntered
                | EventKind::StepCompleted
                | EventKind::ConditionEvaluated
                | EventKind::ActionExecuted
        ) {
            continue;
        }
        let journey = journeys.entry(event.run_id.clone()).or_insert_with(|| {
            order.push(event.run_id.clone());
            Journey {
                visitor_id: event.visitor_id.clone(),
                visits: Vec::new(),
                completed: false,
            }
        });

        let visit = journey.visits.iter_mut().find(|v| v.node_id == event.node_id);
        match (event.kind, visit) {
            // Re-entry (a join reached by several branches) is one visit.
            (EventKind::StepEntered, Some(_)) => {}
            (EventKind::StepEntered, None) => journey.visits.push(Visit {
                node_id: event.node_id.clone(),
                title: event.node_title.clone(),
                node_type: event.node_type,
                step_order: event.step_order,
                entered_at: event.timestamp,
                completed: false,
                execution_time_ms: None,
            }),
            (EventKind::StepCompleted | EventKind::ActionExecuted, Some(v)) => {
                v.completed = true;
                if event.execution_time_ms.is_some() {
                    v.execution_time_ms = event.execution_time_ms;
                }
            }
            (EventKind::ConditionEvaluated, Some(v)) => {
                if event.execution_time_ms.is_some() {
                    v.execution_time_ms = event.execution_time_ms;
                }
            }
            _ => {}
        }
        if event.kind == EventKind::ActionExecuted {
            journey.completed = true;
        }
    }

    order
        .into_iter()
        .filter_map(|id| journeys.remove(&id))
        .collect()
}

fn pct(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        return 0.0;
    }
    ((part / whole) * 1000.0).round() / 10.0
}

fn earliest(a: Option<u32>, b: Option<u32>) -> Option<u32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn funnel_steps(journeys: &[Journey]) -> Vec<FunnelStep> {
    struct Acc {
        node_type: NodeKind,
        step_order: Option<u32>,
        count: usize,
        completed: usize,
        time_total: u64,
        time_samples: usize,
        first_seen: usize,
    }

    let mut acc: HashMap<String, Acc> = HashMap::new();
    let mut seen = 0usize;
    for journey in journeys {
        // Same-titled nodes merge into one step, counted once per journey.
        let mut entered: HashSet<String> = HashSet::new();
        let mut finished: HashSet<String> = HashSet::new();
        for visit in &journey.visits {
            let name = format!("{} ({})", visit.title, visit.node_type);
            let entry = acc.entry(name.clone()).or_insert_with(|| {
                seen += 1;
                Acc {
                    node_type: visit.node_type,
                    step_order: visit.step_order,
                    count: 0,
                    completed: 0,
                    time_total: 0,
                    time_samples: 0,
                    first_seen: seen,
                }
            });
            entry.step_order = earliest(entry.step_order, visit.step_order);
            if entered.insert(name.clone()) {
                entry.count += 1;
            }
            if visit.completed && finished.insert(name) {
                entry.completed += 1;
            }
            if let Some(ms) = visit.execution_time_ms.filter(|ms| *ms > 0) {
                entry.time_total += ms;
                entry.time_samples += 1;
            }
        }
    }

    let mut steps: Vec<(usize, FunnelStep)> = acc
        .into_iter()
        .map(|(name, a)| {
            (
                a.first_seen,
                FunnelStep {
                    name,
                    node_type: a.node_type,
                    step_order: a.step_order,
                    count: a.count,
                    completed: a.completed,
                    success_rate: pct(a.completed as f64, a.count as f64),
                    conversion_rate: 0.0,
                    drop_off: 0.0,
                    avg_time: if a.time_samples > 0 {
                        a.time_total as f64 / a.time_samples as f64
                    } else {
                        0.0
                    },
                },
            )
        })
        .collect();

    // Static step order first; unreachable nodes last; ties by first appearance.
    steps.sort_by_key(|(first_seen, s)| (s.step_order.unwrap_or(u32::MAX), *first_seen));
    let mut steps: Vec<FunnelStep> = steps.into_iter().map(|(_, s)| s).collect();

    let first = steps.first().map(|s| s.count).unwrap_or(0) as f64;
    for i in 0..steps.len() {
        steps[i].conversion_rate = pct(steps[i].count as f64, first);
        if i > 0 {
            let prev = steps[i - 1].count as f64;
            steps[i].drop_off = pct(prev - steps[i].count as f64, prev);
        }
    }
    steps
}

fn drop_off_rates(steps: &[FunnelStep]) -> Vec<DropOff> {
    steps
        .windows(2)
        .map(|pair| {
            let (prev, cur) = (&pair[0], &pair[1]);
            let rate = pct(prev.count as f64 - cur.count as f64, prev.count as f64);
            DropOff {
                from_step: prev.name.clone(),
                to_step: cur.name.clone(),
                drop_off_count: prev.count as i64 - cur.count as i64,
                drop_off_rate: rate,
                critical: rate > 50.0,
            }
        })
        .collect()
}

fn step_timing(journeys: &[Journey]) -> Vec<StepTiming> {
    let mut timing: BTreeMap<String, (u64, usize)> = BTreeMap::new();
    for visit in journeys.iter().flat_map(|j| &j.visits) {
        if let Some(ms) = visit.execution_time_ms.filter(|ms| *ms > 0) {
            let t = timing.entry(visit.title.clone()).or_insert((0, 0));
            t.0 += ms;
            t.1 += 1;
        }
    }
    timing
        .into_iter()
        .map(|(step_name, (total, n))| StepTiming {
            step_name,
            average_time: (total as f64 / n as f64).round() as u64,
            total_executions: n,
        })
        .collect()
}

fn path_analysis(journeys: &[Journey], top_n: usize) -> Vec<PathCount> {
    let mut first_seen: Vec<String> = Vec::new();
    let mut paths: HashMap<String, PathCount> = HashMap::new();
    for journey in journeys {
        let mut visits: Vec<&Visit> = journey.visits.iter().collect();
        visits.sort_by_key(|v| v.entered_at);
        let path = visits
            .iter()
            .map(|v| v.title.as_str())
            .collect::<Vec<_>>()
            .join(" → ");
        let entry = paths.entry(path.clone()).or_insert_with(|| {
            first_seen.push(path.clone());
            PathCount {
                path,
                count: 0,
                visitors: Vec::new(),
            }
        });
        entry.count += 1;
        entry.visitors.push(journey.visitor_id.clone());
    }

    let mut ranked: Vec<PathCount> = first_seen
        .into_iter()
        .filter_map(|p| paths.remove(&p))
        .collect();
    // Stable: equal counts keep first-seen order.
    ranked.sort_by(|a, b| b.count.cmp(&a.count));
    ranked.truncate(top_n);
    ranked
}

/// Build a funnel report from one workflow's events.
pub fn analyze_events(events: &[LifecycleEvent], top_n: usize) -> FunnelReport {
    let journeys = group_journeys(events);
    let steps = funnel_steps(&journeys);
    FunnelReport {
        total_visitors: steps.first().map(|s| s.count).unwrap_or(0),
        drop_off_rates: drop_off_rates(&steps),
        average_time_per_step: step_timing(&journeys),
        path_analysis: path_analysis(&journeys, top_n),
        total_runs: journeys.len(),
        successful_completions: journeys.iter().filter(|j| j.completed).count(),
        steps,
    }
}

/// On-demand funnel queries over an event recorder.
pub struct FunnelAnalyzer {
    recorder: Arc<dyn EventRecorder>,
    top_n: usize,
}

impl FunnelAnalyzer {
    pub fn new(recorder: Arc<dyn EventRecorder>, top_n: usize) -> Self {
        Self { recorder, top_n }
    }

    pub async fn analyze(&self, workflow_id: &str, range: TimeRange) -> Result<FunnelReport> {
        let events = self.recorder.query(workflow_id, range).await?;
        Ok(analyze_events(&events, self.top_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use visitflow_core::types::{Node, RunRef};

    struct Recorder {
        events: Vec<LifecycleEvent>,
        t: DateTime<Utc>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                events: Vec::new(),
                t: Utc::now(),
            }
        }

        fn push(&mut self, run: &str, visitor: &str, node: &Node, kind: EventKind, order: u32) -> &mut LifecycleEvent {
            let r = RunRef {
                run_id: RunId::from_string(run),
                workflow_id: "wf1".into(),
                site_id: "s".into(),
                visitor_id: visitor.into(),
            };
            self.t += Duration::milliseconds(10);
            let mut e = LifecycleEvent::new(&r, node, kind, Some(order));
            e.timestamp = self.t;
            self.events.push(e);
            self.events.last_mut().unwrap()
        }

        /// Enter and complete a node; actions also execute.
        fn visit(&mut self, run: &str, visitor: &str, node: &Node, order: u32, ms: Option<u64>) {
            self.push(run, visitor, node, EventKind::StepEntered, order);
            if node.kind == NodeKind::Action {
                let e = self.push(run, visitor, node, EventKind::ActionExecuted, order);
                e.success = Some(true);
                e.execution_time_ms = ms;
            }
            self.push(run, visitor, node, EventKind::StepCompleted, order);
        }
    }

    fn nodes() -> (Node, Node, Node, Node) {
        (
            Node::condition("c", "URL Path"),
            Node::condition("s", "Branch Split"),
            Node::action("m", "Show Modal"),
            Node::action("b", "Show Banner"),
        )
    }

    #[test]
    fn test_steps_counts_and_rates() {
        let (cond, split, modal, banner) = nodes();
        let mut rec = Recorder::new();
        for (i, visitor) in ["v1", "v2", "v3", "v4"].iter().enumerate() {
            let run = format!("r{}", i);
            rec.visit(&run, visitor, &cond, 1, None);
            if i < 3 {
                rec.visit(&run, visitor, &split, 2, None);
                let action = if i < 2 { &modal } else { &banner };
                rec.visit(&run, visitor, action, 3, Some(20 + i as u64 * 10));
            }
        }
        let report = analyze_events(&rec.events, 10);

        assert_eq!(report.total_runs, 4);
        assert_eq!(report.total_visitors, 4);
        assert_eq!(report.successful_completions, 3);

        let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "URL Path (Condition)",
                "Branch Split (Condition)",
                "Show Modal (Action)",
                "Show Banner (Action)"
            ]
        );
        let split_step = &report.steps[1];
        assert_eq!(split_step.count, 3);
        assert_eq!(split_step.conversion_rate, 75.0);
        assert_eq!(split_step.drop_off, 25.0);
        assert_eq!(split_step.success_rate, 100.0);
        assert_eq!(report.steps[2].avg_time, 25.0);

        assert_eq!(report.drop_off_rates.len(), 3);
        assert_eq!(report.drop_off_rates[0].drop_off_count, 1);
        assert_eq!(report.drop_off_rates[1].drop_off_rate, 33.3);
        assert_eq!(report.drop_off_rates[2].drop_off_rate, 50.0);
        assert!(report.drop_off_rates.iter().all(|d| !d.critical));
    }

    #[test]
    fn test_drop_off_above_half_is_critical() {
        let step = |name: &str, count: usize| FunnelStep {
            name: name.into(),
            node_type: NodeKind::Action,
            step_order: Some(1),
            count,
            completed: count,
            success_rate: 100.0,
            conversion_rate: 0.0,
            drop_off: 0.0,
            avg_time: 0.0,
        };
        let rates = drop_off_rates(&[step("a", 10), step("b", 4)]);
        assert_eq!(rates[0].drop_off_rate, 60.0);
        assert_eq!(rates[0].drop_off_count, 6);
        assert!(rates[0].critical);
    }

    #[test]
    fn test_paths_ranked_by_frequency() {
        let (cond, split, modal, banner) = nodes();
        let mut rec = Recorder::new();
        for (run, action) in [("r1", &modal), ("r2", &banner), ("r3", &modal)] {
            rec.visit(run, run, &cond, 1, None);
            rec.visit(run, run, &split, 2, None);
            rec.visit(run, run, action, 3, Some(5));
        }
        let report = analyze_events(&rec.events, 1);
        assert_eq!(report.path_analysis.len(), 1);
        let top = &report.path_analysis[0];
        assert_eq!(top.path, "URL Path → Branch Split → Show Modal");
        assert_eq!(top.count, 2);
        assert_eq!(top.visitors, vec!["r1", "r3"]);

        let timing: Vec<&str> = report
            .average_time_per_step
            .iter()
            .map(|t| t.step_name.as_str())
            .collect();
        assert_eq!(timing, vec!["Show Banner", "Show Modal"]);
    }

    #[test]
    fn test_step_order_not_arrival_order() {
        // Branch "late" (static order 1) records after "deep" (static order 2).
        let early = Node::action("deep", "Track Event");
        let late = Node::action("late", "Show Banner");
        let mut rec = Recorder::new();
        rec.visit("r1", "v1", &early, 2, Some(1));
        rec.visit("r1", "v1", &late, 1, Some(1));
        let report = analyze_events(&rec.events, 10);
        assert_eq!(report.steps[0].name, "Show Banner (Action)");
        assert_eq!(report.steps[1].name, "Track Event (Action)");
    }

    #[test]
    fn test_join_reentry_counts_once() {
        let join = Node::condition("j", "Join");
        let mut rec = Recorder::new();
        rec.push("r1", "v1", &join, EventKind::StepEntered, 2);
        rec.push("r1", "v1", &join, EventKind::StepEntered, 2);
        rec.push("r1", "v1", &join, EventKind::StepCompleted, 2);
        let report = analyze_events(&rec.events, 10);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].count, 1);
        assert_eq!(report.steps[0].completed, 1);
    }

    #[test]
    fn test_same_titled_nodes_count_once_per_run() {
        let cond = Node::condition("c", "URL Path");
        let m1 = Node::action("m1", "Show Modal");
        let m2 = Node::action("m2", "Show Modal");
        let mut rec = Recorder::new();
        rec.visit("r1", "v1", &cond, 1, None);
        rec.visit("r1", "v1", &m1, 2, Some(10));
        rec.visit("r1", "v1", &m2, 2, Some(30));
        let report = analyze_events(&rec.events, 10);

        assert_eq!(report.total_runs, 1);
        assert_eq!(report.steps.len(), 2);
        let modal = &report.steps[1];
        assert_eq!(modal.name, "Show Modal (Action)");
        assert_eq!(modal.count, 1);
        assert_eq!(modal.completed, 1);
        assert_eq!(modal.success_rate, 100.0);
        assert!(modal.conversion_rate <= 100.0);
        assert_eq!(modal.drop_off, 0.0);
        // Both executions still feed the timing average
        assert_eq!(modal.avg_time, 20.0);
    }

    #[test]
    fn test_merged_step_takes_earliest_order() {
        let late_modal = Node::action("m2", "Show Modal");
        let banner = Node::action("b", "Show Banner");
        let early_modal = Node::action("m1", "Show Modal");
        let mut rec = Recorder::new();
        rec.visit("r1", "v1", &late_modal, 4, None);
        rec.visit("r1", "v1", &banner, 3, None);
        rec.visit("r1", "v1", &early_modal, 2, None);
        let report = analyze_events(&rec.events, 10);

        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].name, "Show Modal (Action)");
        assert_eq!(report.steps[0].step_order, Some(2));
        assert_eq!(report.steps[1].name, "Show Banner (Action)");
    }

    #[test]
    fn test_empty_log() {
        let report = analyze_events(&[], 10);
        assert_eq!(report.total_visitors, 0);
        assert!(report.steps.is_empty());
        assert!(report.drop_off_rates.is_empty());
        assert!(report.path_analysis.is_empty());
    }
}
