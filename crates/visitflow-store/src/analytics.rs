use std::collections::BTreeMap;

use chrono::Timelike;
use serde::Serialize;

use visitflow_core::types::{EventKind, LifecycleEvent};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub triggers: u64,
    pub completions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBucket {
    pub date: String,
    pub triggers: u64,
    pub completions: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePerformance {
    pub node_id: String,
    pub node_title: String,
    pub triggers: u64,
    pub executions: u64,
    pub failures: u64,
    pub performance: f64,
}

/// Headline numbers for one workflow. A completion is an executed action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub total_triggers: u64,
    pub total_completions: u64,
    pub total_runs_completed: u64,
    /// Percent, one decimal.
    pub conversion_rate: f64,
    /// 24 entries, index = UTC hour.
    pub hourly_data: Vec<Bucket>,
    pub daily_data: Vec<DailyBucket>,
    pub node_performance: Vec<NodePerformance>,
}

pub fn summarize(events: &[LifecycleEvent]) -> WorkflowSummary {
    let mut hourly = vec![Bucket::default(); 24];
    let mut daily: BTreeMap<String, Bucket> = BTreeMap::new();
    let mut nodes: BTreeMap<(String, String), NodePerformance> = BTreeMap::new();
    let (mut triggers, mut completions, mut runs_completed) = (0u64, 0u64, 0u64);

    for event in events {
        let is_trigger = event.kind == EventKind::Trigger;
        let is_completion = event.kind == EventKind::ActionExecuted;
        if event.kind == EventKind::WorkflowCompleted {
            runs_completed += 1;
        }
        if !is_trigger && !is_completion && event.kind != EventKind::ActionFailed {
            continue;
        }

        let node = nodes
            .entry((event.node_id.clone(), event.node_title.clone()))
            .or_insert_with(|| NodePerformance {
                node_id: event.node_id.clone(),
                node_title: event.node_title.clone(),
                triggers: 0,
                executions: 0,
                failures: 0,
                performance: 0.0,
            });
        if event.kind == EventKind::ActionFailed {
            node.failures += 1;
            continue;
        }

        let hour = &mut hourly[event.timestamp.hour() as usize];
        let day = daily
            .entry(event.timestamp.format("%Y-%m-%d").to_string())
            .or_default();
        if is_trigger {
            triggers += 1;
            hour.triggers += 1;
            day.triggers += 1;
            node.triggers += 1;
        } else {
            completions += 1;
            hour.completions += 1;
            day.completions += 1;
            node.executions += 1;
        }
    }

    let mut node_performance: Vec<NodePerformance> = nodes
        .into_values()
        .map(|mut n| {
            n.performance = if n.triggers > 0 {
                rate(n.executions, n.triggers)
            } else if n.executions > 0 {
                100.0
            } else {
                0.0
            };
            n
        })
        .collect();
    node_performance.sort_by(|a, b| b.performance.total_cmp(&a.performance));

    WorkflowSummary {
        total_triggers: triggers,
        total_completions: completions,
        total_runs_completed: runs_completed,
        conversion_rate: rate(completions, triggers),
        hourly_data: hourly,
        daily_data: daily
            .into_iter()
            .map(|(date, b)| DailyBucket {
                date,
                triggers: b.triggers,
                completions: b.completions,
            })
            .collect(),
        node_performance,
    }
}

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 1000.0).round() / 10.0
}
