use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use visitflow_core::event::EventBus;
use visitflow_core::types::{EventKind, LifecycleEvent};

/// JSONL lifecycle logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{workflow_id}/{YYYY-MM-DD}.jsonl`. Lines already written survive
/// a crash mid-run.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    visitor_id: String,
    event_type: &'static str,
    node_id: String,
    node_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_order: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl RunLogger {
    /// `level`: 1 = run outcome, 2 = + actions, 3 = every step.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    fn admits(&self, kind: EventKind) -> bool {
        let required = match kind {
            EventKind::Trigger | EventKind::WorkflowCompleted | EventKind::StepFailed => 1,
            EventKind::ActionStarted
            | EventKind::ActionExecuted
            | EventKind::ActionFailed
            | EventKind::ActionSkipped => 2,
            EventKind::StepEntered | EventKind::StepCompleted | EventKind::ConditionEvaluated => 3,
        };
        self.level >= required
    }

    fn entry(&self, event: &LifecycleEvent) -> Option<LogEntry> {
        if !self.admits(event.kind) {
            return None;
        }
        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: event.run_id.to_string(),
            visitor_id: event.visitor_id.clone(),
            event_type: event.kind.as_str(),
            node_id: event.node_id.clone(),
            node_title: event.node_title.clone(),
            step_order: event.step_order,
            success: event.success,
            execution_time_ms: event.execution_time_ms,
            detail: event.detail.as_ref().map(|d| truncate_str(d, 200).to_string()),
        })
    }

    fn path_for(&self, event: &LifecycleEvent) -> PathBuf {
        self.log_dir
            .join(&event.workflow_id)
            .join(format!("{}.jsonl", event.timestamp.format("%Y-%m-%d")))
    }

    async fn writer_for<'a>(
        &self,
        writers: &'a mut HashMap<PathBuf, BufWriter<File>>,
        path: PathBuf,
    ) -> Option<&'a mut BufWriter<File>> {
        if !writers.contains_key(&path) {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    error!(error = %e, "Failed to create log directory");
                    return None;
                }
            }
            let file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open log file");
                    return None;
                }
            };
            debug!(path = %path.display(), "Opened run log");
            writers.insert(path.clone(), BufWriter::new(file));
        }
        writers.get_mut(&path)
    }

    /// Write entries until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        info!(dir = %self.log_dir.display(), level = self.level, "RunLogger started");
        let mut rx = event_bus.subscribe();
        let mut writers: HashMap<PathBuf, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.entry(&event) else { continue };
                            let Ok(json) = serde_json::to_string(&entry) else { continue };
                            let Some(writer) = self.writer_for(&mut writers, self.path_for(&event)).await else {
                                continue;
                            };
                            let line = format!("{}\n", json);
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                continue;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }
}

fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
