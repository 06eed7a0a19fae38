use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::future::BoxFuture;
use tracing::{info, warn};

use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::graph::WorkflowGraph;
use visitflow_core::traits::{DeadLetterQueue, EventRecorder, KeyValueStore, TagStore, WorkflowCatalog};
use visitflow_core::types::{DlqEntry, LifecycleEvent, StorageScope, TimeRange, Workflow};

#[derive(Default)]
struct MemoryState {
    events: Vec<LifecycleEvent>,
    dlq: Vec<DlqEntry>,
    tags: HashMap<(String, String), Vec<String>>,
    kv: HashMap<(String, String), String>,
}

/// Process-local store implementing every persistence trait. Used by
/// `simulate` and throughout the tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every recorded event, in append order.
    pub fn all_events(&self) -> Vec<LifecycleEvent> {
        self.lock().events.clone()
    }
}

impl EventRecorder for MemoryStore {
    fn record(&self, event: LifecycleEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock().events.push(event);
            Ok(())
        })
    }

    fn query(&self, workflow_id: &str, range: TimeRange) -> BoxFuture<'_, Result<Vec<LifecycleEvent>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            Ok(self
                .lock()
                .events
                .iter()
                .filter(|e| e.workflow_id == workflow_id && range.contains(&e.timestamp))
                .cloned()
                .collect())
        })
    }
}

impl DeadLetterQueue for MemoryStore {
    fn push(&self, entry: DlqEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.lock().dlq.push(entry);
            Ok(())
        })
    }

    fn list(&self, limit: usize) -> BoxFuture<'_, Result<Vec<DlqEntry>>> {
        Box::pin(async move { Ok(self.lock().dlq.iter().rev().take(limit).cloned().collect()) })
    }

    fn take(&self, id: &str) -> BoxFuture<'_, Result<Option<DlqEntry>>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            let pos = state.dlq.iter().position(|e| e.id == id);
            Ok(pos.map(|i| state.dlq.remove(i)))
        })
    }
}

impl TagStore for MemoryStore {
    fn has_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<bool>> {
        let key = (site_id.to_string(), visitor_id.to_string());
        let tag = tag.to_string();
        Box::pin(async move {
            Ok(self
                .lock()
                .tags
                .get(&key)
                .is_some_and(|tags| tags.contains(&tag)))
        })
    }

    fn add_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<()>> {
        let key = (site_id.to_string(), visitor_id.to_string());
        let tag = tag.to_string();
        Box::pin(async move {
            let mut state = self.lock();
            let tags = state.tags.entry(key).or_default();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
            Ok(())
        })
    }

    fn remove_tag(&self, site_id: &str, visitor_id: &str, tag: &str) -> BoxFuture<'_, Result<()>> {
        let key = (site_id.to_string(), visitor_id.to_string());
        let tag = tag.to_string();
        Box::pin(async move {
            if let Some(tags) = self.lock().tags.get_mut(&key) {
                tags.retain(|t| *t != tag);
            }
            Ok(())
        })
    }

    fn tags(&self, site_id: &str, visitor_id: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let key = (site_id.to_string(), visitor_id.to_string());
        Box::pin(async move { Ok(self.lock().tags.get(&key).cloned().unwrap_or_default()) })
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, scope: &StorageScope, key: &str) -> BoxFuture<'_, Result<Option<String>>> {
        let k = (scope.partition(), key.to_string());
        Box::pin(async move { Ok(self.lock().kv.get(&k).cloned()) })
    }

    fn set(&self, scope: &StorageScope, key: &str, value: &str) -> BoxFuture<'_, Result<()>> {
        let k = (scope.partition(), key.to_string());
        let value = value.to_string();
        Box::pin(async move {
            self.lock().kv.insert(k, value);
            Ok(())
        })
    }

    fn remove(&self, scope: &StorageScope, key: &str) -> BoxFuture<'_, Result<()>> {
        let k = (scope.partition(), key.to_string());
        Box::pin(async move {
            self.lock().kv.remove(&k);
            Ok(())
        })
    }

    fn clear(&self, scope: &StorageScope) -> BoxFuture<'_, Result<()>> {
        let partition = scope.partition();
        Box::pin(async move {
            self.lock().kv.retain(|(p, _), _| *p != partition);
            Ok(())
        })
    }
}

// ── Workflow catalog ────────────────────────────────────────────

/// Validated workflows keyed by id, with per-workflow completion counters.
#[derive(Default)]
pub struct MemoryCatalog {
    workflows: RwLock<HashMap<String, Arc<WorkflowGraph>>>,
    completions: Mutex<HashMap<String, u64>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert (or replace) a workflow.
    pub async fn upsert(&self, workflow: Workflow) -> Result<Arc<WorkflowGraph>> {
        let graph = Arc::new(WorkflowGraph::new(workflow)?);
        let unreachable = graph.unreachable();
        if !unreachable.is_empty() {
            warn!(workflow_id = %graph.id(), nodes = ?unreachable, "Workflow has nodes no trigger reaches");
        }
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(graph.id().to_string(), graph.clone());
        Ok(graph)
    }

    pub fn remove(&self, workflow_id: &str) -> bool {
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workflow_id)
            .is_some()
    }

    pub fn all(&self) -> Vec<Arc<WorkflowGraph>> {
        let mut all: Vec<_> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn completions(&self, workflow_id: &str) -> u64 {
        self.completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .copied()
            .unwrap_or(0)
    }

    /// Load every `*.json` file in `dir`. A file holds one workflow or an
    /// array of them. Invalid workflows are logged and skipped.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            warn!(dir = %dir.display(), "Workflows directory does not exist");
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let text = tokio::fs::read_to_string(&path).await?;
            let workflows: Vec<Workflow> = match serde_json::from_str::<serde_json::Value>(&text)? {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(serde_json::from_value)
                    .collect::<std::result::Result<Vec<Workflow>, _>>()?,
                single => vec![serde_json::from_value(single)?],
            };
            for workflow in workflows {
                let id = workflow.id.clone();
                match self.upsert(workflow).await {
                    Ok(_) => loaded += 1,
                    Err(e) => warn!(path = %path.display(), workflow_id = %id, error = %e, "Rejected workflow"),
                }
            }
        }
        info!(dir = %dir.display(), count = loaded, "Workflows loaded");
        Ok(loaded)
    }
}

impl WorkflowCatalog for MemoryCatalog {
    fn active_workflows(&self, site_id: &str) -> BoxFuture<'_, Result<Vec<Arc<WorkflowGraph>>>> {
        let site_id = site_id.to_string();
        Box::pin(async move {
            Ok(self
                .all()
                .into_iter()
                .filter(|g| g.site_id() == site_id && g.is_active())
                .collect())
        })
    }

    fn get(&self, workflow_id: &str) -> BoxFuture<'_, Result<Option<Arc<WorkflowGraph>>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            Ok(self
                .workflows
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&workflow_id)
                .cloned())
        })
    }

    fn increment_completions(&self, workflow_id: &str) -> BoxFuture<'_, Result<u64>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            if !self
                .workflows
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&workflow_id)
            {
                return Err(VisitflowError::NotFound(format!("workflow {}", workflow_id)));
            }
            let mut counters = self.completions.lock().unwrap_or_else(PoisonError::into_inner);
            let count = counters.entry(workflow_id).or_insert(0);
            *count += 1;
            Ok(*count)
        })
    }
}
