use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use visitflow_core::graph::WorkflowGraph;
use visitflow_core::settings::{ActionFrequency, NodeSpec};
use visitflow_core::traits::KeyValueStore;
use visitflow_core::types::{FrequencyKey, Node, StorageScope, VisitorContext};

/// Action-level repeat policy plus the workflow-level trigger cooldown.
pub struct FrequencyGovernor {
    kv: Arc<dyn KeyValueStore>,
    default_cooldown_secs: u64,
}

impl FrequencyGovernor {
    pub fn new(kv: Arc<dyn KeyValueStore>, default_cooldown_secs: u64) -> Self {
        Self {
            kv,
            default_cooldown_secs,
        }
    }

    fn action_scope(ctx: &VisitorContext, frequency: ActionFrequency) -> Option<StorageScope> {
        match frequency {
            ActionFrequency::EveryTrigger => None,
            ActionFrequency::OncePerSession => Some(ctx.session_scope()),
            ActionFrequency::OnceEver => Some(ctx.durable_scope()),
        }
    }

    /// Whether an action may run again for this visitor.
    pub async fn action_allowed(
        &self,
        ctx: &VisitorContext,
        workflow_id: &str,
        node_id: &str,
        frequency: ActionFrequency,
    ) -> bool {
        let Some(scope) = Self::action_scope(ctx, frequency) else {
            return true;
        };
        let key = FrequencyKey::action(workflow_id, node_id);
        match self.kv.get(&scope, key.as_str()).await {
            Ok(value) => value.is_none(),
            Err(e) => {
                warn!(workflow_id, node_id, error = %e, "Frequency lookup failed, allowing action");
                true
            }
        }
    }

    /// Remember that an action ran, for future frequency checks.
    pub async fn record_action(
        &self,
        ctx: &VisitorContext,
        workflow_id: &str,
        node_id: &str,
        frequency: ActionFrequency,
    ) {
        let Some(scope) = Self::action_scope(ctx, frequency) else {
            return;
        };
        let key = FrequencyKey::action(workflow_id, node_id);
        let now = Utc::now().timestamp().to_string();
        if let Err(e) = self.kv.set(&scope, key.as_str(), &now).await {
            warn!(workflow_id, node_id, error = %e, "Failed to record action execution");
        }
    }

    /// Trigger-time gate. Returns true and arms the gate if the trigger may
    /// start a run at `now`; returns false if it is suppressed.
    pub async fn try_fire(
        &self,
        graph: &WorkflowGraph,
        trigger: &Node,
        ctx: &VisitorContext,
        now: DateTime<Utc>,
    ) -> bool {
        if matches!(graph.spec(&trigger.id), Some(NodeSpec::Funnel(_))) {
            return self.funnel_gate(graph.id(), ctx).await;
        }

        let cooldown = graph
            .cooldown_for(&trigger.id)
            .unwrap_or(self.default_cooldown_secs) as i64;
        if cooldown <= 0 {
            return true;
        }

        let scope = ctx.durable_scope();
        let key = FrequencyKey::cooldown(graph.id(), &trigger.title);
        let last = match self.kv.get(&scope, key.as_str()).await {
            Ok(v) => v.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0),
            Err(e) => {
                warn!(workflow_id = %graph.id(), error = %e, "Cooldown lookup failed");
                0
            }
        };
        let now_secs = now.timestamp();
        if now_secs - last < cooldown {
            debug!(
                workflow_id = %graph.id(),
                trigger = %trigger.title,
                cooldown_secs = cooldown,
                elapsed_secs = now_secs - last,
                "Trigger suppressed by cooldown"
            );
            return false;
        }
        if let Err(e) = self
            .kv
            .set(&scope, key.as_str(), &now_secs.to_string())
            .await
        {
            warn!(workflow_id = %graph.id(), error = %e, "Failed to arm cooldown");
        }
        true
    }

    /// Funnel triggers fire at most once per session.
    async fn funnel_gate(&self, workflow_id: &str, ctx: &VisitorContext) -> bool {
        let scope = ctx.session_scope();
        let key = FrequencyKey::funnel_gate(workflow_id);
        match self.kv.get(&scope, key.as_str()).await {
            Ok(Some(_)) => {
                debug!(workflow_id, "Funnel trigger already shown this session");
                false
            }
            Ok(None) => {
                if let Err(e) = self.kv.set(&scope, key.as_str(), "true").await {
                    warn!(workflow_id, error = %e, "Failed to mark funnel trigger shown");
                }
                true
            }
            Err(e) => {
                warn!(workflow_id, error = %e, "Funnel gate lookup failed");
                true
            }
        }
    }
}
