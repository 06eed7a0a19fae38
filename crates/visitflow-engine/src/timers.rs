//! Timer-driven signal sources for Time Spent and Inactivity triggers.
//!
//! Every timer is a child of one root cancellation token, so `shutdown`
//! releases all of them at once when the visitor's page goes away.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use visitflow_core::graph::WorkflowGraph;
use visitflow_core::settings::NodeSpec;
use visitflow_core::types::Signal;

pub struct SignalTimers {
    tx: mpsc::Sender<Signal>,
    root: CancellationToken,
    inactivity: Mutex<HashMap<u64, CancellationToken>>,
}

impl SignalTimers {
    pub fn new(tx: mpsc::Sender<Signal>) -> Self {
        Self {
            tx,
            root: CancellationToken::new(),
            inactivity: Mutex::new(HashMap::new()),
        }
    }

    fn spawn(&self, after: u64, token: CancellationToken, signal: Signal) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(after)) => {
                    debug!(?signal, "Timer signal");
                    let _ = tx.send(signal).await;
                }
            }
        });
    }

    /// Emit `TimeSpent { seconds }` once, `seconds` after arming.
    pub fn arm_time_spent(&self, seconds: u64) {
        self.spawn(seconds, self.root.child_token(), Signal::TimeSpent { seconds });
    }

    /// Emit `Inactivity { seconds }` unless `activity` is reported first.
    pub fn arm_inactivity(&self, seconds: u64) {
        let token = self.root.child_token();
        let previous = self
            .inactivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seconds, token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.spawn(seconds, token, Signal::Inactivity { seconds });
    }

    /// Visitor interacted; restart every inactivity countdown.
    pub fn activity(&self) {
        let spans: Vec<u64> = self
            .inactivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for seconds in spans {
            self.arm_inactivity(seconds);
        }
    }

    /// Arm one timer per distinct threshold used by the given workflows.
    pub fn arm_for(&self, graphs: &[Arc<WorkflowGraph>]) {
        let mut spent = BTreeSet::new();
        let mut idle = BTreeSet::new();
        for graph in graphs {
            for trigger in graph.triggers() {
                match graph.spec(&trigger.id) {
                    Some(NodeSpec::TimeSpent { seconds }) => {
                        spent.insert(*seconds);
                    }
                    Some(NodeSpec::Inactivity { seconds }) => {
                        idle.insert(*seconds);
                    }
                    _ => {}
                }
            }
        }
        spent.into_iter().for_each(|s| self.arm_time_spent(s));
        idle.into_iter().for_each(|s| self.arm_inactivity(s));
    }

    pub fn shutdown(&self) {
        self.root.cancel();
        self.inactivity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for SignalTimers {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
