//! Fan-in synchronization for Join nodes.
//!
//! Each (workflow, node, run) gets a lazily created `JoinState` counting
//! arrivals against the node's inbound edge count. The state is consumed
//! exactly once: either the final arrival releases it, or its timeout timer
//! does. Released keys are remembered so late arrivals become no-ops instead
//! of opening a fresh state.
//!
//! Traversals register with [`JoinStateTable::track`]. When the last
//! traversal of a run drops its [`RunTrack`], nothing can arrive for that run
//! anymore, so its tombstones and any orphaned pending states are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use visitflow_core::types::RunId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinKey {
    pub workflow_id: String,
    pub node_id: String,
    pub run_id: RunId,
}

impl JoinKey {
    pub fn new(workflow_id: &str, node_id: &str, run_id: &RunId) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            run_id: run_id.clone(),
        }
    }
}

/// What an arriving branch should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinArrival {
    /// Not all inbound branches have arrived; this path parks.
    Wait { received: usize, required: usize },
    /// This arrival completed the join; continue past it exactly once.
    Release,
    /// The join already released (count or timeout); this path just ends.
    AlreadyReleased,
}

#[derive(Debug)]
struct JoinState {
    received: usize,
    required: usize,
    timer: Option<CancellationToken>,
    locked: bool,
}

#[derive(Default)]
struct JoinTable {
    states: HashMap<JoinKey, JoinState>,
    released: HashSet<JoinKey>,
    active: HashMap<RunId, usize>,
}

impl JoinTable {
    fn forget_run(&mut self, run_id: &RunId) {
        self.states.retain(|key, state| {
            if key.run_id != *run_id {
                return true;
            }
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            false
        });
        self.released.retain(|key| key.run_id != *run_id);
    }
}

/// Keeps a run's join bookkeeping alive while a traversal of it is running.
pub struct RunTrack {
    table: Arc<JoinStateTable>,
    run_id: RunId,
}

impl Drop for RunTrack {
    fn drop(&mut self) {
        self.table.leave(&self.run_id);
    }
}

#[derive(Default)]
pub struct JoinStateTable {
    inner: Mutex<JoinTable>,
}

impl JoinStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register one live traversal of `run_id`.
    pub fn track(self: &Arc<Self>, run_id: &RunId) -> RunTrack {
        *self.lock().active.entry(run_id.clone()).or_insert(0) += 1;
        RunTrack {
            table: self.clone(),
            run_id: run_id.clone(),
        }
    }

    fn leave(&self, run_id: &RunId) {
        let mut table = self.lock();
        let Some(count) = table.active.get_mut(run_id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            table.active.remove(run_id);
            table.forget_run(run_id);
        }
    }

    /// Count one arrival. `required` is the node's inbound edge count.
    pub fn arrive(&self, key: &JoinKey, required: usize) -> JoinArrival {
        let mut table = self.lock();
        if table.released.contains(key) {
            return JoinArrival::AlreadyReleased;
        }

        let state = table.states.entry(key.clone()).or_insert_with(|| JoinState {
            received: 0,
            required: required.max(1),
            timer: None,
            locked: false,
        });
        state.received += 1;

        if state.received < state.required {
            return JoinArrival::Wait {
                received: state.received,
                required: state.required,
            };
        }

        if let Some(state) = table.states.remove(key) {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
        }
        table.released.insert(key.clone());
        JoinArrival::Release
    }

    /// Claim the right to arm the timeout timer. Returns a token only the
    /// first time for a pending state.
    pub fn arm_timer(&self, key: &JoinKey) -> Option<CancellationToken> {
        let mut table = self.lock();
        let state = table.states.get_mut(key)?;
        if state.locked {
            return None;
        }
        let token = CancellationToken::new();
        state.locked = true;
        state.timer = Some(token.clone());
        Some(token)
    }

    /// Timer fired. Returns true if this call consumed the pending state.
    pub fn expire(&self, key: &JoinKey) -> bool {
        let mut table = self.lock();
        if table.states.remove(key).is_none() {
            return false;
        }
        table.released.insert(key.clone());
        true
    }

    pub fn pending(&self) -> usize {
        self.lock().states.len()
    }

    /// Released keys still remembered for late arrivals.
    pub fn tombstones(&self) -> usize {
        self.lock().released.len()
    }

    /// Cancel every armed timer and forget all state.
    pub fn clear(&self) {
        let mut table = self.lock();
        for (_, state) in table.states.drain() {
            if let Some(timer) = state.timer {
                timer.cancel();
            }
        }
        table.released.clear();
        table.active.clear();
    }
}
