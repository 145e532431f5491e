//! Grow-only counter
//!
//! Each node owns one entry of a per-node vector and only ever raises it.
//! Replicas converge by exchanging the whole vector and taking the per-entry
//! maximum, so merges are commutative, idempotent, and order-free.

use glomers_core::types::NodeId;
use glomers_core::ErrorCode;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use thiserror::Error;

/// Counter errors
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Delta must be non-negative, got {0}")]
    NegativeDelta(i64),
}

impl CounterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CounterError::NegativeDelta(_) => ErrorCode::MalformedRequest,
        }
    }
}

#[derive(Debug, Default)]
struct CounterState {
    entries: HashMap<NodeId, u64>,
    /// Bumped on every local or merged change
    generation: u64,
}

/// Tracks how long the vector has been unchanged, so an idle cluster goes quiet.
#[derive(Debug, Default)]
struct QuietTracker {
    last_generation: u64,
    unchanged_rounds: u32,
}

/// One planned `counter_merge` round
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub targets: Vec<NodeId>,
    pub counters: HashMap<NodeId, u64>,
}

/// Per-node G-counter replica
pub struct CounterService {
    local: NodeId,
    state: RwLock<CounterState>,
    quiet: Mutex<QuietTracker>,
    stable_rounds: u32,
}

impl CounterService {
    pub fn new(local: NodeId, stable_rounds: u32) -> Self {
        Self {
            local,
            state: RwLock::new(CounterState::default()),
            quiet: Mutex::new(QuietTracker::default()),
            stable_rounds,
        }
    }

    /// Add `delta` to this node's entry and return the new total.
    pub fn add(&self, delta: i64) -> Result<u64, CounterError> {
        if delta < 0 {
            return Err(CounterError::NegativeDelta(delta));
        }
        let delta = delta as u64;

        let mut state = self.state.write();
        if delta > 0 {
            let entry = state.entries.entry(self.local.clone()).or_insert(0);
            *entry = entry.saturating_add(delta);
            state.generation += 1;
        }
        Ok(total(&state.entries))
    }

    /// Sum of every entry
    pub fn read(&self) -> u64 {
        total(&self.state.read().entries)
    }

    /// Max-merge a remote vector. Returns whether anything changed here.
    ///
    /// A remote vector that is behind ours wakes the merge loop again so the
    /// sender gets repaired even after this node went quiet.
    pub fn merge(&self, remote: &HashMap<NodeId, u64>) -> bool {
        let (changed, remote_behind) = {
            let mut state = self.state.write();
            let mut changed = false;
            for (node, value) in remote {
                let entry = state.entries.entry(node.clone()).or_insert(0);
                if *value > *entry {
                    *entry = *value;
                    changed = true;
                }
            }
            if changed {
                state.generation += 1;
            }
            let remote_behind = state
                .entries
                .iter()
                .any(|(node, value)| remote.get(node).copied().unwrap_or(0) < *value);
            (changed, remote_behind)
        };

        if remote_behind {
            self.quiet.lock().unchanged_rounds = 0;
        }
        changed
    }

    /// Decide whether this tick sends, and to whom.
    ///
    /// Returns `None` when there is nobody to talk to or the vector has been
    /// unchanged for `stable_rounds` consecutive ticks.
    pub fn plan_merge<R: Rng + ?Sized>(
        &self,
        peers: &[NodeId],
        fanout: usize,
        rng: &mut R,
    ) -> Option<MergePlan> {
        if peers.is_empty() {
            return None;
        }

        let (generation, counters) = {
            let state = self.state.read();
            (state.generation, state.entries.clone())
        };
        if counters.is_empty() {
            return None;
        }

        {
            let mut quiet = self.quiet.lock();
            if quiet.last_generation == generation {
                quiet.unchanged_rounds = quiet.unchanged_rounds.saturating_add(1);
            } else {
                quiet.last_generation = generation;
                quiet.unchanged_rounds = 0;
            }
            if quiet.unchanged_rounds >= self.stable_rounds {
                return None;
            }
        }

        let targets: Vec<NodeId> = peers
            .choose_multiple(rng, fanout.clamp(1, peers.len()))
            .cloned()
            .collect();

        Some(MergePlan { targets, counters })
    }
}

fn total(entries: &HashMap<NodeId, u64>) -> u64 {
    entries.values().fold(0u64, |acc, v| acc.saturating_add(*v))
}

/// ceil(log2(cluster_size)), at least 1
pub fn auto_fanout(cluster_size: usize) -> usize {
    if cluster_size <= 2 {
        return 1;
    }
    let bits = usize::BITS - (cluster_size - 1).leading_zeros();
    bits as usize
}

/// Configured fanout, or the automatic one when `configured` is zero.
pub fn effective_fanout(configured: usize, cluster_size: usize) -> usize {
    if configured == 0 {
        auto_fanout(cluster_size)
    } else {
        configured
    }
}
