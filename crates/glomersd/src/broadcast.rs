//! Gossip broadcast engine
//!
//! Keeps the grow-only set of broadcast values and decides, round by round,
//! which values each neighbor still needs. Client broadcasts are answered
//! immediately and only queued here; the gossip timer does all sending.

use glomers_core::types::NodeId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Per-neighbor gossip bookkeeping
#[derive(Debug, Default)]
pub struct PeerGossipState {
    /// Values the neighbor is known to hold (it sent or acknowledged them)
    pub confirmed: HashSet<u64>,
    /// Values sent but not yet acknowledged, with the time they were sent
    pub in_flight: HashMap<u64, Instant>,
}

impl PeerGossipState {
    fn confirm(&mut self, values: &[u64]) {
        for value in values {
            self.confirmed.insert(*value);
            self.in_flight.remove(value);
        }
    }
}

/// One outgoing gossip message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipBatch {
    pub to: NodeId,
    pub values: Vec<u64>,
}

/// Broadcast value store plus anti-entropy planning
pub struct BroadcastEngine {
    known: RwLock<HashSet<u64>>,
    /// Client-originated values not yet offered in a round
    fresh: Mutex<Vec<u64>>,
    peers: Mutex<HashMap<NodeId, PeerGossipState>>,
    batch_max: usize,
    retry: Duration,
}

impl BroadcastEngine {
    pub fn new(batch_max: usize, retry: Duration) -> Self {
        Self {
            known: RwLock::new(HashSet::new()),
            fresh: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            batch_max: batch_max.max(1),
            retry,
        }
    }

    /// Record a client broadcast. Returns whether the value was new.
    pub fn broadcast(&self, value: u64) -> bool {
        let inserted = self.known.write().insert(value);
        if inserted {
            self.fresh.lock().push(value);
        }
        inserted
    }

    /// Snapshot of every known value, ascending.
    pub fn read(&self) -> Vec<u64> {
        let mut values: Vec<u64> = self.known.read().iter().copied().collect();
        values.sort_unstable();
        values
    }

    pub fn len(&self) -> usize {
        self.known.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.read().is_empty()
    }

    /// Merge a peer's gossip. The sender is recorded as holding every value it
    /// sent, so none of them is ever gossiped back to it. Returns the values
    /// that were new here.
    pub fn on_gossip(&self, from: &NodeId, values: &[u64]) -> Vec<u64> {
        let learned: Vec<u64> = {
            let mut known = self.known.write();
            values.iter().copied().filter(|v| known.insert(*v)).collect()
        };

        self.peers
            .lock()
            .entry(from.clone())
            .or_default()
            .confirm(values);

        learned
    }

    /// The neighbor acknowledged a batch we sent.
    pub fn on_gossip_ok(&self, from: &NodeId, values: &[u64]) {
        self.peers
            .lock()
            .entry(from.clone())
            .or_default()
            .confirm(values);
    }

    /// Plan one gossip round over `neighbors`.
    ///
    /// Each neighbor gets the values it is not confirmed to hold, fresh client
    /// values first, capped at the batch limit. Values already in flight to
    /// that neighbor are held back until they are older than the retry
    /// interval, so an unacknowledged batch is not repeated every round.
    pub fn plan_round(&self, neighbors: &[NodeId], now: Instant) -> Vec<GossipBatch> {
        let known: Vec<u64> = {
            let known = self.known.read();
            let mut values: Vec<u64> = known.iter().copied().collect();
            values.sort_unstable();
            values
        };
        let fresh = std::mem::take(&mut *self.fresh.lock());
        let fresh_set: HashSet<u64> = fresh.iter().copied().collect();

        let mut peers = self.peers.lock();
        let mut batches = Vec::new();

        for neighbor in neighbors {
            let state = peers.entry(neighbor.clone()).or_default();
            let due = |value: &u64| {
                !state.confirmed.contains(value)
                    && state
                        .in_flight
                        .get(value)
                        .map_or(true, |sent| now.saturating_duration_since(*sent) >= self.retry)
            };

            let mut values: Vec<u64> = fresh.iter().copied().filter(|v| due(v)).collect();
            values.extend(
                known
                    .iter()
                    .copied()
                    .filter(|v| !fresh_set.contains(v) && due(v)),
            );
            values.truncate(self.batch_max);

            if values.is_empty() {
                continue;
            }
            for value in &values {
                state.in_flight.insert(*value, now);
            }
            batches.push(GossipBatch {
                to: neighbor.clone(),
                values,
            });
        }

        batches
    }

    /// Unacknowledged values per peer
    pub fn in_flight_counts(&self) -> HashMap<NodeId, usize> {
        self.peers
            .lock()
            .iter()
            .map(|(peer, state)| (peer.clone(), state.in_flight.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> BroadcastEngine {
        BroadcastEngine::new(4, Duration::from_millis(600))
    }

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn test_broadcast_is_idempotent() {
        let engine = engine();
        assert!(engine.broadcast(5));
        assert!(!engine.broadcast(5));
        assert_eq!(engine.read(), vec![5]);
    }

    #[test]
    fn test_round_sends_unconfirmed_values() {
        let engine = engine();
        engine.broadcast(1);
        engine.broadcast(2);

        let batches = engine.plan_round(&ids(&["n2", "n3"]), Instant::now());
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            let mut values = batch.values.clone();
            values.sort_unstable();
            assert_eq!(values, vec![1, 2]);
        }
    }

    #[test]
    fn test_no_echo_to_sender() {
        let engine = engine();
        let learned = engine.on_gossip(&"n2".into(), &[7, 8]);
        assert_eq!(learned, vec![7, 8]);

        let batches = engine.plan_round(&ids(&["n2", "n3"]), Instant::now());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].to.as_str(), "n3");
        assert_eq!(batches[0].values, vec![7, 8]);
    }

    #[test]
    fn test_known_gossip_is_not_relearned() {
        let engine = engine();
        engine.broadcast(3);
        assert!(engine.on_gossip(&"n2".into(), &[3, 4]).contains(&4));
        assert!(engine.on_gossip(&"n3".into(), &[3, 4]).is_empty());
    }

    #[test]
    fn test_in_flight_suppressed_until_retry() {
        let engine = engine();
        engine.broadcast(1);
        let start = Instant::now();
        let neighbors = ids(&["n2"]);

        assert_eq!(engine.plan_round(&neighbors, start).len(), 1);
        // Same batch, still fresh: skipped.
        assert!(engine
            .plan_round(&neighbors, start + Duration::from_millis(200))
            .is_empty());
        // Past the retry interval: resent.
        let retry = engine.plan_round(&neighbors, start + Duration::from_millis(700));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].values, vec![1]);
    }

    #[test]
    fn test_new_value_not_blocked_by_in_flight() {
        let engine = engine();
        let start = Instant::now();
        let neighbors = ids(&["n2"]);

        engine.broadcast(1);
        engine.plan_round(&neighbors, start);
        engine.broadcast(2);

        let batches = engine.plan_round(&neighbors, start + Duration::from_millis(200));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].values, vec![2]);
    }

    #[test]
    fn test_ack_stops_resending() {
        let engine = engine();
        engine.broadcast(1);
        let start = Instant::now();
        let neighbors = ids(&["n2"]);

        engine.plan_round(&neighbors, start);
        engine.on_gossip_ok(&"n2".into(), &[1]);

        assert!(engine
            .plan_round(&neighbors, start + Duration::from_secs(5))
            .is_empty());
        assert_eq!(engine.in_flight_counts()[&NodeId::from("n2")], 0);
    }

    #[test]
    fn test_batch_cap_puts_fresh_values_first() {
        let engine = engine();
        engine.on_gossip(&"n9".into(), &[10, 11, 12, 13, 14]);
        engine.broadcast(99);

        let batches = engine.plan_round(&ids(&["n2"]), Instant::now());
        assert_eq!(batches[0].values.len(), 4);
        assert_eq!(batches[0].values[0], 99);
        assert_eq!(&batches[0].values[1..], &[10, 11, 12]);
    }

    #[test]
    fn test_fresh_is_cleared_after_round() {
        let engine = engine();
        engine.broadcast(42);
        engine.plan_round(&ids(&["n2"]), Instant::now());
        assert!(engine.fresh.lock().is_empty());
        assert_eq!(engine.in_flight_counts().get("n2"), Some(&1));
    }
}
