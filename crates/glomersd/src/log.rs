//! Replicated append-only log
//!
//! One log per key. The key's primary assigns offsets under the key's mutex;
//! replicas only apply entries pushed by the primary, strictly in offset order,
//! buffering anything that arrives early.

use glomers_core::placement::Placement;
use glomers_core::types::{LogKey, NodeId, Offset};
use glomers_core::ErrorCode;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Committed offset reported for a key that was never committed
pub const NO_COMMITTED_OFFSET: i64 = -1;

/// Log errors
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Node is not primary for {key}, primary is {primary}")]
    NotPrimary { key: LogKey, primary: NodeId },
    #[error("Negative offset {offset} for {key}")]
    NegativeOffset { key: LogKey, offset: i64 },
}

impl LogError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LogError::NotPrimary { .. } => ErrorCode::TemporarilyUnavailable,
            LogError::NegativeOffset { .. } => ErrorCode::MalformedRequest,
        }
    }
}

/// Result type for log operations
pub type Result<T> = std::result::Result<T, LogError>;

#[derive(Debug, Default)]
struct KeyLog {
    /// Entry at index i has offset i
    entries: Vec<u64>,
    committed: Option<Offset>,
    /// Replica side: entries received ahead of the next expected offset
    pending: BTreeMap<Offset, u64>,
    /// When the current gap was first seen (or last resync was requested)
    gap_since: Option<Instant>,
    resync_attempts: u32,
}

impl KeyLog {
    fn next_offset(&self) -> Offset {
        self.entries.len() as Offset
    }

    fn max_offset(&self) -> Option<Offset> {
        self.next_offset().checked_sub(1)
    }

    /// Raise the watermark to `requested`, clamped to the highest entry held.
    /// Returns whether it moved.
    fn raise_committed(&mut self, requested: Offset) -> bool {
        let Some(max) = self.max_offset() else {
            return false;
        };
        let target = requested.min(max);
        match self.committed {
            Some(current) if current >= target => false,
            _ => {
                self.committed = Some(target);
                true
            }
        }
    }
}

/// A replica key whose gap outlasted the timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapReport {
    pub key: LogKey,
    /// First missing offset
    pub from: Offset,
    /// Resync requests made for this gap, this one included
    pub attempts: u32,
    /// True the first time the key crosses the attempt limit
    pub newly_degraded: bool,
}

/// Per-key logs for every key this node has seen
pub struct LogEngine {
    local: NodeId,
    placement: Placement,
    logs: RwLock<HashMap<LogKey, Arc<Mutex<KeyLog>>>>,
    degraded: RwLock<BTreeSet<LogKey>>,
    poll_batch_max: usize,
    max_pending: usize,
}

impl LogEngine {
    pub fn new(
        local: NodeId,
        placement: Placement,
        poll_batch_max: usize,
        max_pending: usize,
    ) -> Self {
        Self {
            local,
            placement,
            logs: RwLock::new(HashMap::new()),
            degraded: RwLock::new(BTreeSet::new()),
            poll_batch_max: poll_batch_max.max(1),
            max_pending,
        }
    }

    pub fn primary_for(&self, key: &str) -> &NodeId {
        self.placement.primary_for(key)
    }

    pub fn is_primary(&self, key: &str) -> bool {
        self.placement.primary_for(key) == &self.local
    }

    fn existing(&self, key: &str) -> Option<Arc<Mutex<KeyLog>>> {
        self.logs.read().get(key).cloned()
    }

    fn key_log(&self, key: &str) -> Arc<Mutex<KeyLog>> {
        if let Some(log) = self.existing(key) {
            return log;
        }
        self.logs
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Append `value` to `key` and return its offset. Only the primary may
    /// append.
    pub fn append(&self, key: &str, value: u64) -> Result<Offset> {
        if !self.is_primary(key) {
            return Err(LogError::NotPrimary {
                key: key.to_string(),
                primary: self.primary_for(key).clone(),
            });
        }

        let log = self.key_log(key);
        let mut log = log.lock();
        let offset = log.next_offset();
        log.entries.push(value);
        Ok(offset)
    }

    /// Entries at or after each requested offset, at most one batch per key.
    /// Every requested key appears in the result, possibly with no entries.
    pub fn poll(&self, offsets: &HashMap<LogKey, i64>) -> Result<HashMap<LogKey, Vec<[u64; 2]>>> {
        let starts = validate_offsets(offsets)?;

        let mut result = HashMap::with_capacity(starts.len());
        for (key, start) in starts {
            let entries = self
                .existing(&key)
                .map(|log| {
                    let log = log.lock();
                    log.entries
                        .iter()
                        .enumerate()
                        .skip(start.min(log.entries.len() as u64) as usize)
                        .take(self.poll_batch_max)
                        .map(|(offset, value)| [offset as u64, *value])
                        .collect()
                })
                .unwrap_or_default();
            result.insert(key, entries);
        }
        Ok(result)
    }

    /// Raise committed offsets. Requests beyond the last entry are clamped,
    /// decreases are ignored, and keys with no local entries are untouched.
    /// Nothing is applied unless every offset is valid.
    pub fn commit(&self, offsets: &HashMap<LogKey, i64>) -> Result<()> {
        let requested = validate_offsets(offsets)?;
        for (key, offset) in requested {
            if let Some(log) = self.existing(&key) {
                log.lock().raise_committed(offset);
            }
        }
        Ok(())
    }

    /// Apply a committed watermark received from a peer. Returns whether it
    /// moved.
    pub fn merge_committed(&self, key: &str, offset: Offset) -> bool {
        self.existing(key)
            .map_or(false, |log| log.lock().raise_committed(offset))
    }

    /// Committed offset for every requested key. Keys that were never
    /// committed here, including keys never written, report
    /// [`NO_COMMITTED_OFFSET`].
    pub fn list_committed(&self, keys: &[LogKey]) -> HashMap<LogKey, i64> {
        keys.iter()
            .map(|key| {
                let committed = self.committed(key);
                (key.clone(), committed.map_or(NO_COMMITTED_OFFSET, |c| c as i64))
            })
            .collect()
    }

    pub fn committed(&self, key: &str) -> Option<Offset> {
        self.existing(key).and_then(|log| log.lock().committed)
    }

    /// Apply entries pushed by the primary, starting at offset `start`, and
    /// return the next offset this replica expects.
    pub fn apply_replicated(
        &self,
        key: &str,
        start: Offset,
        values: &[u64],
        committed: Option<Offset>,
        now: Instant,
    ) -> Offset {
        let log = self.key_log(key);
        let mut log = log.lock();

        for (i, value) in values.iter().enumerate() {
            let offset = start + i as Offset;
            let next = log.next_offset();
            if offset < next {
                continue;
            }
            if offset == next {
                log.entries.push(*value);
            } else if log.pending.len() < self.max_pending || log.pending.contains_key(&offset) {
                log.pending.insert(offset, *value);
            }
        }

        loop {
            let next = log.next_offset();
            match log.pending.remove(&next) {
                Some(value) => log.entries.push(value),
                None => break,
            }
        }
        let next = log.next_offset();
        log.pending = log.pending.split_off(&next);

        if log.pending.is_empty() {
            if log.gap_since.take().is_some() {
                self.degraded.write().remove(key);
            }
            log.resync_attempts = 0;
        } else if log.gap_since.is_none() {
            log.gap_since = Some(now);
        }

        if let Some(committed) = committed {
            log.raise_committed(committed);
        }
        next
    }

    /// Replica keys whose gap has been open longer than `timeout`. Each report
    /// counts as one resync attempt and restarts the wait.
    pub fn gaps_due(&self, now: Instant, timeout: Duration, max_attempts: u32) -> Vec<GapReport> {
        let logs: Vec<(LogKey, Arc<Mutex<KeyLog>>)> = self
            .logs
            .read()
            .iter()
            .map(|(key, log)| (key.clone(), log.clone()))
            .collect();

        let mut reports = Vec::new();
        for (key, log) in logs {
            let mut log = log.lock();
            let Some(since) = log.gap_since else {
                continue;
            };
            if now.saturating_duration_since(since) < timeout {
                continue;
            }
            log.gap_since = Some(now);
            log.resync_attempts = log.resync_attempts.saturating_add(1);

            let newly_degraded =
                log.resync_attempts >= max_attempts && self.degraded.write().insert(key.clone());
            reports.push(GapReport {
                from: log.next_offset(),
                attempts: log.resync_attempts,
                newly_degraded,
                key,
            });
        }
        reports.sort_by(|a, b| a.key.cmp(&b.key));
        reports
    }

    /// Up to `max` entries of `key` starting at `start`
    pub fn entries_from(&self, key: &str, start: Offset, max: usize) -> Vec<u64> {
        self.existing(key)
            .map(|log| {
                let log = log.lock();
                log.entries
                    .iter()
                    .skip(start.min(log.entries.len() as u64) as usize)
                    .take(max)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of entries held for `key`
    pub fn len(&self, key: &str) -> Offset {
        self.existing(key).map_or(0, |log| log.lock().next_offset())
    }

    /// Keys this node is primary for and holds entries of
    pub fn owned_keys(&self) -> Vec<LogKey> {
        let mut keys: Vec<LogKey> = self
            .logs
            .read()
            .keys()
            .filter(|key| self.is_primary(key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn key_count(&self) -> usize {
        self.logs.read().len()
    }

    pub fn degraded_keys(&self) -> Vec<LogKey> {
        self.degraded.read().iter().cloned().collect()
    }
}

/// Reject the whole request if any offset is negative.
fn validate_offsets(offsets: &HashMap<LogKey, i64>) -> Result<Vec<(LogKey, Offset)>> {
    offsets
        .iter()
        .map(|(key, offset)| {
            u64::try_from(*offset)
                .map(|offset| (key.clone(), offset))
                .map_err(|_| LogError::NegativeOffset {
                    key: key.clone(),
                    offset: *offset,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Single-node engine: primary for every key
    fn solo() -> LogEngine {
        let placement = Placement::new(vec!["n0".into()]).unwrap();
        LogEngine::new("n0".into(), placement, 50, 16)
    }

    /// Pair of engines over the same two-node cluster
    fn pair() -> (LogEngine, LogEngine) {
        let nodes: Vec<NodeId> = vec!["n0".into(), "n1".into()];
        let placement = Placement::new(nodes).unwrap();
        (
            LogEngine::new("n0".into(), placement.clone(), 50, 16),
            LogEngine::new("n1".into(), placement, 50, 16),
        )
    }

    fn key_owned_by(engine: &LogEngine, owner: &str) -> String {
        (0..)
            .map(|i| format!("k{}", i))
            .find(|key| engine.primary_for(key).as_str() == owner)
            .unwrap()
    }

    fn offsets(entries: &[(&str, i64)]) -> HashMap<LogKey, i64> {
        entries
            .iter()
            .map(|(key, offset)| (key.to_string(), *offset))
            .collect()
    }

    #[test]
    fn test_append_then_poll() {
        let log = solo();
        assert_eq!(log.append("k1", 10).unwrap(), 0);
        assert_eq!(log.append("k1", 20).unwrap(), 1);

        let result = log.poll(&offsets(&[("k1", 0)])).unwrap();
        assert_eq!(result["k1"], vec![[0, 10], [1, 20]]);

        let result = log.poll(&offsets(&[("k1", 1), ("k2", 0), ("k1x", 7)])).unwrap();
        assert_eq!(result["k1"], vec![[1, 20]]);
        assert!(result["k2"].is_empty());
        assert!(result["k1x"].is_empty());
    }

    #[test]
    fn test_poll_past_end_is_empty() {
        let log = solo();
        log.append("k1", 1).unwrap();
        let result = log.poll(&offsets(&[("k1", 5)])).unwrap();
        assert!(result["k1"].is_empty());
    }

    #[test]
    fn test_poll_is_bounded() {
        let placement = Placement::new(vec!["n0".into()]).unwrap();
        let log = LogEngine::new("n0".into(), placement, 3, 16);
        for v in 0..10 {
            log.append("k1", v).unwrap();
        }
        let result = log.poll(&offsets(&[("k1", 2)])).unwrap();
        assert_eq!(result["k1"], vec![[2, 2], [3, 3], [4, 4]]);
    }

    #[test]
    fn test_negative_offsets_rejected() {
        let log = solo();
        log.append("k1", 1).unwrap();

        let err = log.poll(&offsets(&[("k1", -1)])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedRequest);

        let err = log.commit(&offsets(&[("k1", 0), ("k2", -3)])).unwrap_err();
        assert!(matches!(err, LogError::NegativeOffset { offset: -3, .. }));
        assert_eq!(log.committed("k1"), None);
    }

    #[test]
    fn test_commit_is_monotonic_and_clamped() {
        let log = solo();
        log.append("k1", 1).unwrap();
        log.append("k1", 2).unwrap();

        log.commit(&offsets(&[("k1", 1)])).unwrap();
        assert_eq!(log.list_committed(&["k1".into()])["k1"], 1);

        log.commit(&offsets(&[("k1", 0)])).unwrap();
        assert_eq!(log.list_committed(&["k1".into()])["k1"], 1);

        log.append("k1", 3).unwrap();
        log.commit(&offsets(&[("k1", 99)])).unwrap();
        assert_eq!(log.committed("k1"), Some(2));
    }

    #[test]
    fn test_list_committed_floor() {
        let log = solo();
        log.append("k1", 1).unwrap();

        let listed = log.list_committed(&["k1".into(), "missing".into()]);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed["k1"], NO_COMMITTED_OFFSET);
        assert_eq!(listed["missing"], NO_COMMITTED_OFFSET);

        // Commits on unknown keys are ignored.
        log.commit(&offsets(&[("missing", 4)])).unwrap();
        assert_eq!(
            log.list_committed(&["missing".into()])["missing"],
            NO_COMMITTED_OFFSET
        );
    }

    #[test]
    fn test_non_primary_append_refused() {
        let (n0, n1) = pair();
        let key = key_owned_by(&n0, "n0");

        assert!(n0.append(&key, 1).is_ok());
        match n1.append(&key, 1) {
            Err(LogError::NotPrimary { primary, .. }) => assert_eq!(primary.as_str(), "n0"),
            other => panic!("expected NotPrimary, got {:?}", other),
        }
        assert_eq!(n1.len(&key), 0);
    }

    #[test]
    fn test_concurrent_appends_get_unique_offsets() {
        let log = Arc::new(solo());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|i| log.append("k1", t * 1000 + i).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<Offset> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..800).collect::<Vec<_>>());
    }

    #[test]
    fn test_replica_applies_in_order() {
        let (_, replica) = pair();
        let now = Instant::now();

        assert_eq!(replica.apply_replicated("k", 0, &[5, 6], None, now), 2);
        // Duplicate push is harmless.
        assert_eq!(replica.apply_replicated("k", 0, &[5, 6], Some(1), now), 2);
        assert_eq!(replica.committed("k"), Some(1));
        assert_eq!(replica.entries_from("k", 0, 10), vec![5, 6]);
    }

    #[test]
    fn test_replica_buffers_out_of_order() {
        let (_, replica) = pair();
        let now = Instant::now();

        assert_eq!(replica.apply_replicated("k", 2, &[7, 8], None, now), 0);
        assert_eq!(replica.len("k"), 0);

        assert_eq!(replica.apply_replicated("k", 0, &[5, 6], None, now), 4);
        assert_eq!(replica.entries_from("k", 0, 10), vec![5, 6, 7, 8]);
        assert!(replica
            .gaps_due(now + Duration::from_secs(10), Duration::from_secs(1), 5)
            .is_empty());
    }

    #[test]
    fn test_replica_pending_is_bounded() {
        let nodes: Vec<NodeId> = vec!["n0".into(), "n1".into()];
        let placement = Placement::new(nodes).unwrap();
        let replica = LogEngine::new("n1".into(), placement, 50, 2);
        let now = Instant::now();

        replica.apply_replicated("k", 5, &[1, 2, 3, 4], None, now);
        assert_eq!(replica.apply_replicated("k", 0, &[0, 0, 0, 0, 0], None, now), 7);
    }

    #[test]
    fn test_gap_reports_and_degradation() {
        let (_, replica) = pair();
        let start = Instant::now();
        let timeout = Duration::from_millis(100);

        replica.apply_replicated("k", 3, &[9], None, start);
        assert!(replica.gaps_due(start, timeout, 2).is_empty());

        let first = replica.gaps_due(start + timeout, timeout, 2);
        assert_eq!(
            first,
            vec![GapReport {
                key: "k".into(),
                from: 0,
                attempts: 1,
                newly_degraded: false,
            }]
        );

        // The wait restarts after each report.
        assert!(replica
            .gaps_due(start + timeout + Duration::from_millis(50), timeout, 2)
            .is_empty());

        let second = replica.gaps_due(start + timeout * 2, timeout, 2);
        assert!(second[0].newly_degraded);
        assert_eq!(replica.degraded_keys(), vec!["k".to_string()]);

        let third = replica.gaps_due(start + timeout * 3, timeout, 2);
        assert_eq!(third[0].attempts, 3);
        assert!(!third[0].newly_degraded);

        // Filling the gap clears the degraded state.
        replica.apply_replicated("k", 0, &[1, 2, 3], None, start + timeout * 4);
        assert!(replica.degraded_keys().is_empty());
        assert_eq!(replica.len("k"), 4);
    }

    #[test]
    fn test_owned_keys() {
        let (n0, _) = pair();
        let mine = key_owned_by(&n0, "n0");
        let theirs = key_owned_by(&n0, "n1");

        n0.append(&mine, 1).unwrap();
        n0.apply_replicated(&theirs, 0, &[1], None, Instant::now());
        assert_eq!(n0.owned_keys(), vec![mine]);
        assert_eq!(n0.key_count(), 2);
    }
}
