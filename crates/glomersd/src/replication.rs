//! Primary-to-replica log replication
//!
//! The primary of each key pushes entries to every replica from the replica's
//! last acknowledged offset. At most one push per (key, replica) is in flight;
//! an unanswered push is repeated after the retry interval. Replicas that sit
//! on a gap for too long ask the primary for a resync.
//!
//! Commits accepted on a replica travel the other way as `commit_sync`. They
//! stay pending, and are resent on the same retry interval, until the primary
//! echoes them in `commit_sync_ok`.

use crate::log::LogEngine;
use glomers_core::placement::Placement;
use glomers_core::types::{LogKey, Message, NodeId, Offset, Payload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy)]
struct InFlightPush {
    end: Offset,
    sent_at: Instant,
}

/// Primary-side view of one replica for one key
#[derive(Debug, Default)]
struct ReplicaProgress {
    /// Next offset the replica expects
    acked: Offset,
    /// Watermark the replica itself reported holding
    committed_confirmed: Option<Offset>,
    in_flight: Option<InFlightPush>,
}

/// A commit forwarded to another node's key, not yet echoed back
#[derive(Debug, Clone, Copy)]
struct PendingCommit {
    offset: Offset,
    sent_at: Instant,
}

/// Replication timing and batching knobs
#[derive(Debug, Clone, Copy)]
pub struct ReplicationSettings {
    pub batch_max: usize,
    pub retry: Duration,
    pub gap_timeout: Duration,
    pub max_resync_attempts: u32,
}

/// Drives replication for the keys this node is primary of, and gap repair for
/// the keys it replicates.
pub struct ReplicationManager {
    local: NodeId,
    placement: Placement,
    log: Arc<LogEngine>,
    progress: Mutex<HashMap<(LogKey, NodeId), ReplicaProgress>>,
    pending_commits: Mutex<HashMap<LogKey, PendingCommit>>,
    settings: ReplicationSettings,
}

impl ReplicationManager {
    pub fn new(
        local: NodeId,
        placement: Placement,
        log: Arc<LogEngine>,
        settings: ReplicationSettings,
    ) -> Self {
        Self {
            local,
            placement,
            log,
            progress: Mutex::new(HashMap::new()),
            pending_commits: Mutex::new(HashMap::new()),
            settings,
        }
    }

    fn replicate_message(
        &self,
        to: &NodeId,
        key: &str,
        progress: &mut ReplicaProgress,
        now: Instant,
    ) -> Message {
        let start = progress.acked;
        let msgs = self.log.entries_from(key, start, self.settings.batch_max);
        let committed = self.log.committed(key);
        progress.in_flight = Some(InFlightPush {
            end: start + msgs.len() as Offset,
            sent_at: now,
        });
        Message::new(
            self.local.clone(),
            to.clone(),
            Payload::Replicate {
                key: key.to_string(),
                start,
                msgs,
                committed,
            },
        )
    }

    /// Pushes due this round, for every owned key and replica that is behind
    /// on entries or on the committed watermark.
    pub fn plan_pushes(&self, now: Instant) -> Vec<Message> {
        let mut progress = self.progress.lock();
        let mut pushes = Vec::new();

        for key in self.log.owned_keys() {
            let len = self.log.len(&key);
            let committed = self.log.committed(&key);

            for replica in self.placement.replicas_for(&key) {
                let state = progress.entry((key.clone(), replica.clone())).or_default();

                if let Some(push) = state.in_flight {
                    if now.saturating_duration_since(push.sent_at) < self.settings.retry {
                        continue;
                    }
                    debug!(
                        "[{}] Retrying push of {}[{}..{}] to {}",
                        self.local, key, state.acked, push.end, replica
                    );
                }

                let behind = state.acked < len || committed > state.committed_confirmed;
                if !behind {
                    state.in_flight = None;
                    continue;
                }
                pushes.push(self.replicate_message(replica, &key, state, now));
            }
        }
        pushes
    }

    /// Replica side of a push. Returns the acknowledgment, or `None` when the
    /// push is for a key this node is primary of.
    pub fn on_replicate(
        &self,
        from: &NodeId,
        key: &str,
        start: Offset,
        msgs: &[u64],
        committed: Option<Offset>,
        now: Instant,
    ) -> Option<Payload> {
        if self.log.is_primary(key) {
            warn!(
                "[{}] Ignoring replicate for {} from {}: this node is its primary",
                self.local, key, from
            );
            return None;
        }
        let next = self.log.apply_replicated(key, start, msgs, committed, now);
        Some(Payload::ReplicateOk {
            key: key.to_string(),
            next,
            committed: self.log.committed(key),
        })
    }

    /// Primary side: the replica reports the next offset it expects and the
    /// watermark it holds. Only that reported watermark counts as confirmed,
    /// so a late ack for an older push cannot vouch for a newer one.
    pub fn on_replicate_ok(
        &self,
        from: &NodeId,
        key: &str,
        next: Offset,
        committed: Option<Offset>,
    ) {
        if let Some(offset) = committed.filter(|_| self.log.is_primary(key)) {
            if self.log.merge_committed(key, offset) {
                debug!(
                    "[{}] Committed offset of {} raised to {} by {}",
                    self.local, key, offset, from
                );
            }
        }

        let len = self.log.len(key);
        let mut progress = self.progress.lock();
        let Some(state) = progress.get_mut(&(key.to_string(), from.clone())) else {
            debug!("[{}] Stray replicate_ok for {} from {}", self.local, key, from);
            return;
        };

        state.acked = next.min(len);
        state.in_flight = None;
        if committed > state.committed_confirmed {
            state.committed_confirmed = committed;
        }
    }

    fn commit_sync_messages(&self, commits: Vec<(LogKey, Offset)>) -> Vec<Message> {
        let mut by_primary: HashMap<NodeId, HashMap<LogKey, Offset>> = HashMap::new();
        for (key, offset) in commits {
            by_primary
                .entry(self.log.primary_for(&key).clone())
                .or_default()
                .insert(key, offset);
        }
        by_primary
            .into_iter()
            .map(|(primary, offsets)| {
                Message::new(self.local.clone(), primary, Payload::CommitSync { offsets })
            })
            .collect()
    }

    /// Record commits for keys owned elsewhere and build the `commit_sync`
    /// messages for their primaries.
    pub fn forward_commits(&self, offsets: &HashMap<LogKey, i64>, now: Instant) -> Vec<Message> {
        let mut pending = self.pending_commits.lock();
        let mut commits = Vec::new();
        for (key, offset) in offsets {
            if *offset < 0 || self.log.is_primary(key) {
                continue;
            }
            let entry = pending.entry(key.clone()).or_insert(PendingCommit {
                offset: *offset as Offset,
                sent_at: now,
            });
            entry.offset = entry.offset.max(*offset as Offset);
            entry.sent_at = now;
            commits.push((key.clone(), entry.offset));
        }
        drop(pending);
        self.commit_sync_messages(commits)
    }

    /// Resend forwarded commits the primary has not echoed within the retry
    /// interval.
    pub fn resend_commits(&self, now: Instant) -> Vec<Message> {
        let mut pending = self.pending_commits.lock();
        let mut commits = Vec::new();
        for (key, commit) in pending.iter_mut() {
            if now.saturating_duration_since(commit.sent_at) < self.settings.retry {
                continue;
            }
            debug!(
                "[{}] Resending commit of {} at {} to {}",
                self.local,
                key,
                commit.offset,
                self.log.primary_for(key)
            );
            commit.sent_at = now;
            commits.push((key.clone(), commit.offset));
        }
        drop(pending);
        self.commit_sync_messages(commits)
    }

    /// Primary side of `commit_sync`. Returns the offsets applied, to be
    /// echoed in `commit_sync_ok`.
    pub fn on_commit_sync(
        &self,
        from: &NodeId,
        offsets: &HashMap<LogKey, Offset>,
    ) -> HashMap<LogKey, Offset> {
        let mut applied = HashMap::with_capacity(offsets.len());
        for (key, offset) in offsets {
            if !self.log.is_primary(key) {
                debug!(
                    "[{}] Ignoring commit_sync for {} from {}, primary is {}",
                    self.local,
                    key,
                    from,
                    self.log.primary_for(key)
                );
                continue;
            }
            self.log.merge_committed(key, *offset);
            applied.insert(key.clone(), *offset);
        }
        applied
    }

    /// The primary has applied these commits; stop resending them. A stale
    /// echo for a lower offset leaves a newer pending commit in place.
    pub fn on_commit_sync_ok(&self, offsets: &HashMap<LogKey, Offset>) {
        let mut pending = self.pending_commits.lock();
        for (key, offset) in offsets {
            if pending.get(key).map_or(false, |c| c.offset <= *offset) {
                pending.remove(key);
            }
        }
    }

    /// Forwarded commits still waiting on their primary
    pub fn pending_commit_count(&self) -> usize {
        self.pending_commits.lock().len()
    }

    /// Primary side: a replica asks to be re-sent everything from `from`.
    pub fn on_resync_request(
        &self,
        requester: &NodeId,
        key: &str,
        from: Offset,
        now: Instant,
    ) -> Option<Message> {
        if !self.log.is_primary(key) {
            warn!(
                "[{}] Resync request for {} from {}, but primary is {}",
                self.local,
                key,
                requester,
                self.log.primary_for(key)
            );
            return None;
        }

        let len = self.log.len(key);
        let mut progress = self.progress.lock();
        let state = progress
            .entry((key.to_string(), requester.clone()))
            .or_default();
        state.acked = from.min(len);
        Some(self.replicate_message(requester, key, state, now))
    }

    /// Resync requests for replica keys whose gap outlasted the timeout.
    pub fn check_gaps(&self, now: Instant) -> Vec<Message> {
        self.log
            .gaps_due(now, self.settings.gap_timeout, self.settings.max_resync_attempts)
            .into_iter()
            .map(|gap| {
                let primary = self.log.primary_for(&gap.key).clone();
                if gap.newly_degraded {
                    error!(
                        "[{}] Key {} still missing offset {} after {} resync attempts, marking degraded",
                        self.local, gap.key, gap.from, gap.attempts
                    );
                } else {
                    warn!(
                        "[{}] Gap in {} at offset {}, asking {} to resync (attempt {})",
                        self.local, gap.key, gap.from, primary, gap.attempts
                    );
                }
                Message::new(
                    self.local.clone(),
                    primary,
                    Payload::ResyncRequest {
                        key: gap.key,
                        from: gap.from,
                    },
                )
            })
            .collect()
    }

    /// Unacknowledged pushes per replica
    pub fn in_flight_counts(&self) -> HashMap<NodeId, usize> {
        let mut counts = HashMap::new();
        for ((_, replica), state) in self.progress.lock().iter() {
            if state.in_flight.is_some() {
                *counts.entry(replica.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}
