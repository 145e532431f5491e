//! Node context and message dispatch
//!
//! A [`Node`] exists once `init` has been handled. It owns every engine and the
//! outbox, and routes each inbound message to exactly one handler. Timer tasks
//! call the `*_round` methods on the same instance.

use crate::broadcast::BroadcastEngine;
use crate::config::{Config, Workload};
use crate::counter::{effective_fanout, CounterService};
use crate::log::{LogEngine, LogError};
use crate::replication::{ReplicationManager, ReplicationSettings};
use crate::topology::{Topology, TopologyError};
use glomers_core::types::{LogKey, Message, NodeId, Payload};
use glomers_core::ErrorCode;
use glomers_net::Outbox;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time node statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub known_values: usize,
    pub counter_value: u64,
    pub keys: usize,
    pub degraded_keys: Vec<LogKey>,
    pub gossip_in_flight: HashMap<NodeId, usize>,
    pub replication_in_flight: HashMap<NodeId, usize>,
    pub pending_commits: usize,
    pub messages_sent: u64,
}

/// Per-node state shared by the dispatch loop and the timer tasks
pub struct Node {
    config: Config,
    topology: Arc<Topology>,
    broadcast: BroadcastEngine,
    counter: CounterService,
    log: Arc<LogEngine>,
    replication: ReplicationManager,
    outbox: Outbox,
    fanout: usize,
}

impl Node {
    /// Build the node from the `init` handshake.
    pub fn new(
        config: Config,
        node_id: NodeId,
        node_ids: Vec<NodeId>,
        outbox: Outbox,
    ) -> Result<Self, TopologyError> {
        let topology = Arc::new(Topology::new(
            node_id.clone(),
            node_ids,
            config.topology_strategy,
            config.tree_branching,
        )?);
        let placement = topology.placement().clone();

        let log = Arc::new(LogEngine::new(
            node_id.clone(),
            placement.clone(),
            config.poll_batch_max,
            config.max_pending_entries,
        ));
        let replication = ReplicationManager::new(
            node_id.clone(),
            placement.clone(),
            log.clone(),
            ReplicationSettings {
                batch_max: config.replication_batch_max,
                retry: config.replication_retry(),
                gap_timeout: config.gap_timeout(),
                max_resync_attempts: config.max_resync_attempts,
            },
        );
        let fanout = effective_fanout(config.counter_fanout, placement.len());

        info!(
            "[{}] Initialized: {} nodes, workload {:?}, topology {:?}",
            node_id,
            placement.len(),
            config.workload,
            config.topology_strategy
        );

        Ok(Self {
            broadcast: BroadcastEngine::new(config.gossip_batch_max, config.gossip_retry()),
            counter: CounterService::new(node_id, config.counter_stable_rounds),
            topology,
            log,
            replication,
            outbox,
            fanout,
            config,
        })
    }

    pub fn id(&self) -> &NodeId {
        self.topology.local()
    }

    fn send(&self, message: Message) {
        let kind = message.body.payload.kind();
        let dest = message.dest.clone();
        if let Err(e) = self.outbox.send(message) {
            warn!("[{}] Failed to send {} to {}: {}", self.id(), kind, dest, e);
        }
    }

    fn reply(&self, request: &Message, payload: Payload) {
        self.send(request.reply(payload));
    }

    fn reply_error(&self, request: &Message, code: ErrorCode, text: impl Into<String>) {
        self.send(request.error_reply(code, text));
    }

    /// Answer a client whose request was handled on another node.
    fn send_to_client(&self, client: &NodeId, in_reply_to: Option<u64>, payload: Payload) {
        let mut message = Message::new(self.id().clone(), client.clone(), payload);
        message.body.in_reply_to = in_reply_to;
        self.send(message);
    }

    /// Dispatch one inbound message.
    pub fn handle(&self, message: Message) {
        debug!(
            "[{}] <- {} {}",
            self.id(),
            message.src,
            message.body.payload.kind()
        );

        if message.body.payload.is_internal() && message.src.is_client() {
            warn!(
                "[{}] Client {} sent internal message {}",
                self.id(),
                message.src,
                message.body.payload.kind()
            );
            self.reply_error(
                &message,
                ErrorCode::NotSupported,
                format!("{} is not a client operation", message.body.payload.kind()),
            );
            return;
        }

        match &message.body.payload {
            Payload::Init { node_id, .. } => {
                if node_id != self.id() {
                    warn!(
                        "[{}] Ignoring re-init as {}, identity is fixed",
                        self.id(),
                        node_id
                    );
                }
                self.reply(&message, Payload::InitOk);
            }
            Payload::Topology { topology } => {
                self.topology.apply(topology);
                self.reply(&message, Payload::TopologyOk);
            }

            Payload::Broadcast { message: value } => {
                if self.broadcast.broadcast(*value) {
                    debug!("[{}] New value {}", self.id(), value);
                }
                self.reply(&message, Payload::BroadcastOk);
            }
            Payload::Read => self.handle_read(&message),
            Payload::Add { delta } => match self.counter.add(*delta) {
                Ok(_) => self.reply(&message, Payload::AddOk),
                Err(e) => self.reply_error(&message, e.code(), e.to_string()),
            },

            Payload::Send { key, msg } => self.handle_send(&message, key, *msg),
            Payload::Poll { offsets } => match self.log.poll(offsets) {
                Ok(msgs) => self.reply(&message, Payload::PollOk { msgs }),
                Err(e) => self.reply_error(&message, e.code(), e.to_string()),
            },
            Payload::CommitOffsets { offsets } => self.handle_commit(&message, offsets),
            Payload::ListCommittedOffsets { keys } => {
                let offsets = self.log.list_committed(keys);
                self.reply(&message, Payload::ListCommittedOffsetsOk { offsets });
            }

            Payload::Gossip { messages } => {
                let learned = self.broadcast.on_gossip(&message.src, messages);
                if !learned.is_empty() {
                    debug!(
                        "[{}] Learned {} values from {}",
                        self.id(),
                        learned.len(),
                        message.src
                    );
                }
                self.reply(
                    &message,
                    Payload::GossipOk {
                        messages: messages.clone(),
                    },
                );
            }
            Payload::GossipOk { messages } => {
                self.broadcast.on_gossip_ok(&message.src, messages);
            }
            Payload::CounterMerge { counters } => {
                if self.counter.merge(counters) {
                    debug!(
                        "[{}] Counter now {} after merge from {}",
                        self.id(),
                        self.counter.read(),
                        message.src
                    );
                }
            }

            Payload::Replicate {
                key,
                start,
                msgs,
                committed,
            } => {
                if let Some(ack) = self.replication.on_replicate(
                    &message.src,
                    key,
                    *start,
                    msgs,
                    *committed,
                    Instant::now(),
                ) {
                    self.reply(&message, ack);
                }
            }
            Payload::ReplicateOk {
                key,
                next,
                committed,
            } => {
                self.replication
                    .on_replicate_ok(&message.src, key, *next, *committed);
            }
            Payload::ResyncRequest { key, from } => {
                info!(
                    "[{}] {} requested resync of {} from {}",
                    self.id(),
                    message.src,
                    key,
                    from
                );
                if let Some(push) =
                    self.replication
                        .on_resync_request(&message.src, key, *from, Instant::now())
                {
                    self.send(push);
                }
            }
            Payload::ForwardSend {
                key,
                msg,
                client,
                client_msg_id,
            } => match self.log.append(key, *msg) {
                Ok(offset) => self.reply(
                    &message,
                    Payload::ForwardSendOk {
                        offset,
                        client: client.clone(),
                        client_msg_id: *client_msg_id,
                    },
                ),
                Err(e) => {
                    warn!(
                        "[{}] Forwarded send for {} from {} rejected: {}",
                        self.id(),
                        key,
                        message.src,
                        e
                    );
                    self.send_to_client(
                        client,
                        *client_msg_id,
                        Payload::Error {
                            code: e.code(),
                            text: Some(e.to_string()),
                        },
                    );
                }
            },
            Payload::ForwardSendOk {
                offset,
                client,
                client_msg_id,
            } => {
                self.send_to_client(client, *client_msg_id, Payload::SendOk { offset: *offset });
            }
            Payload::CommitSync { offsets } => {
                let offsets = self.replication.on_commit_sync(&message.src, offsets);
                self.reply(&message, Payload::CommitSyncOk { offsets });
            }
            Payload::CommitSyncOk { offsets } => {
                self.replication.on_commit_sync_ok(offsets);
            }

            Payload::Error { code, text } => {
                warn!(
                    "[{}] Error from {}: {} {}",
                    self.id(),
                    message.src,
                    code,
                    text.as_deref().unwrap_or("")
                );
            }
            Payload::InitOk
            | Payload::TopologyOk
            | Payload::BroadcastOk
            | Payload::ReadOk { .. }
            | Payload::AddOk
            | Payload::SendOk { .. }
            | Payload::PollOk { .. }
            | Payload::CommitOffsetsOk
            | Payload::ListCommittedOffsetsOk { .. } => {
                debug!(
                    "[{}] Ignoring unexpected {} from {}",
                    self.id(),
                    message.body.payload.kind(),
                    message.src
                );
            }
        }
    }

    fn handle_read(&self, message: &Message) {
        let payload = match self.config.workload {
            Workload::Broadcast => Payload::ReadOk {
                messages: Some(self.broadcast.read()),
                value: None,
            },
            Workload::GCounter => Payload::ReadOk {
                messages: None,
                value: Some(self.counter.read()),
            },
            Workload::Kafka => {
                self.reply_error(
                    message,
                    ErrorCode::NotSupported,
                    "read is not served by the kafka workload",
                );
                return;
            }
        };
        self.reply(message, payload);
    }

    fn handle_send(&self, message: &Message, key: &str, value: u64) {
        match self.log.append(key, value) {
            Ok(offset) => self.reply(message, Payload::SendOk { offset }),
            Err(LogError::NotPrimary { primary, .. }) => {
                debug!("[{}] Forwarding send for {} to {}", self.id(), key, primary);
                self.send(Message::new(
                    self.id().clone(),
                    primary,
                    Payload::ForwardSend {
                        key: key.to_string(),
                        msg: value,
                        client: message.src.clone(),
                        client_msg_id: message.body.msg_id,
                    },
                ));
            }
            Err(e) => self.reply_error(message, e.code(), e.to_string()),
        }
    }

    fn handle_commit(&self, message: &Message, offsets: &HashMap<LogKey, i64>) {
        if let Err(e) = self.log.commit(offsets) {
            self.reply_error(message, e.code(), e.to_string());
            return;
        }

        // Keys owned elsewhere: pass the request on to their primaries.
        for sync in self.replication.forward_commits(offsets, Instant::now()) {
            self.send(sync);
        }

        self.reply(message, Payload::CommitOffsetsOk);
    }

    /// Answer a message whose envelope parsed but whose body did not.
    pub fn handle_malformed(
        &self,
        src: NodeId,
        dest: NodeId,
        msg_id: Option<u64>,
        reason: &str,
    ) {
        malformed_reply(&self.outbox, src, dest, msg_id, reason);
    }

    /// One gossip round over the current neighbors.
    pub fn gossip_round(&self, now: Instant) -> usize {
        let neighbors = self.topology.neighbors();
        let batches = self.broadcast.plan_round(&neighbors, now);
        let sent = batches.len();
        for batch in batches {
            self.send(Message::new(
                self.id().clone(),
                batch.to,
                Payload::Gossip {
                    messages: batch.values,
                },
            ));
        }
        sent
    }

    /// One counter merge round to randomly chosen peers.
    pub fn counter_round<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let peers = self.topology.peers();
        let Some(plan) = self.counter.plan_merge(&peers, self.fanout, rng) else {
            return 0;
        };
        let sent = plan.targets.len();
        for target in plan.targets {
            self.send(Message::new(
                self.id().clone(),
                target,
                Payload::CounterMerge {
                    counters: plan.counters.clone(),
                },
            ));
        }
        sent
    }

    /// Replication pushes, gap resync requests and unconfirmed commit
    /// forwards.
    pub fn replication_round(&self, now: Instant) -> usize {
        let mut messages = self.replication.plan_pushes(now);
        messages.extend(self.replication.check_gaps(now));
        messages.extend(self.replication.resend_commits(now));
        let sent = messages.len();
        for message in messages {
            self.send(message);
        }
        sent
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            known_values: self.broadcast.len(),
            counter_value: self.counter.read(),
            keys: self.log.key_count(),
            degraded_keys: self.log.degraded_keys(),
            gossip_in_flight: self.broadcast.in_flight_counts(),
            replication_in_flight: self.replication.in_flight_counts(),
            pending_commits: self.replication.pending_commit_count(),
            messages_sent: self.outbox.sent_count(),
        }
    }
}

/// Error reply for an unparseable body. Unknown `type`s get `not-supported`,
/// everything else `malformed-request`. Nothing is sent without a `msg_id`.
pub fn malformed_reply(
    outbox: &Outbox,
    src: NodeId,
    dest: NodeId,
    msg_id: Option<u64>,
    reason: &str,
) {
    warn!("Malformed message from {}: {}", src, reason);
    let Some(msg_id) = msg_id else {
        return;
    };

    let code = if reason.contains("unknown variant") {
        ErrorCode::NotSupported
    } else {
        ErrorCode::MalformedRequest
    };
    let mut reply = Message::new(
        dest,
        src,
        Payload::Error {
            code,
            text: Some(reason.to_string()),
        },
    );
    reply.body.in_reply_to = Some(msg_id);
    if let Err(e) = outbox.send(reply) {
        warn!("Failed to send error reply: {}", e);
    }
}
