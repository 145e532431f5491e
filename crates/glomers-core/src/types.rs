//! Wire types for the node protocol
//!
//! Every message is a JSON object `{src, dest, body}`. The body carries the
//! `type` discriminator, the optional `msg_id` / `in_reply_to` correlation ids,
//! and a type-specific payload flattened next to them.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;

/// Offset within a single key's log.
pub type Offset = u64;

/// Name of a replicated log.
pub type LogKey = String;

// =============================================================================
// IDENTITY
// =============================================================================

/// Node or client identifier as assigned by the harness (`n1`, `c4`, `seq-kv`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Clients are named `c<N>`; cluster members are named `n<N>`.
    pub fn is_client(&self) -> bool {
        self.0.starts_with('c')
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// A single line on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub src: NodeId,
    pub dest: NodeId,
    pub body: Body,
}

impl Message {
    pub fn new(src: NodeId, dest: NodeId, payload: Payload) -> Self {
        Self {
            src,
            dest,
            body: Body::new(payload),
        }
    }

    /// Build the reply to this message. The outbox assigns `msg_id` on send.
    pub fn reply(&self, payload: Payload) -> Self {
        Self {
            src: self.dest.clone(),
            dest: self.src.clone(),
            body: Body {
                msg_id: None,
                in_reply_to: self.body.msg_id,
                payload,
            },
        }
    }

    /// Build an `error` reply carrying the given code.
    pub fn error_reply(&self, code: ErrorCode, text: impl Into<String>) -> Self {
        self.reply(Payload::Error {
            code,
            text: Some(text.into()),
        })
    }
}

/// Message body: correlation ids plus the typed payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Body {
    pub fn new(payload: Payload) -> Self {
        Self {
            msg_id: None,
            in_reply_to: None,
            payload,
        }
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Every message type a node understands.
///
/// Client-facing requests and their replies come first, then the peer-only
/// types that nodes exchange among themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    // -- startup ------------------------------------------------------------
    Init {
        node_id: NodeId,
        node_ids: Vec<NodeId>,
    },
    InitOk,
    Topology {
        topology: HashMap<NodeId, Vec<NodeId>>,
    },
    TopologyOk,

    // -- broadcast / counter ------------------------------------------------
    Broadcast {
        message: u64,
    },
    BroadcastOk,
    Read,
    ReadOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<u64>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<u64>,
    },
    Add {
        delta: i64,
    },
    AddOk,

    // -- log ----------------------------------------------------------------
    Send {
        key: LogKey,
        msg: u64,
    },
    SendOk {
        offset: Offset,
    },
    Poll {
        offsets: HashMap<LogKey, i64>,
    },
    PollOk {
        msgs: HashMap<LogKey, Vec<[u64; 2]>>,
    },
    CommitOffsets {
        offsets: HashMap<LogKey, i64>,
    },
    CommitOffsetsOk,
    ListCommittedOffsets {
        keys: Vec<LogKey>,
    },
    ListCommittedOffsetsOk {
        offsets: HashMap<LogKey, i64>,
    },

    Error {
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    // -- peer only ----------------------------------------------------------
    Gossip {
        messages: Vec<u64>,
    },
    GossipOk {
        messages: Vec<u64>,
    },
    CounterMerge {
        counters: HashMap<NodeId, u64>,
    },
    Replicate {
        key: LogKey,
        start: Offset,
        msgs: Vec<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        committed: Option<Offset>,
    },
    /// `committed` is the replica's own watermark after applying the push.
    ReplicateOk {
        key: LogKey,
        next: Offset,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        committed: Option<Offset>,
    },
    ResyncRequest {
        key: LogKey,
        from: Offset,
    },
    ForwardSend {
        key: LogKey,
        msg: u64,
        client: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<u64>,
    },
    ForwardSendOk {
        offset: Offset,
        client: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<u64>,
    },
    CommitSync {
        offsets: HashMap<LogKey, Offset>,
    },
    /// Echoes the `commit_sync` offsets the primary has applied.
    CommitSyncOk {
        offsets: HashMap<LogKey, Offset>,
    },
}

impl Payload {
    /// Peer-only types that external clients never issue.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Payload::Gossip { .. }
                | Payload::GossipOk { .. }
                | Payload::CounterMerge { .. }
                | Payload::Replicate { .. }
                | Payload::ReplicateOk { .. }
                | Payload::ResyncRequest { .. }
                | Payload::ForwardSend { .. }
                | Payload::ForwardSendOk { .. }
                | Payload::CommitSync { .. }
                | Payload::CommitSyncOk { .. }
        )
    }

    /// Wire name of the payload type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Init { .. } => "init",
            Payload::InitOk => "init_ok",
            Payload::Topology { .. } => "topology",
            Payload::TopologyOk => "topology_ok",
            Payload::Broadcast { .. } => "broadcast",
            Payload::BroadcastOk => "broadcast_ok",
            Payload::Read => "read",
            Payload::ReadOk { .. } => "read_ok",
            Payload::Add { .. } => "add",
            Payload::AddOk => "add_ok",
            Payload::Send { .. } => "send",
            Payload::SendOk { .. } => "send_ok",
            Payload::Poll { .. } => "poll",
            Payload::PollOk { .. } => "poll_ok",
            Payload::CommitOffsets { .. } => "commit_offsets",
            Payload::CommitOffsetsOk => "commit_offsets_ok",
            Payload::ListCommittedOffsets { .. } => "list_committed_offsets",
            Payload::ListCommittedOffsetsOk { .. } => "list_committed_offsets_ok",
            Payload::Error { .. } => "error",
            Payload::Gossip { .. } => "gossip",
            Payload::GossipOk { .. } => "gossip_ok",
            Payload::CounterMerge { .. } => "counter_merge",
            Payload::Replicate { .. } => "replicate",
            Payload::ReplicateOk { .. } => "replicate_ok",
            Payload::ResyncRequest { .. } => "resync_request",
            Payload::ForwardSend { .. } => "forward_send",
            Payload::ForwardSendOk { .. } => "forward_send_ok",
            Payload::CommitSync { .. } => "commit_sync",
            Payload::CommitSyncOk { .. } => "commit_sync_ok",
        }
    }
}
