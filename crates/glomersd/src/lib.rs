//! glomersd - cluster node for gossip broadcast, a grow-only counter, and a
//! replicated log
//!
//! This daemon provides:
//! - Anti-entropy broadcast over a configurable neighbor topology
//! - A state-based G-counter merged on its own timer
//! - Per-key append-only logs with a static primary and push replication
//! - Commit watermarks forwarded to and propagated from each key's primary

pub mod broadcast;
pub mod config;
pub mod counter;
pub mod log;
pub mod node;
pub mod replication;
pub mod server;
pub mod topology;

pub use broadcast::BroadcastEngine;
pub use config::{Config, TopologyStrategy, Workload};
pub use counter::CounterService;
pub use log::LogEngine;
pub use node::{Node, NodeStats};
pub use replication::ReplicationManager;
pub use server::Server;
pub use topology::Topology;
