//! glomersd server - main service loop

use crate::config::{Config, Workload};
use crate::node::{malformed_reply, Node, NodeStats};
use glomers_core::types::{Message, Payload};
use glomers_core::ErrorCode;
use glomers_net::{Frame, Outbox};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Input closed before init")]
    InputClosed,
}

/// Server state
pub struct Server {
    config: Config,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Held from construction so a shutdown requested before `run` is not lost
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        })
    }

    /// Run the node until input closes or shutdown is requested.
    ///
    /// Nothing but `init` is served until the node knows who it is; earlier
    /// requests are answered with `temporarily-unavailable`.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<Frame>,
        outbox: Outbox,
    ) -> Result<NodeStats, ServerError> {
        let mut shutdown_rx = self
            .shutdown_rx
            .lock()
            .take()
            .unwrap_or_else(|| self.shutdown_tx.subscribe());

        let node = tokio::select! {
            node = self.await_init(&mut inbound, &outbox) => Arc::new(node?),
            _ = shutdown_rx.recv() => {
                info!("Shutdown before init");
                return Ok(NodeStats::default());
            }
        };

        let tasks = self.spawn_timers(&node);

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    match frame {
                        Some(Frame::Message(message)) => node.handle(message),
                        Some(Frame::Malformed { src, dest, msg_id, reason }) => {
                            node.handle_malformed(src, dest, msg_id, &reason);
                        }
                        Some(Frame::Garbage(reason)) => {
                            warn!("[{}] Dropping unreadable input: {}", node.id(), reason);
                        }
                        None => {
                            info!("[{}] Input closed", node.id());
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("[{}] Shutting down...", node.id());
                    break;
                }
            }
        }

        // Stop the timers and wait for them so the node is released.
        let _ = self.shutdown_tx.send(());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }

        let stats = node.stats();
        match serde_json::to_string(&stats) {
            Ok(json) => info!("[{}] Stopped: {}", node.id(), json),
            Err(e) => warn!("[{}] Stopped, stats unavailable: {}", node.id(), e),
        }
        if !stats.degraded_keys.is_empty() {
            error!("[{}] Degraded keys at exit: {:?}", node.id(), stats.degraded_keys);
        }
        Ok(stats)
    }

    async fn await_init(
        &self,
        inbound: &mut mpsc::Receiver<Frame>,
        outbox: &Outbox,
    ) -> Result<Node, ServerError> {
        while let Some(frame) = inbound.recv().await {
            let message = match frame {
                Frame::Message(message) => message,
                Frame::Malformed {
                    src,
                    dest,
                    msg_id,
                    reason,
                } => {
                    malformed_reply(outbox, src, dest, msg_id, &reason);
                    continue;
                }
                Frame::Garbage(reason) => {
                    warn!("Dropping unreadable input: {}", reason);
                    continue;
                }
            };

            let Payload::Init { node_id, node_ids } = &message.body.payload else {
                debug!(
                    "Rejecting {} from {} before init",
                    message.body.payload.kind(),
                    message.src
                );
                reply(
                    outbox,
                    message.error_reply(ErrorCode::TemporarilyUnavailable, "node not initialized"),
                );
                continue;
            };

            match Node::new(
                self.config.clone(),
                node_id.clone(),
                node_ids.clone(),
                outbox.clone(),
            ) {
                Ok(node) => {
                    reply(outbox, message.reply(Payload::InitOk));
                    return Ok(node);
                }
                Err(e) => {
                    error!("Rejecting init: {}", e);
                    reply(
                        outbox,
                        message.error_reply(e.code(), e.to_string()),
                    );
                }
            }
        }
        Err(ServerError::InputClosed)
    }

    /// Start the background loops the configured workload needs.
    fn spawn_timers(&self, node: &Arc<Node>) -> Vec<JoinHandle<()>> {
        match self.config.workload {
            Workload::Broadcast => {
                let node = node.clone();
                vec![self.spawn_ticker("gossip", self.config.gossip_interval(), move |now| {
                    node.gossip_round(now);
                })]
            }
            Workload::GCounter => {
                let node = node.clone();
                let mut rng = StdRng::from_entropy();
                vec![self.spawn_ticker("counter", self.config.counter_interval(), move |_| {
                    node.counter_round(&mut rng);
                })]
            }
            Workload::Kafka => {
                let node = node.clone();
                vec![self.spawn_ticker(
                    "replication",
                    self.config.replication_interval(),
                    move |now| {
                        node.replication_round(now);
                    },
                )]
            }
        }
    }

    /// Run `tick` on a fixed period until shutdown. Late ticks are skipped
    /// rather than bunched up.
    fn spawn_ticker<F>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut(Instant) + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(Instant::now()),
                    _ = shutdown_rx.recv() => {
                        debug!("Stopping {} loop", name);
                        break;
                    }
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn reply(outbox: &Outbox, message: Message) {
    if let Err(e) = outbox.send(message) {
        warn!("Failed to send reply: {}", e);
    }
}
