//! Process transport
//!
//! Inbound lines are decoded on a reader task and handed to the node over a
//! bounded channel. Outbound messages go through an [`Outbox`], which stamps a
//! fresh `msg_id` on every body and queues it for the writer task.

use crate::framing::{Frame, FrameError, MessageCodec};
use futures::{SinkExt, StreamExt};
use glomers_core::types::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

/// Capacity of the inbound frame queue
pub const INBOUND_QUEUE: usize = 4096;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Outbound side of the transport, shared by every handler and timer task.
#[derive(Clone, Debug)]
pub struct Outbox {
    next_msg_id: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbox {
    /// Create an outbox and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                next_msg_id: Arc::new(AtomicU64::new(1)),
                tx,
            },
            rx,
        )
    }

    /// Queue a message for sending and return the `msg_id` it was given.
    ///
    /// Never blocks. Fails only once the writer side is gone.
    pub fn send(&self, mut message: Message) -> Result<u64, TransportError> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        message.body.msg_id = Some(msg_id);
        self.tx
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)?;
        Ok(msg_id)
    }

    /// Number of messages queued so far.
    pub fn sent_count(&self) -> u64 {
        self.next_msg_id.load(Ordering::Relaxed) - 1
    }
}

/// Running transport: inbound frames plus the outbox feeding the writer.
pub struct Transport {
    inbound: Option<mpsc::Receiver<Frame>>,
    outbox: Outbox,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Speak the protocol over this process's stdin/stdout.
    pub fn stdio() -> Self {
        Self::spawn(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Spawn reader and writer tasks over arbitrary byte streams.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let (outbox, outbound_rx) = Outbox::channel();

        let reader = tokio::spawn(read_loop(reader, inbound_tx));
        let writer = tokio::spawn(write_loop(writer, outbound_rx));

        Self {
            inbound: Some(inbound),
            outbox,
            reader,
            writer,
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Take the inbound frame queue. Returns `None` if it was already taken.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<Frame>> {
        self.inbound.take()
    }

    /// Stop reading and wait until every queued message has been written.
    ///
    /// The writer finishes once all [`Outbox`] clones are dropped, so callers
    /// should release theirs first (or bound the wait).
    pub async fn close(self) {
        let Self {
            inbound,
            outbox,
            reader,
            writer,
        } = self;
        drop(inbound);
        drop(outbox);
        reader.abort();
        if let Err(e) = writer.await {
            if !e.is_cancelled() {
                error!("Writer task failed: {}", e);
            }
        }
    }
}

async fn read_loop<R>(reader: R, inbound_tx: mpsc::Sender<Frame>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, MessageCodec::new());
    while let Some(result) = frames.next().await {
        match result {
            Ok(Frame::Garbage(reason)) => {
                warn!("Dropping unreadable line: {}", reason);
            }
            Ok(frame) => {
                if inbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Transport read error: {}", e);
                break;
            }
        }
    }
    debug!("Inbound stream closed");
}

async fn write_loop<W>(writer: W, mut outbound_rx: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, MessageCodec::new());
    while let Some(message) = outbound_rx.recv().await {
        // Drain whatever else is already queued before flushing once.
        let mut batch = vec![message];
        while let Ok(next) = outbound_rx.try_recv() {
            batch.push(next);
        }

        for message in batch {
            match sink.feed(message).await {
                Ok(()) => {}
                Err(FrameError::Io(e)) => {
                    error!("Transport write error: {}", e);
                    return;
                }
                Err(e) => warn!("Dropping unencodable message: {}", e),
            }
        }
        if let Err(e) = sink.flush().await {
            error!("Transport flush error: {}", e);
            return;
        }
    }
    debug!("Outbound stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use glomers_core::types::{NodeId, Payload};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_outbox_assigns_increasing_ids() {
        let (outbox, mut rx) = Outbox::channel();
        let msg = Message::new(NodeId::from("n1"), NodeId::from("n2"), Payload::Read);

        assert_eq!(outbox.send(msg.clone()).unwrap(), 1);
        assert_eq!(outbox.send(msg).unwrap(), 2);
        assert_eq!(outbox.sent_count(), 2);

        assert_eq!(rx.recv().await.unwrap().body.msg_id, Some(1));
        assert_eq!(rx.recv().await.unwrap().body.msg_id, Some(2));
    }

    #[tokio::test]
    async fn test_outbox_reports_closed_writer() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        let msg = Message::new(NodeId::from("n1"), NodeId::from("n2"), Payload::Read);
        assert!(matches!(
            outbox.send(msg),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_round_trip_over_streams() {
        let (mut harness_in, node_in) = tokio::io::duplex(4096);
        let (node_out, harness_out) = tokio::io::duplex(4096);

        let mut transport = Transport::spawn(node_in, node_out);
        let mut inbound = transport.take_inbound().unwrap();
        let outbox = transport.outbox();
        assert!(transport.take_inbound().is_none());

        harness_in
            .write_all(b"garbage\n{\"src\":\"c1\",\"dest\":\"n1\",\"body\":{\"type\":\"read\",\"msg_id\":3}}\n")
            .await
            .unwrap();

        // Garbage is dropped by the reader; the next frame is the read.
        let frame = inbound.recv().await.unwrap();
        let request = match frame {
            Frame::Message(m) => m,
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(request.body.msg_id, Some(3));

        outbox.send(request.reply(Payload::TopologyOk)).unwrap();

        drop(outbox);
        drop(inbound);
        transport.close().await;

        let mut lines = BufReader::new(harness_out).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let reply: Message = serde_json::from_str(&line).unwrap();
        assert_eq!(reply.body.in_reply_to, Some(3));
        assert_eq!(reply.dest.as_str(), "c1");
        // Writer closed its side after draining.
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
