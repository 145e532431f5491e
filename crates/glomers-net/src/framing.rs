//! Message framing for the line-delimited transport
//!
//! One JSON document per `\n`-terminated line. Lines that cannot be turned
//! into a [`Message`] are surfaced as frames of their own instead of codec
//! errors, because a decode error would end the framed stream.

use bytes::BytesMut;
use glomers_core::types::{Message, NodeId};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Maximum line size (1 MiB)
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line too long (max 1 MiB)")]
    TooLarge,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<LinesCodecError> for FrameError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => FrameError::TooLarge,
            LinesCodecError::Io(e) => FrameError::Io(e),
        }
    }
}

/// One decoded line.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// A well-formed message
    Message(Message),
    /// Valid JSON with enough of an envelope to answer, but an unknown type or
    /// missing fields
    Malformed {
        src: NodeId,
        dest: NodeId,
        msg_id: Option<u64>,
        reason: String,
    },
    /// Not answerable at all
    Garbage(String),
}

/// Just the routing part of an envelope, used to answer malformed requests.
#[derive(Deserialize)]
struct Envelope {
    src: NodeId,
    dest: NodeId,
    #[serde(default)]
    body: EnvelopeBody,
}

#[derive(Default, Deserialize)]
struct EnvelopeBody {
    #[serde(default)]
    msg_id: Option<u64>,
}

/// Classify a single line.
pub fn parse_line(line: &str) -> Frame {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Frame::Garbage(format!("invalid JSON: {}", e)),
    };

    match serde_json::from_value::<Message>(value.clone()) {
        Ok(message) => Frame::Message(message),
        Err(e) => match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) => Frame::Malformed {
                src: envelope.src,
                dest: envelope.dest,
                msg_id: envelope.body.msg_id,
                reason: e.to_string(),
            },
            Err(_) => Frame::Garbage(format!("no envelope: {}", e)),
        },
    }
}

/// Codec for newline-delimited JSON messages
pub struct MessageCodec {
    lines: LinesCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src) {
                Ok(None) => return Ok(None),
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Ok(Some(parse_line(&line))),
                // The inner codec discards the rest of the oversized line.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Frame::Garbage("line too long".into())))
                }
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(None) => return Ok(None),
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Ok(Some(parse_line(&line))),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Frame::Garbage("line too long".into())))
                }
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        if line.len() > MAX_LINE_BYTES {
            return Err(FrameError::TooLarge);
        }
        self.lines.encode(line, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glomers_core::types::Payload;

    #[test]
    fn test_decode_two_lines() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(
            "{\"src\":\"c1\",\"dest\":\"n1\",\"body\":{\"type\":\"read\",\"msg_id\":1}}\n\n{\"src\":\"c1\",\"dest\":\"n1\",\"body\":{\"type\":\"broadcast\",\"message\":4,\"msg_id\":2}}\n",
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Frame::Message(ref m) if m.body.payload == Payload::Read));

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(
            second,
            Frame::Message(ref m) if m.body.payload == Payload::Broadcast { message: 4 }
        ));

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_line_waits() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from("{\"src\":\"c1\",\"dest\"");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b":\"n1\",\"body\":{\"type\":\"read\"}}\n");
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Message(_))
        ));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let frame = parse_line(r#"{"src":"c1","dest":"n1","body":{"type":"cas","msg_id":5}}"#);
        match frame {
            Frame::Malformed { src, msg_id, .. } => {
                assert_eq!(src.as_str(), "c1");
                assert_eq!(msg_id, Some(5));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let frame = parse_line(r#"{"src":"c1","dest":"n1","body":{"type":"add","msg_id":2}}"#);
        assert!(matches!(frame, Frame::Malformed { msg_id: Some(2), .. }));
    }

    #[test]
    fn test_garbage() {
        assert!(matches!(parse_line("not json"), Frame::Garbage(_)));
        assert!(matches!(parse_line("{\"body\":{}}"), Frame::Garbage(_)));
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let msg = Message::new("n1".into(), "c1".into(), Payload::TopologyOk);

        codec.encode(msg, &mut buf).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.contains("\"type\":\"topology_ok\""));
    }
}
