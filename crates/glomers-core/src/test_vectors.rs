//! Wire fixtures captured from harness traffic
//!
//! Each fixture is one line exactly as the harness emits it. Decoding must
//! produce the expected payload and re-encoding must keep the fields the
//! harness inspects.

use crate::error::ErrorCode;
use crate::types::*;
use serde_json::json;

fn decode(line: &str) -> Message {
    serde_json::from_str(line).expect("fixture must decode")
}

#[test]
fn init_fixture() {
    let msg = decode(
        r#"{"id":0,"src":"c0","dest":"n1","body":{"type":"init","node_id":"n1","node_ids":["n1","n2","n3"],"msg_id":1}}"#,
    );
    assert_eq!(msg.body.msg_id, Some(1));
    match msg.body.payload {
        Payload::Init { node_id, node_ids } => {
            assert_eq!(node_id.as_str(), "n1");
            assert_eq!(node_ids.len(), 3);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn topology_fixture() {
    let msg = decode(
        r#"{"src":"c1","dest":"n1","body":{"type":"topology","topology":{"n1":["n2","n3"],"n2":["n1"],"n3":["n1"]},"msg_id":2}}"#,
    );
    match msg.body.payload {
        Payload::Topology { topology } => {
            assert_eq!(topology.get("n1").map(Vec::len), Some(2));
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn read_fixture_has_empty_payload() {
    let msg = decode(r#"{"src":"c3","dest":"n2","body":{"type":"read","msg_id":9}}"#);
    assert_eq!(msg.body.payload, Payload::Read);
    assert_eq!(msg.body.msg_id, Some(9));
}

#[test]
fn kafka_fixtures() {
    let send = decode(
        r#"{"src":"c2","dest":"n1","body":{"type":"send","key":"k1","msg":123,"msg_id":4}}"#,
    );
    assert_eq!(
        send.body.payload,
        Payload::Send {
            key: "k1".into(),
            msg: 123
        }
    );

    let poll = decode(
        r#"{"src":"c2","dest":"n1","body":{"type":"poll","offsets":{"k1":1000,"k2":2000},"msg_id":5}}"#,
    );
    match poll.body.payload {
        Payload::Poll { offsets } => assert_eq!(offsets.get("k2"), Some(&2000)),
        other => panic!("unexpected payload {:?}", other),
    }

    let list = decode(
        r#"{"src":"c2","dest":"n1","body":{"type":"list_committed_offsets","keys":["k1","k2"],"msg_id":6}}"#,
    );
    assert!(matches!(
        list.body.payload,
        Payload::ListCommittedOffsets { ref keys } if keys.len() == 2
    ));
}

#[test]
fn poll_ok_encodes_pairs() {
    let mut msgs = std::collections::HashMap::new();
    msgs.insert("k1".to_string(), vec![[0, 9], [1, 5]]);
    let reply = Message {
        src: "n1".into(),
        dest: "c2".into(),
        body: Body {
            msg_id: Some(3),
            in_reply_to: Some(5),
            payload: Payload::PollOk { msgs },
        },
    };

    let value = serde_json::to_value(&reply).unwrap();
    assert_eq!(
        value,
        json!({
            "src": "n1",
            "dest": "c2",
            "body": {"type": "poll_ok", "msg_id": 3, "in_reply_to": 5, "msgs": {"k1": [[0, 9], [1, 5]]}}
        })
    );
}

#[test]
fn read_ok_omits_absent_fields() {
    let body = Body {
        msg_id: None,
        in_reply_to: Some(1),
        payload: Payload::ReadOk {
            messages: None,
            value: Some(42),
        },
    };
    let value = serde_json::to_value(&body).unwrap();
    assert_eq!(value, json!({"type": "read_ok", "in_reply_to": 1, "value": 42}));
}

#[test]
fn error_fixture_uses_numeric_code() {
    let msg = decode(
        r#"{"src":"seq-kv","dest":"n1","body":{"type":"error","in_reply_to":3,"code":22,"text":"expected 1 but had 2"}}"#,
    );
    match msg.body.payload {
        Payload::Error { code, text } => {
            assert_eq!(code, ErrorCode::PreconditionFailed);
            assert!(text.is_some());
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[test]
fn unknown_type_is_rejected() {
    let result = serde_json::from_str::<Message>(
        r#"{"src":"c1","dest":"n1","body":{"type":"txn","msg_id":1}}"#,
    );
    assert!(result.is_err());
}

#[test]
fn replicate_ok_watermark_is_optional() {
    let bare = decode(r#"{"src":"n2","dest":"n0","body":{"type":"replicate_ok","key":"k1","next":4}}"#);
    assert!(matches!(
        bare.body.payload,
        Payload::ReplicateOk { next: 4, committed: None, .. }
    ));

    let with_commit = decode(
        r#"{"src":"n2","dest":"n0","body":{"type":"replicate_ok","key":"k1","next":4,"committed":2}}"#,
    );
    assert!(matches!(
        with_commit.body.payload,
        Payload::ReplicateOk { committed: Some(2), .. }
    ));
}
