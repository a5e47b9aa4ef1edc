//! The signaling wire vocabulary, as a client library would see it.

use connect_api::ws::signal::{ClientSignal, ServerSignal, event_json, parse_envelope};
use serde_json::json;

#[test]
fn every_client_event_name_parses() {
    let frames = [
        r#"{"type":"joinRoom","data":{"roomCode":"aaaa-bbbb-cccc"}}"#,
        r#"{"type":"leaveRoom"}"#,
        r#"{"type":"createTransport","data":{"isProducer":true}}"#,
        r#"{"type":"connectTransport","data":{"transportId":"t","dtlsParameters":{}}}"#,
        r#"{"type":"produce","data":{"transportId":"t","kind":"video","rtpParameters":{}}}"#,
        r#"{"type":"consume","data":{"transportId":"t","producerId":"p","rtpCapabilities":{}}}"#,
        r#"{"type":"closeProducer","data":{"producerId":"p"}}"#,
        r#"{"type":"pauseProducer","data":{"producerId":"p"}}"#,
        r#"{"type":"resumeProducer","data":{"producerId":"p"}}"#,
        r#"{"type":"replaceTrack","data":{"producerId":"p"}}"#,
        r#"{"type":"chat:send","data":{"content":"hi"}}"#,
        r#"{"type":"chat:history","data":{"limit":20}}"#,
        r#"{"type":"audio-mute","data":{"isAudioMuted":true,"uid":"u"}}"#,
        r#"{"type":"video-mute","data":{"isVideoMuted":false}}"#,
    ];
    for frame in frames {
        let (_, signal) = parse_envelope(frame).expect("valid json");
        signal.unwrap_or_else(|e| panic!("frame {frame} rejected: {e}"));
    }
}

#[test]
fn remote_producer_emissions_carry_the_full_tuple() {
    let event = event_json(&ServerSignal::NewProducer {
        producer_id: "p1".into(),
        user_id: "u1".into(),
        kind: "audio".into(),
        source: "microphone".into(),
        name: "Alice".into(),
        app_data: json!({"source": "microphone"}),
    });
    for field in ["producerId", "userId", "kind", "name", "appData"] {
        assert!(
            event["data"].get(field).is_some(),
            "missing field: {field}"
        );
    }
}

#[test]
fn dm_and_broadcast_chat_share_one_shape() {
    let (_, signal) = parse_envelope(
        r#"{"id":1,"type":"chat:send","data":{
            "content":"psst",
            "recipientId":"64b7a2f4c2a4f0a1b2c3d4e5",
            "clientMessageId":"local-7"
        }}"#,
    )
    .unwrap();
    match signal.unwrap() {
        ClientSignal::ChatSend {
            content,
            recipient_id,
            client_message_id,
        } => {
            assert_eq!(content, "psst");
            assert_eq!(recipient_id.as_deref(), Some("64b7a2f4c2a4f0a1b2c3d4e5"));
            assert_eq!(client_message_id.as_deref(), Some("local-7"));
        }
        other => panic!("unexpected signal: {other:?}"),
    }
}

#[test]
fn screen_share_events_exist_for_both_edges() {
    let started = event_json(&ServerSignal::ScreenShareStarted {
        producer_id: "p".into(),
        user_id: "u".into(),
        name: "Alice".into(),
    });
    assert_eq!(started["type"], "screen-share-started");

    let stopped = event_json(&ServerSignal::ScreenShareStopped {
        producer_id: "p".into(),
        user_id: "u".into(),
    });
    assert_eq!(stopped["type"], "screen-share-stopped");
}
