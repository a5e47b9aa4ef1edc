//! Wire vocabulary of the signaling channel. Requests arrive as
//! `{id?, type, data}`; acknowledgements go back as `{id, type: "ack"}`
//! and server emissions as `{type, data}`. RTP blobs stay opaque
//! (`serde_json::Value`) until the SFU layer needs them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientSignal {
    #[serde(rename = "joinRoom", rename_all = "camelCase")]
    JoinRoom {
        room_code: String,
        name: Option<String>,
        email: Option<String>,
        picture: Option<String>,
    },
    #[serde(rename = "leaveRoom")]
    LeaveRoom,
    #[serde(rename = "createTransport", rename_all = "camelCase")]
    CreateTransport { is_producer: bool },
    #[serde(rename = "connectTransport", rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename = "produce", rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: String,
        rtp_parameters: Value,
        #[serde(default)]
        app_data: Value,
    },
    #[serde(rename = "consume", rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    #[serde(rename = "closeProducer", rename_all = "camelCase")]
    CloseProducer { producer_id: String },
    #[serde(rename = "pauseProducer", rename_all = "camelCase")]
    PauseProducer { producer_id: String },
    #[serde(rename = "resumeProducer", rename_all = "camelCase")]
    ResumeProducer { producer_id: String },
    #[serde(rename = "replaceTrack", rename_all = "camelCase")]
    ReplaceTrack { producer_id: String },
    #[serde(rename = "chat:send", rename_all = "camelCase")]
    ChatSend {
        content: String,
        recipient_id: Option<String>,
        client_message_id: Option<String>,
    },
    #[serde(rename = "chat:history", rename_all = "camelCase")]
    ChatHistory {
        limit: Option<u32>,
        cursor: Option<String>,
        participant_id: Option<String>,
    },
    #[serde(rename = "audio-mute", rename_all = "camelCase")]
    AudioMute {
        is_audio_muted: bool,
        uid: Option<String>,
    },
    #[serde(rename = "video-mute", rename_all = "camelCase")]
    VideoMute {
        is_video_muted: bool,
        uid: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerSignal {
    #[serde(rename = "user-joined", rename_all = "camelCase")]
    UserJoined {
        user_id: String,
        name: String,
        picture: Option<String>,
    },
    #[serde(rename = "user-left", rename_all = "camelCase")]
    UserLeft { user_id: String, name: String },
    #[serde(rename = "new-producer", rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        user_id: String,
        kind: String,
        source: String,
        name: String,
        app_data: Value,
    },
    #[serde(rename = "screen-share-started", rename_all = "camelCase")]
    ScreenShareStarted {
        producer_id: String,
        user_id: String,
        name: String,
    },
    #[serde(rename = "screen-share-stopped", rename_all = "camelCase")]
    ScreenShareStopped {
        producer_id: String,
        user_id: String,
    },
    #[serde(rename = "producer-closed", rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        user_id: String,
    },
    #[serde(rename = "producer-paused", rename_all = "camelCase")]
    ProducerPaused {
        producer_id: String,
        user_id: String,
    },
    #[serde(rename = "producer-resumed", rename_all = "camelCase")]
    ProducerResumed {
        producer_id: String,
        user_id: String,
    },
    #[serde(rename = "producer-track-replaced", rename_all = "camelCase")]
    ProducerTrackReplaced {
        producer_id: String,
        user_id: String,
    },
    #[serde(rename = "chat:message", rename_all = "camelCase")]
    ChatMessage { message: ChatMessagePayload },
    #[serde(rename = "audio-mute-changed", rename_all = "camelCase")]
    AudioMuteChanged {
        user_id: String,
        is_audio_muted: bool,
        forced: bool,
    },
    #[serde(rename = "video-mute-changed", rename_all = "camelCase")]
    VideoMuteChanged {
        user_id: String,
        is_video_muted: bool,
        forced: bool,
    },
    #[serde(rename = "recording-started", rename_all = "camelCase")]
    RecordingStarted { session_id: String },
    #[serde(rename = "recording-stopped", rename_all = "camelCase")]
    RecordingStopped { session_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub recipient_id: Option<String>,
    pub content: String,
    pub client_message_id: Option<String>,
    pub created_at_ms: i64,
}

impl From<&connect_db::models::ChatMessage> for ChatMessagePayload {
    fn from(message: &connect_db::models::ChatMessage) -> Self {
        Self {
            id: message.id.map(|id| id.to_hex()).unwrap_or_default(),
            sender_id: message.sender_id.to_hex(),
            sender_name: message.sender_name.clone(),
            recipient_id: message.recipient_id.map(|id| id.to_hex()),
            content: message.content.clone(),
            client_message_id: message.client_message_id.clone(),
            created_at_ms: message.created_at.timestamp_millis(),
        }
    }
}

/// Splits a raw frame into its ack id and typed signal. The outer error is
/// unparseable JSON (no ack possible); the inner one is an unknown or
/// malformed event that can still be acked negatively.
pub fn parse_envelope(
    text: &str,
) -> Result<(Option<u64>, Result<ClientSignal, String>), String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("malformed message: {e}"))?;
    let id = value.get("id").and_then(|id| id.as_u64());
    let signal = serde_json::from_value(value)
        .map_err(|e| format!("unknown or malformed event: {e}"));
    Ok((id, signal))
}

pub fn ack_ok(id: u64, data: Value) -> Value {
    json!({ "id": id, "type": "ack", "data": data })
}

pub fn ack_err(id: u64, code: &str, message: &str) -> Value {
    json!({
        "id": id,
        "type": "ack",
        "data": { "success": false, "error": message, "code": code },
    })
}

pub fn event_json(signal: &ServerSignal) -> Value {
    serde_json::to_value(signal).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_envelope_parses() {
        let (id, signal) = parse_envelope(
            r#"{"id":7,"type":"joinRoom","data":{"roomCode":"AAAA-bbbb-cccc","name":"Alice"}}"#,
        )
        .unwrap();
        assert_eq!(id, Some(7));
        match signal.unwrap() {
            ClientSignal::JoinRoom {
                room_code, name, ..
            } => {
                assert_eq!(room_code, "AAAA-bbbb-cccc");
                assert_eq!(name.as_deref(), Some("Alice"));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn leave_room_needs_no_data() {
        let (id, signal) = parse_envelope(r#"{"type":"leaveRoom"}"#).unwrap();
        assert_eq!(id, None);
        assert!(matches!(signal.unwrap(), ClientSignal::LeaveRoom));
    }

    #[test]
    fn produce_keeps_rtp_parameters_opaque() {
        let (_, signal) = parse_envelope(
            r#"{"id":1,"type":"produce","data":{
                "transportId":"t1","kind":"audio",
                "rtpParameters":{"codecs":[{"weird":"stuff"}]},
                "appData":{"source":"microphone"}
            }}"#,
        )
        .unwrap();
        match signal.unwrap() {
            ClientSignal::Produce {
                rtp_parameters,
                app_data,
                ..
            } => {
                assert_eq!(rtp_parameters["codecs"][0]["weird"], "stuff");
                assert_eq!(app_data["source"], "microphone");
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected_but_keeps_its_id() {
        let (id, signal) = parse_envelope(r#"{"id":9,"type":"mystery","data":{}}"#).unwrap();
        assert_eq!(id, Some(9));
        assert!(signal.is_err());

        assert!(parse_envelope("not json").is_err());
    }

    #[test]
    fn server_events_use_spec_names() {
        let event = event_json(&ServerSignal::NewProducer {
            producer_id: "p".into(),
            user_id: "u".into(),
            kind: "video".into(),
            source: "screen".into(),
            name: "Alice".into(),
            app_data: serde_json::json!({}),
        });
        assert_eq!(event["type"], "new-producer");
        assert_eq!(event["data"]["producerId"], "p");

        let mute = event_json(&ServerSignal::AudioMuteChanged {
            user_id: "u".into(),
            is_audio_muted: true,
            forced: false,
        });
        assert_eq!(mute["type"], "audio-mute-changed");
        assert_eq!(mute["data"]["isAudioMuted"], true);
    }

    #[test]
    fn ack_shapes() {
        let ok = ack_ok(3, serde_json::json!({"success": true}));
        assert_eq!(ok["id"], 3);
        assert_eq!(ok["type"], "ack");

        let err = ack_err(4, "not_found", "Producer not found or unauthorized");
        assert_eq!(err["data"]["success"], false);
        assert_eq!(err["data"]["error"], "Producer not found or unauthorized");
    }
}
