//! Tests for signaling wire types

use tandem::{
    ConnectionState, IceCandidate, PresenceRecord, Role, SdpType, SessionConfig,
    SessionDescription, SignalingKind, SignalingMessage, DATA_CHANNEL_LABEL,
    DEFAULT_CHUNK_DELAY_MS, DEFAULT_CHUNK_SIZE,
};

#[test]
fn test_offer_message_shape() {
    let desc = SessionDescription::offer("v=0\r\n");
    let msg = SignalingMessage::offer("peer-a", &desc);
    let json = serde_json::to_value(&msg).unwrap();

    assert_eq!(json["senderId"], "peer-a");
    assert_eq!(json["type"], "offer");
    assert_eq!(json["payload"]["type"], "offer");
    assert_eq!(json["payload"]["sdp"], "v=0\r\n");
}

#[test]
fn test_presence_stamp_on_messages() {
    let msg = SignalingMessage::ready("peer-a");
    let json = serde_json::to_value(&msg).unwrap();
    assert!(json.get("joinedAt").is_none());

    let json = serde_json::to_value(msg.stamped(1700000000000)).unwrap();
    assert_eq!(json["joinedAt"], 1700000000000u64);

    let raw = r#"{"senderId":"peer-b","type":"disconnect","payload":null,"joinedAt":42}"#;
    let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
    assert_eq!(msg.joined_at, Some(42));
}

#[test]
fn test_parse_answer_from_log() {
    let raw = r#"{"senderId":"peer-b","type":"answer","payload":{"type":"answer","sdp":"v=0"}}"#;
    let msg: SignalingMessage = serde_json::from_str(raw).unwrap();

    assert_eq!(msg.kind, SignalingKind::Answer);
    assert!(msg.is_from("peer-b"));
    assert!(!msg.is_from("peer-a"));
    let desc = msg.description().unwrap();
    assert_eq!(desc.sdp_type, SdpType::Answer);
    assert_eq!(desc.sdp, "v=0");
}

#[test]
fn test_candidate_field_names() {
    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
    };
    let msg = SignalingMessage::candidate("peer-a", &candidate);
    let json = serde_json::to_value(&msg).unwrap();

    assert_eq!(json["type"], "candidate");
    assert_eq!(json["payload"]["sdpMid"], "0");
    assert_eq!(json["payload"]["sdpMLineIndex"], 0);
    assert_eq!(msg.ice_candidate().unwrap(), candidate);
}

#[test]
fn test_candidate_optional_fields() {
    let raw = r#"{"senderId":"peer-b","type":"candidate","payload":{"candidate":"c"}}"#;
    let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
    let candidate = msg.ice_candidate().unwrap();
    assert_eq!(candidate.sdp_mid, None);
    assert_eq!(candidate.sdp_m_line_index, None);

    let json = serde_json::to_string(&candidate).unwrap();
    assert!(!json.contains("sdpMid"));
}

#[test]
fn test_ready_and_disconnect_have_null_payload() {
    let ready = serde_json::to_value(SignalingMessage::ready("peer-a")).unwrap();
    assert_eq!(ready["type"], "ready");
    assert!(ready["payload"].is_null());

    let bye: SignalingMessage =
        serde_json::from_str(r#"{"senderId":"peer-b","type":"disconnect"}"#).unwrap();
    assert_eq!(bye.kind, SignalingKind::Disconnect);
    assert!(bye.payload.is_null());
}

#[test]
fn test_wrong_payload_is_an_error() {
    let raw = r#"{"senderId":"peer-b","type":"offer","payload":{"candidate":"c"}}"#;
    let msg: SignalingMessage = serde_json::from_str(raw).unwrap();
    assert!(msg.description().is_err());

    assert!(serde_json::from_str::<SignalingMessage>(
        r#"{"senderId":"peer-b","type":"hello","payload":null}"#
    )
    .is_err());
}

#[test]
fn test_presence_record() {
    let record: PresenceRecord = serde_json::from_str(r#"{"joinedAt":1700000000000}"#).unwrap();
    assert_eq!(record.joined_at, 1_700_000_000_000);
    assert!(PresenceRecord::now().joined_at > record.joined_at);
}

#[test]
fn test_rollback_description() {
    let rollback = SessionDescription::rollback();
    assert_eq!(rollback.sdp_type, SdpType::Rollback);
    assert!(rollback.sdp.is_empty());
}

#[test]
fn test_display() {
    assert_eq!(Role::Polite.to_string(), "polite");
    assert_eq!(Role::Impolite.to_string(), "impolite");
    assert!(Role::Polite.is_polite());
    assert_eq!(ConnectionState::Connected.to_string(), "connected");
    assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    assert_eq!(SignalingKind::Candidate.to_string(), "candidate");
}

#[test]
fn test_default_config() {
    let config = SessionConfig::default();
    assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    assert_eq!(config.chunk_size, 65536);
    assert_eq!(config.chunk_delay_ms, DEFAULT_CHUNK_DELAY_MS);
    assert_eq!(config.channel_label, DATA_CHANNEL_LABEL);
    assert!(!config.stun_servers.is_empty());
}
