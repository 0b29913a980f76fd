use crate::{AccessControlRule, NodeCommand, NodeStatus, Notification};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cap on frames a hub accepts from its peers.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Cap on frames a probe accepts from the hub. Rule pushes grow with the rule set,
/// so this matches the transport's own message limit.
pub const MAX_PUSH_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Path of the hub's WebSocket endpoint.
pub const WS_PATH: &str = "/api/v1/ws";

/// One message on a hub connection: `{"type": <TAG>, "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Envelope {
    NodeReport(NodeStatus),
    SyncComplete(NodeStatus),
    Command(NodeCommand),
    SyncRules(Vec<AccessControlRule>),
    NodeUpdate(NodeStatus),
    NodeSyncComplete(NodeStatus),
    NewMessage(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    NodeReport,
    SyncComplete,
    Command,
    SyncRules,
    NodeUpdate,
    NodeSyncComplete,
    NewMessage,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::NodeReport => "NODE_REPORT",
            EnvelopeKind::SyncComplete => "SYNC_COMPLETE",
            EnvelopeKind::Command => "COMMAND",
            EnvelopeKind::SyncRules => "SYNC_RULES",
            EnvelopeKind::NodeUpdate => "NODE_UPDATE",
            EnvelopeKind::NodeSyncComplete => "NODE_SYNC_COMPLETE",
            EnvelopeKind::NewMessage => "NEW_MESSAGE",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "NODE_REPORT" => Ok(EnvelopeKind::NodeReport),
            "SYNC_COMPLETE" => Ok(EnvelopeKind::SyncComplete),
            "COMMAND" => Ok(EnvelopeKind::Command),
            "SYNC_RULES" => Ok(EnvelopeKind::SyncRules),
            "NODE_UPDATE" => Ok(EnvelopeKind::NodeUpdate),
            "NODE_SYNC_COMPLETE" => Ok(EnvelopeKind::NodeSyncComplete),
            "NEW_MESSAGE" => Ok(EnvelopeKind::NewMessage),
            other => Err(other.to_string()),
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::NodeReport(_) => EnvelopeKind::NodeReport,
            Envelope::SyncComplete(_) => EnvelopeKind::SyncComplete,
            Envelope::Command(_) => EnvelopeKind::Command,
            Envelope::SyncRules(_) => EnvelopeKind::SyncRules,
            Envelope::NodeUpdate(_) => EnvelopeKind::NodeUpdate,
            Envelope::NodeSyncComplete(_) => EnvelopeKind::NodeSyncComplete,
            Envelope::NewMessage(_) => EnvelopeKind::NewMessage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("unknown envelope type: {0}")]
    UnknownTag(String),
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Outbound frames are never capped; limits apply on the receiving side.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, FrameError> {
    serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))
}

/// Reads the tag first and only then decodes the payload for that tag.
pub fn decode_envelope(bytes: &[u8], max_frame_bytes: usize) -> Result<Envelope, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let raw: RawEnvelope =
        serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))?;
    let kind = raw.kind.parse::<EnvelopeKind>().map_err(FrameError::UnknownTag)?;
    let data = raw.data;
    let envelope = match kind {
        EnvelopeKind::NodeReport => Envelope::NodeReport(payload(data)?),
        EnvelopeKind::SyncComplete => Envelope::SyncComplete(payload(data)?),
        EnvelopeKind::Command => Envelope::Command(payload(data)?),
        EnvelopeKind::SyncRules => Envelope::SyncRules(payload(data)?),
        EnvelopeKind::NodeUpdate => Envelope::NodeUpdate(payload(data)?),
        EnvelopeKind::NodeSyncComplete => Envelope::NodeSyncComplete(payload(data)?),
        EnvelopeKind::NewMessage => Envelope::NewMessage(payload(data)?),
    };
    Ok(envelope)
}

fn payload<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeLiveness, RuleKind, RuleStatus};

    fn report() -> Envelope {
        Envelope::NodeReport(NodeStatus {
            id: "probe-windows-01".to_string(),
            name: "Windows-Probe".to_string(),
            status: NodeLiveness::Online,
            load: 10,
            load_history: vec![8, 10],
            ..NodeStatus::default()
        })
    }

    #[test]
    fn envelope_uses_type_and_data_keys() {
        let text = encode_envelope(&Envelope::Command(NodeCommand::Stop))
            .expect("encode");
        assert_eq!(text, r#"{"type":"COMMAND","data":"STOP"}"#);

        let value: Value = serde_json::from_str(
            &encode_envelope(&report()).expect("encode report"),
        )
        .expect("json");
        assert_eq!(value["type"], "NODE_REPORT");
        assert_eq!(value["data"]["id"], "probe-windows-01");
    }

    #[test]
    fn decode_dispatches_on_tag() {
        let rules = Envelope::SyncRules(vec![AccessControlRule {
            id: "AC-002".to_string(),
            ip: "10.0.0.0/24".to_string(),
            kind: RuleKind::Whitelist,
            reason: "Internal management network".to_string(),
            source: "SYSTEM".to_string(),
            expire_time: String::new(),
            add_time: "2025/12/01 08:00:00".to_string(),
            status: RuleStatus::Active,
        }]);
        for envelope in [report(), rules, Envelope::Command(NodeCommand::EnableFirewall)] {
            let text = encode_envelope(&envelope).expect("encode");
            let decoded =
                decode_envelope(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(decoded.kind(), envelope.kind());
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn unknown_tag_is_distinguished_from_malformed_payload() {
        let unknown = decode_envelope(
            br#"{"type":"ATTACK_EVENT","data":{"id":"x"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert_eq!(unknown, Err(FrameError::UnknownTag("ATTACK_EVENT".to_string())));

        let malformed = decode_envelope(
            br#"{"type":"NODE_REPORT","data":{"load":"high"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert!(matches!(malformed, Err(FrameError::Decode(_))));

        let not_json = decode_envelope(b"{\"type\":", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(not_json, Err(FrameError::Decode(_))));
    }

    #[test]
    fn unknown_command_value_is_a_decode_error() {
        let result = decode_envelope(
            br#"{"type":"COMMAND","data":"SELF_DESTRUCT"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn large_rule_push_encodes_and_fits_the_push_limit() {
        let rules: Vec<AccessControlRule> = (0..2_000)
            .map(|i| AccessControlRule {
                id: format!("AC-{i:012}"),
                ip: format!("10.{}.{}.1", i / 256, i % 256),
                kind: RuleKind::Blacklist,
                reason: "Repeated SSH brute force from scanner pool".to_string(),
                source: "PRTS".to_string(),
                expire_time: "2099-01-01 00:00:00".to_string(),
                add_time: "2025/12/01 08:00:00".to_string(),
                status: RuleStatus::Active,
            })
            .collect();
        let text = encode_envelope(&Envelope::SyncRules(rules)).expect("encode");
        assert!(text.len() > DEFAULT_MAX_FRAME_BYTES);

        assert!(matches!(
            decode_envelope(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::OversizedFrame { .. })
        ));
        match decode_envelope(text.as_bytes(), MAX_PUSH_FRAME_BYTES).expect("decode push") {
            Envelope::SyncRules(rules) => assert_eq!(rules.len(), 2_000),
            other => panic!("expected SYNC_RULES, got {other:?}"),
        }
    }
}
