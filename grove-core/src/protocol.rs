//! Grove wire protocol: message types shared by leaf and ultrapeer links.
//!
//! Encoding is JSON with a SCREAMING_SNAKE_CASE `type` tag; framing is a
//! 4-byte big-endian length prefix (see the wire module).

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One registered leaf: the registry entry replicated between ultrapeers.
/// `ip` is the source address the registering ultrapeer observed;
/// `registered_at` is unix seconds at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafInfo {
    pub public_key: String,
    pub ip: IpAddr,
    pub p2p_port: u16,
    pub registered_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Found,
    NotFound,
}

/// All wire message types, for leaf↔ultrapeer, ultrapeer↔ultrapeer, and
/// leaf↔leaf sessions alike.
///
/// REGISTER_LEAF fields are deliberately lenient: a message with missing or
/// mistyped fields must still decode so the ultrapeer can answer with an
/// explicit failure ack instead of dropping the connection silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    RegisterLeaf {
        #[serde(default)]
        public_key: Option<String>,
        #[serde(default)]
        p2p_port: Option<Value>,
    },
    RegisterAck {
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    QueryLeaf {
        target_public_key: String,
    },
    QueryLeafResponse {
        status: QueryStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_info: Option<LeafInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SyncFullRegistry {
        registry: HashMap<String, LeafInfo>,
    },
    SyncLeafJoined {
        leaf_info: LeafInfo,
    },
    SyncLeafLeft {
        public_key: String,
    },
    /// Peer-session liveness echo.
    Ping {
        #[serde(default)]
        data: Option<String>,
    },
    Pong {
        #[serde(default)]
        data: Option<String>,
    },
    /// Any `type` tag this node does not understand. Logged and ignored;
    /// never closes the connection.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RegisterLeaf { .. } => "REGISTER_LEAF",
            Message::RegisterAck { .. } => "REGISTER_ACK",
            Message::QueryLeaf { .. } => "QUERY_LEAF",
            Message::QueryLeafResponse { .. } => "QUERY_LEAF_RESPONSE",
            Message::SyncFullRegistry { .. } => "SYNC_FULL_REGISTRY",
            Message::SyncLeafJoined { .. } => "SYNC_LEAF_JOINED",
            Message::SyncLeafLeft { .. } => "SYNC_LEAF_LEFT",
            Message::Ping { .. } => "PING",
            Message::Pong { .. } => "PONG",
            Message::Unknown => "UNKNOWN",
        }
    }
}

/// Extract a usable port from the raw JSON value of a REGISTER_LEAF message.
/// Only non-negative integers that fit a u16 qualify; anything else is a
/// registration error, answered with a failure ack.
pub fn parse_p2p_port(value: &Value) -> Option<u16> {
    value.as_u64().and_then(|p| u16::try_from(p).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_are_screaming_snake_case() {
        let msg = Message::QueryLeaf {
            target_public_key: "K".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "QUERY_LEAF");
        assert_eq!(json["target_public_key"], "K");
    }

    #[test]
    fn ack_status_on_wire() {
        let msg = Message::RegisterAck {
            status: AckStatus::Failure,
            reason: Some("bad".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "failure");
        let back: Message = serde_json::from_value(json).unwrap();
        assert!(matches!(
            back,
            Message::RegisterAck {
                status: AckStatus::Failure,
                ..
            }
        ));
    }

    #[test]
    fn query_status_not_found_on_wire() {
        let msg = Message::QueryLeafResponse {
            status: QueryStatus::NotFound,
            peer_info: None,
            reason: Some("peer not in registry".into()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "not_found");
        assert!(json.get("peer_info").is_none());
    }

    #[test]
    fn register_leaf_decodes_with_missing_fields() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"REGISTER_LEAF","public_key":"K"}"#).unwrap();
        match msg {
            Message::RegisterLeaf {
                public_key,
                p2p_port,
            } => {
                assert_eq!(public_key.as_deref(), Some("K"));
                assert!(p2p_port.is_none());
            }
            other => panic!("expected REGISTER_LEAF, got {}", other.kind()),
        }
    }

    #[test]
    fn parse_p2p_port_rejects_non_integers() {
        assert_eq!(parse_p2p_port(&Value::from(6001u16)), Some(6001));
        assert_eq!(parse_p2p_port(&Value::from("6001")), None);
        assert_eq!(parse_p2p_port(&Value::from(-1)), None);
        assert_eq!(parse_p2p_port(&Value::from(70000)), None);
        assert_eq!(parse_p2p_port(&Value::from(6001.5)), None);
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let msg: Message =
            serde_json::from_str(r#"{"type":"FROB_NICATE","x":1}"#).unwrap();
        assert!(matches!(msg, Message::Unknown));
    }

    #[test]
    fn leaf_info_round_trip() {
        let info = LeafInfo {
            public_key: "K1".into(),
            ip: "127.0.0.1".parse().unwrap(),
            p2p_port: 6001,
            registered_at: 1_700_000_000,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: LeafInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
