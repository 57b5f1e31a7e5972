//! # Socket.IO Wire Codec
//!
//! Just enough of Engine.IO v4 and Socket.IO v5 to hold a client session over
//! a plain WebSocket: the open handshake, heartbeats, namespace connect and
//! disconnect, and event packets. Every text frame carries one packet:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   engine.io open
//! 2 / 3                                                    ping / pong
//! 40/shop1,{"apikey":".."}                                 namespace connect
//! 42/shop1,["messages.upsert",{..}]                        event
//! 42/shop1,17["messages.upsert",{..}]                      event with ack id
//! 44/shop1,{"message":"Not authorized"}                    connect error
//! ```
//!
//! The root namespace `/` is never written out. Binary packets are recognized
//! but not decoded.
//!
//! Event normalization also lives here: the upstream is not consistent about
//! wrapping, so one level of array nesting and one `data` field are peeled off
//! before the payload reaches the router.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::source::InboundEvent;

/// Event names reserved by the transport. They are never relayed.
pub const CONTROL_EVENTS: [&str; 6] = [
    "connect",
    "disconnect",
    "connect_error",
    "reconnect",
    "reconnect_attempt",
    "error",
];

/// Malformed framing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Zero-length frame.
    #[error("empty packet")]
    Empty,

    /// Leading type digit is not one the protocol defines.
    #[error("unknown packet type '{0}'")]
    UnknownType(char),

    /// The JSON part does not parse.
    #[error("invalid JSON in packet: {0}")]
    InvalidJson(String),

    /// The open packet lacks its handshake fields.
    #[error("invalid open packet: {0}")]
    InvalidOpen(String),

    /// An event packet without a `[name, ...]` array.
    #[error("invalid event packet: {0}")]
    InvalidEvent(String),
}

/// An event payload that cannot be turned into an [`InboundEvent`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// The event carries no argument at all.
    #[error("event '{0}' has no payload")]
    MissingPayload(String),

    /// The first argument is an empty array.
    #[error("event '{0}' has an empty payload array")]
    EmptyArray(String),

    /// The unwrapped payload is `null`.
    #[error("event '{0}' has a null payload")]
    NullPayload(String),
}

/// Session parameters from the Engine.IO open packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInfo {
    /// Engine.IO session id.
    pub sid: String,
    /// Server ping period.
    pub ping_interval: Duration,
    /// Grace period after a missed ping.
    pub ping_timeout: Duration,
}

impl OpenInfo {
    /// Silence longer than this means the session is dead.
    pub fn liveness_window(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO open handshake.
    Open(OpenInfo),
    /// Engine.IO close.
    Close,
    /// Server heartbeat; must be answered with a pong.
    Ping,
    /// Heartbeat answer.
    Pong,
    /// Engine.IO upgrade or noop. Irrelevant on a pure WebSocket session.
    Noop,
    /// Namespace connect; from the server it carries the namespace `sid`.
    Connect {
        /// Namespace, `/` for the root.
        namespace: String,
        /// Handshake object.
        data: Option<Value>,
    },
    /// Namespace disconnect.
    Disconnect {
        /// Namespace, `/` for the root.
        namespace: String,
    },
    /// Application event.
    Event {
        /// Namespace, `/` for the root.
        namespace: String,
        /// Acknowledgement id requested by the sender, if any.
        ack_id: Option<u64>,
        /// Event name.
        name: String,
        /// Event arguments after the name.
        args: Vec<Value>,
    },
    /// Acknowledgement of a client emit.
    Ack {
        /// Namespace, `/` for the root.
        namespace: String,
    },
    /// The namespace handshake was refused.
    ConnectError {
        /// Namespace, `/` for the root.
        namespace: String,
        /// Reason given by the server.
        message: String,
    },
    /// Binary event or ack; the attachments follow as separate frames.
    Binary {
        /// Namespace, `/` for the root.
        namespace: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPayload {
    sid: String,
    ping_interval: u64,
    ping_timeout: u64,
}

/// Decodes one text frame.
pub fn decode(text: &str) -> Result<Packet, ProtocolError> {
    let mut chars = text.chars();
    let engine_type = chars.next().ok_or(ProtocolError::Empty)?;
    let rest = chars.as_str();

    match engine_type {
        '0' => {
            let open: OpenPayload =
                serde_json::from_str(rest).map_err(|e| ProtocolError::InvalidOpen(e.to_string()))?;
            Ok(Packet::Open(OpenInfo {
                sid: open.sid,
                ping_interval: Duration::from_millis(open.ping_interval),
                ping_timeout: Duration::from_millis(open.ping_timeout),
            }))
        }
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_message(rest),
        '5' | '6' => Ok(Packet::Noop),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn decode_message(text: &str) -> Result<Packet, ProtocolError> {
    let mut chars = text.chars();
    let packet_type = chars.next().ok_or(ProtocolError::Empty)?;
    let mut rest = chars.as_str();

    // Binary packets put an attachment count before the namespace.
    if matches!(packet_type, '5' | '6') {
        if let Some(dash) = rest.find('-') {
            rest = &rest[dash + 1..];
        }
    }

    let namespace = if rest.starts_with('/') {
        match rest.find(',') {
            Some(comma) => {
                let namespace = &rest[..comma];
                rest = &rest[comma + 1..];
                namespace
            }
            None => std::mem::take(&mut rest),
        }
    } else {
        "/"
    }
    .to_string();

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let ack_id = match digits {
        0 => None,
        n => rest[..n].parse::<u64>().ok(),
    };
    rest = &rest[digits..];

    let payload = if rest.is_empty() {
        None
    } else {
        Some(serde_json::from_str::<Value>(rest).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?)
    };

    match packet_type {
        '0' => Ok(Packet::Connect {
            namespace,
            data: payload,
        }),
        '1' => Ok(Packet::Disconnect { namespace }),
        '2' => {
            let Some(Value::Array(items)) = payload else {
                return Err(ProtocolError::InvalidEvent("payload is not an array".to_string()));
            };
            let mut items = items.into_iter();
            let Some(Value::String(name)) = items.next() else {
                return Err(ProtocolError::InvalidEvent("missing event name".to_string()));
            };
            Ok(Packet::Event {
                namespace,
                ack_id,
                name,
                args: items.collect(),
            })
        }
        '3' => Ok(Packet::Ack { namespace }),
        '4' => {
            let message = match payload {
                Some(Value::Object(map)) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused")
                    .to_string(),
                Some(Value::String(s)) => s,
                _ => "connection refused".to_string(),
            };
            Ok(Packet::ConnectError { namespace, message })
        }
        '5' | '6' => Ok(Packet::Binary { namespace }),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn with_namespace(prefix: &str, namespace: &str) -> String {
    if namespace == "/" {
        prefix.to_string()
    } else {
        format!("{}{},", prefix, namespace)
    }
}

/// Namespace connect carrying the auth object.
pub fn encode_connect(namespace: &str, auth: &Value) -> String {
    format!("{}{}", with_namespace("40", namespace), auth)
}

/// Namespace disconnect.
pub fn encode_disconnect(namespace: &str) -> String {
    with_namespace("41", namespace)
}

/// Event packet. Only servers and tests emit these.
pub fn encode_event(namespace: &str, name: &str, args: &[Value]) -> String {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(name.to_string()));
    items.extend(args.iter().cloned());
    format!("{}{}", with_namespace("42", namespace), Value::Array(items))
}

/// Heartbeat answer.
pub fn encode_pong() -> String {
    "3".to_string()
}

/// `true` for names the transport reserves for itself.
pub fn is_control_event(name: &str) -> bool {
    CONTROL_EVENTS.contains(&name)
}

/// JavaScript truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// # Normalize
///
/// Turns the arguments of an event packet into an [`InboundEvent`]:
///
/// 1. the first argument is the payload;
/// 2. if the payload is an array, its first element is taken instead;
/// 3. if that is an object with a truthy `data` field, the field is taken.
///
/// Any other shape is passed through untouched. The event is attributed to
/// `source` and stamped with the current time.
pub fn normalize(source: &str, name: &str, args: Vec<Value>) -> Result<InboundEvent, NormalizeError> {
    let payload = args
        .into_iter()
        .next()
        .ok_or_else(|| NormalizeError::MissingPayload(name.to_string()))?;

    let mut event_data = match payload {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| NormalizeError::EmptyArray(name.to_string()))?,
        other => other,
    };

    if event_data.is_null() {
        return Err(NormalizeError::NullPayload(name.to_string()));
    }

    if let Value::Object(map) = &mut event_data {
        if map.get("data").is_some_and(is_truthy) {
            if let Some(data) = map.remove("data") {
                event_data = data;
            }
        }
    }

    Ok(InboundEvent::new(source, name, event_data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let packet = decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#)
            .unwrap();
        let Packet::Open(info) = packet else {
            panic!("expected open, got {:?}", packet);
        };
        assert_eq!(info.sid, "abc");
        assert_eq!(info.liveness_window(), Duration::from_secs(45));
    }

    #[test]
    fn test_decode_heartbeat_and_close() {
        assert_eq!(decode("2").unwrap(), Packet::Ping);
        assert_eq!(decode("3").unwrap(), Packet::Pong);
        assert_eq!(decode("1").unwrap(), Packet::Close);
        assert_eq!(decode("6").unwrap(), Packet::Noop);
    }

    #[test]
    fn test_decode_namespace_connect() {
        assert_eq!(
            decode(r#"40/shop1,{"sid":"ns-1"}"#).unwrap(),
            Packet::Connect {
                namespace: "/shop1".to_string(),
                data: Some(json!({"sid": "ns-1"})),
            }
        );
        assert_eq!(
            decode(r#"40{"sid":"root"}"#).unwrap(),
            Packet::Connect {
                namespace: "/".to_string(),
                data: Some(json!({"sid": "root"})),
            }
        );
    }

    #[test]
    fn test_decode_event_with_and_without_ack() {
        assert_eq!(
            decode(r#"42/shop1,["messages.upsert",{"id":1},"extra"]"#).unwrap(),
            Packet::Event {
                namespace: "/shop1".to_string(),
                ack_id: None,
                name: "messages.upsert".to_string(),
                args: vec![json!({"id": 1}), json!("extra")],
            }
        );
        assert_eq!(
            decode(r#"4217["connection.update",{}]"#).unwrap(),
            Packet::Event {
                namespace: "/".to_string(),
                ack_id: Some(17),
                name: "connection.update".to_string(),
                args: vec![json!({})],
            }
        );
    }

    #[test]
    fn test_decode_disconnect_and_connect_error() {
        assert_eq!(
            decode("41/shop1,").unwrap(),
            Packet::Disconnect { namespace: "/shop1".to_string() }
        );
        assert_eq!(
            decode(r#"44/shop1,{"message":"Not authorized"}"#).unwrap(),
            Packet::ConnectError {
                namespace: "/shop1".to_string(),
                message: "Not authorized".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_binary_is_recognized() {
        assert_eq!(
            decode(r#"451-/shop1,["file",{"_placeholder":true,"num":0}]"#).unwrap(),
            Packet::Binary { namespace: "/shop1".to_string() }
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(""), Err(ProtocolError::Empty));
        assert_eq!(decode("9"), Err(ProtocolError::UnknownType('9')));
        assert!(matches!(decode("0{broken"), Err(ProtocolError::InvalidOpen(_))));
        assert!(matches!(decode("42/shop1,[oops"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(decode(r#"42/shop1,{"a":1}"#), Err(ProtocolError::InvalidEvent(_))));
        assert!(matches!(decode("42/shop1,[1,2]"), Err(ProtocolError::InvalidEvent(_))));
    }

    #[test]
    fn test_encoders() {
        assert_eq!(encode_connect("/shop1", &json!({"apikey": "k"})), r#"40/shop1,{"apikey":"k"}"#);
        assert_eq!(encode_connect("/", &json!({"apikey": "k"})), r#"40{"apikey":"k"}"#);
        assert_eq!(encode_disconnect("/shop1"), "41/shop1,");
        assert_eq!(encode_disconnect("/"), "41");
        assert_eq!(encode_pong(), "3");
        assert_eq!(
            encode_event("/shop1", "messages.upsert", &[json!({"id": 1})]),
            r#"42/shop1,["messages.upsert",{"id":1}]"#
        );
    }

    #[test]
    fn test_control_events() {
        assert!(is_control_event("connect_error"));
        assert!(is_control_event("reconnect_attempt"));
        assert!(!is_control_event("messages.upsert"));
    }

    #[test]
    fn test_normalize_unwraps_array_and_data() {
        let event = normalize(
            "shop1",
            "messages.upsert",
            vec![json!([{"data": {"key": "v"}, "instance": "shop1"}, {"ignored": true}])],
        )
        .unwrap();
        assert_eq!(event.source, "shop1");
        assert_eq!(event.event_type, "messages.upsert");
        assert_eq!(event.payload, json!({"key": "v"}));
        assert!(event.received_at <= chrono::Utc::now());
    }

    #[test]
    fn test_normalize_keeps_object_without_truthy_data() {
        let plain = normalize("shop1", "connection.update", vec![json!({"state": "open"})]).unwrap();
        assert_eq!(plain.payload, json!({"state": "open"}));

        // A falsy `data` is not unwrapped.
        let falsy = normalize("shop1", "x", vec![json!({"data": 0, "other": 1})]).unwrap();
        assert_eq!(falsy.payload, json!({"data": 0, "other": 1}));

        let scalar = normalize("shop1", "x", vec![json!("text")]).unwrap();
        assert_eq!(scalar.payload, json!("text"));
    }

    #[test]
    fn test_normalize_rejects_unusable_shapes() {
        assert_eq!(normalize("shop1", "x", vec![]), Err(NormalizeError::MissingPayload("x".to_string())));
        assert_eq!(normalize("shop1", "x", vec![json!([])]), Err(NormalizeError::EmptyArray("x".to_string())));
        assert_eq!(normalize("shop1", "x", vec![json!(null)]), Err(NormalizeError::NullPayload("x".to_string())));
        assert_eq!(normalize("shop1", "x", vec![json!([null])]), Err(NormalizeError::NullPayload("x".to_string())));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
        assert!(is_truthy(&json!(-1.5)));
    }
}
