//! Kernel protocol message types.
//!
//! Three logical channels share one websocket:
//! - **shell**: request/reply (execute, inspect, complete, kernel_info)
//! - **iopub**: broadcast status and output
//! - **stdin**: input requests from the kernel and our replies to them

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::bytes::Bytes;

use crate::version::PROTOCOL_VERSION;

pub const KERNEL_INFO_REQUEST: &str = "kernel_info_request";
pub const EXECUTE_REQUEST: &str = "execute_request";
pub const INSPECT_REQUEST: &str = "inspect_request";
pub const COMPLETE_REQUEST: &str = "complete_request";
pub const INPUT_REPLY: &str = "input_reply";
pub const STATUS: &str = "status";

/// Logical sub-channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Iopub => "iopub",
            Self::Stdin => "stdin",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub username: String,
    /// Client session id (static for the lifetime of a client).
    #[serde(default)]
    pub session: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl Header {
    /// Header for a new outgoing message with a fresh id.
    pub fn new(msg_type: impl Into<String>, username: &str, session: &str) -> Self {
        Self {
            msg_id: new_msg_id(),
            username: username.to_string(),
            session: session.to_string(),
            msg_type: msg_type.into(),
            version: PROTOCOL_VERSION.to_string(),
            date: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

/// Fresh request id (uuid v4, hyphenless hex).
pub fn new_msg_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// One protocol message, inbound or outbound.
///
/// `buffers` never appears in the JSON form; the codec carries them in the
/// binary multipart frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub header: Header,
    #[serde(default, with = "parent_header")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(skip)]
    pub buffers: Vec<Bytes>,
    pub channel: Channel,
}

impl ProtocolMessage {
    pub fn new(channel: Channel, header: Header, content: Map<String, Value>) -> Self {
        Self {
            header,
            parent_header: None,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            channel,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Bytes>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_parent(mut self, parent: Header) -> Self {
        self.parent_header = Some(parent);
        self
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Id of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|h| h.msg_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// `content.execution_state` of an iopub status message.
    pub fn execution_state(&self) -> Option<&str> {
        if self.channel != Channel::Iopub || self.msg_type() != STATUS {
            return None;
        }
        self.content.get("execution_state").and_then(Value::as_str)
    }

    pub fn is_idle_status(&self) -> bool {
        self.execution_state() == Some("idle")
    }
}

/// Converts a JSON value that must be an object into content/metadata maps.
///
/// Non-object values are wrapped as `{"value": v}`; `null` becomes `{}`.
pub fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// `parent_header` is `{}` on the wire when a message has no parent.
mod parent_header {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::{Map, Value};

    use super::Header;

    pub fn serialize<S: Serializer>(value: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(header) => header.serialize(serializer),
            None => Map::<String, Value>::new().serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Header>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) if map.is_empty() => Ok(None),
            Some(other) => Header::deserialize(other)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_new_stamps_protocol_version_and_fresh_id() {
        let a = Header::new(EXECUTE_REQUEST, "alice", "sess");
        let b = Header::new(EXECUTE_REQUEST, "alice", "sess");
        assert_eq!(a.version, "5.0");
        assert_eq!(a.msg_id.len(), 32);
        assert_ne!(a.msg_id, b.msg_id);
        assert!(a.date.is_some());
    }

    #[test]
    fn empty_parent_header_serializes_as_empty_object() {
        let msg = ProtocolMessage::new(
            Channel::Shell,
            Header::new(KERNEL_INFO_REQUEST, "", "s"),
            Map::new(),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["parent_header"], json!({}));
        assert_eq!(value["channel"], json!("shell"));
        assert!(value.get("buffers").is_none());
    }

    #[test]
    fn empty_parent_header_deserializes_as_none() {
        let msg: ProtocolMessage = serde_json::from_value(json!({
            "header": {"msg_id": "a", "msg_type": "status"},
            "parent_header": {},
            "metadata": {},
            "content": {"execution_state": "busy"},
            "channel": "iopub"
        }))
        .unwrap();
        assert!(msg.parent_header.is_none());
        assert_eq!(msg.parent_msg_id(), None);
        assert_eq!(msg.execution_state(), Some("busy"));
    }

    #[test]
    fn parent_msg_id_reads_parent_header() {
        let msg: ProtocolMessage = serde_json::from_value(json!({
            "header": {"msg_id": "b", "msg_type": "execute_reply", "session": "k"},
            "parent_header": {"msg_id": "req-1", "msg_type": "execute_request"},
            "content": {"status": "ok"},
            "channel": "shell"
        }))
        .unwrap();
        assert_eq!(msg.parent_msg_id(), Some("req-1"));
        assert!(msg.metadata.is_empty());
        assert_eq!(msg.execution_state(), None);
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let result = serde_json::from_value::<ProtocolMessage>(json!({
            "header": {"msg_id": "c", "msg_type": "status"},
            "channel": "bogus"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn idle_status_requires_iopub_status() {
        let mut content = Map::new();
        content.insert("execution_state".into(), json!("idle"));
        let shell = ProtocolMessage::new(Channel::Shell, Header::new(STATUS, "", ""), content.clone());
        assert!(!shell.is_idle_status());
        let iopub = ProtocolMessage::new(Channel::Iopub, Header::new(STATUS, "", ""), content);
        assert!(iopub.is_idle_status());
    }

    #[test]
    fn into_object_wraps_scalars() {
        assert_eq!(into_object(json!({"a": 1}))["a"], json!(1));
        assert!(into_object(Value::Null).is_empty());
        assert_eq!(into_object(json!("x"))["value"], json!("x"));
    }
}
