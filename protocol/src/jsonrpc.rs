//! JSON-RPC-lite framing used on the relay socket.
//!
//! One JSON object per line. Requests carry an `id`; notifications do not.
//! There is no `"jsonrpc": "2.0"` member.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (error.code)
// ─────────────────────────────────────────────────────────────────────────────

pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Envelope failed validation at the relay boundary.
pub const ERR_MALFORMED_ENVELOPE: i64 = 20;
/// No eligible target surface for a command.
pub const ERR_NO_SURFACE: i64 = 30;
/// A command hit its deadline.
pub const ERR_COMMAND_TIMEOUT: i64 = 31;
/// A command could not be dispatched to the bridge.
pub const ERR_TRANSPORT: i64 = 32;
pub const ERR_INFRA: i64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub id: RequestId,
    pub error: RpcErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Anything a client may read from the socket.
///
/// Variant order matters for untagged matching: a request has both `id` and
/// `method`, a notification only `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Notification(RpcNotification),
    Response(RpcResponse),
    Error(RpcError),
}

impl RpcError {
    pub fn new(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            error: RpcErrorBody {
                code,
                message: message.into(),
                data: None,
            },
        }
    }
}

/// Serialize a message as one newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(message).unwrap_or_else(|_| b"{}".to_vec());
    bytes.push(b'\n');
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn untagged_message_discrimination() {
        let req: RpcMessage =
            serde_json::from_value(json!({"id": 1, "method": "hello"})).unwrap();
        assert!(matches!(req, RpcMessage::Request(_)));

        let note: RpcMessage =
            serde_json::from_value(json!({"method": "bridge.command", "params": {}})).unwrap();
        assert!(matches!(note, RpcMessage::Notification(_)));

        let resp: RpcMessage =
            serde_json::from_value(json!({"id": "a", "result": null})).unwrap();
        assert!(matches!(resp, RpcMessage::Response(_)));

        let err: RpcMessage = serde_json::from_value(
            json!({"id": 2, "error": {"code": -32601, "message": "nope"}}),
        )
        .unwrap();
        assert!(matches!(err, RpcMessage::Error(_)));
    }

    #[test]
    fn encode_line_terminates_with_newline() {
        let bytes = encode_line(&RpcNotification {
            method: "x".to_string(),
            params: None,
        });
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(&bytes[..bytes.len() - 1], br#"{"method":"x"}"#);
    }
}
