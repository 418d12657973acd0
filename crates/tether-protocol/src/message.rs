// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bridge wire messages.
//!
//! Every message is a JSON object discriminated by its `action` field.
//! Decoding goes through [`BridgeMessage::from_slice`], which turns unknown
//! actions into [`CodecError::UnrecognizedMessage`] instead of a generic
//! deserialization failure.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::CodecError;

/// Relay-assigned identifier of one transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Application close codes carried on transport shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CloseCode {
    Normal = 0,
    /// Another client registered; the receiver must not reconnect.
    Superseded = 4901,
    ProtocolError = 4902,
}

impl CloseCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Map a raw code back, treating anything unknown as a protocol error.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => CloseCode::Normal,
            4901 => CloseCode::Superseded,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Why the relay could not hand a response back to the stub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryFailure {
    StubDisconnected,
    Unknown,
}

/// Request or response body plus routing data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub debug_request_id: String,
    /// Connection that should receive the answer to this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Blob store key holding the payload when it was too large to inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_pointer: Option<String>,
}

/// Borrowed view of an envelope body
#[derive(Debug, PartialEq)]
pub enum Body<'a> {
    Inline(&'a Value),
    Pointer(&'a str),
}

impl Envelope {
    pub fn inline(debug_request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            debug_request_id: debug_request_id.into(),
            reply_to: None,
            payload: Some(payload),
            payload_pointer: None,
        }
    }

    pub fn pointer(debug_request_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            debug_request_id: debug_request_id.into(),
            reply_to: None,
            payload: None,
            payload_pointer: Some(key.into()),
        }
    }

    pub fn with_reply_to(mut self, connection: ConnectionId) -> Self {
        self.reply_to = Some(connection);
        self
    }

    /// The body, requiring exactly one of `payload`/`payloadPointer`.
    pub fn body(&self) -> Result<Body<'_>, CodecError> {
        match (&self.payload, &self.payload_pointer) {
            (Some(value), None) => Ok(Body::Inline(value)),
            (None, Some(key)) => Ok(Body::Pointer(key)),
            _ => Err(CodecError::InvalidEnvelope(self.debug_request_id.clone())),
        }
    }
}

/// All messages exchanged between stubs, the relay and the local client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum BridgeMessage {
    /// Local client announces itself
    Register,
    Registered {
        client_id: String,
    },
    /// Sent to a client that lost its registration to a newer one
    DisconnectedSuperseded,
    InvocationRequest(Envelope),
    InvocationResponse(Envelope),
    /// Sent to a stub whose request found no registered client
    NoClientConnected {
        debug_request_id: String,
    },
    /// Sent to the client when its response could not reach the stub
    DeliveryFailed {
        debug_request_id: String,
        reason: DeliveryFailure,
    },
    Keepalive,
}

impl BridgeMessage {
    /// Every `action` value this protocol understands
    pub const ACTIONS: [&'static str; 8] = [
        "register",
        "registered",
        "disconnected-superseded",
        "invocation-request",
        "invocation-response",
        "no-client-connected",
        "delivery-failed",
        "keepalive",
    ];

    pub fn action(&self) -> &'static str {
        match self {
            BridgeMessage::Register => "register",
            BridgeMessage::Registered { .. } => "registered",
            BridgeMessage::DisconnectedSuperseded => "disconnected-superseded",
            BridgeMessage::InvocationRequest(_) => "invocation-request",
            BridgeMessage::InvocationResponse(_) => "invocation-response",
            BridgeMessage::NoClientConnected { .. } => "no-client-connected",
            BridgeMessage::DeliveryFailed { .. } => "delivery-failed",
            BridgeMessage::Keepalive => "keepalive",
        }
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            BridgeMessage::InvocationRequest(envelope)
            | BridgeMessage::InvocationResponse(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn envelope_mut(&mut self) -> Option<&mut Envelope> {
        match self {
            BridgeMessage::InvocationRequest(envelope)
            | BridgeMessage::InvocationResponse(envelope) => Some(envelope),
            _ => None,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a complete serialized message.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(CodecError::MissingAction)?;
        if !Self::ACTIONS.contains(&action) {
            return Err(CodecError::UnrecognizedMessage(action.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Caller metadata forwarded with each invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub aws_request_id: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub function_version: String,
    #[serde(default)]
    pub invoked_function_arn: String,
    #[serde(default)]
    pub memory_limit_in_mb: String,
    #[serde(default)]
    pub log_group_name: String,
    #[serde(default)]
    pub log_stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_context: Option<Value>,
}

/// Body of an `invocation-request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPayload {
    pub function_id: String,
    pub event: Value,
    pub context: InvocationContext,
    /// Remaining execution budget when the stub sent the request
    pub deadline_ms: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A handler failure as serialized by the worker runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl RemoteError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Vec::new(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)?;
        for frame in &self.stack_trace {
            write!(f, "\n    {}", frame.trim())?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// Body of an `invocation-response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InvocationResult {
    Success { body: Value },
    Failure { error: RemoteError },
}

impl InvocationResult {
    pub fn failure(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        InvocationResult::Failure {
            error: RemoteError::new(error_type, error_message),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InvocationResult::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_actions_serialize_to_bare_tag() {
        assert_eq!(
            serde_json::to_value(BridgeMessage::Register).unwrap(),
            json!({"action": "register"})
        );
        assert_eq!(
            serde_json::to_value(BridgeMessage::DisconnectedSuperseded).unwrap(),
            json!({"action": "disconnected-superseded"})
        );
        assert_eq!(
            serde_json::to_value(BridgeMessage::Keepalive).unwrap(),
            json!({"action": "keepalive"})
        );
    }

    #[test]
    fn test_registered_uses_camel_case_field() {
        let message = BridgeMessage::Registered {
            client_id: "c-1".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"action": "registered", "clientId": "c-1"})
        );
    }

    #[test]
    fn test_invocation_request_shape() {
        let message = BridgeMessage::InvocationRequest(
            Envelope::inline("abc-123-99", json!({"a": 1})).with_reply_to(ConnectionId(4)),
        );
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "action": "invocation-request",
                "debugRequestId": "abc-123-99",
                "replyTo": 4,
                "payload": {"a": 1}
            })
        );
    }

    #[test]
    fn test_pointer_response_shape() {
        let message = BridgeMessage::InvocationResponse(Envelope::pointer(
            "abc",
            "payloads/abc-response",
        ));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["payloadPointer"], "payloads/abc-response");
        assert!(value.get("payload").is_none());
        assert!(value.get("replyTo").is_none());
    }

    #[test]
    fn test_delivery_failed_reason() {
        let message = BridgeMessage::DeliveryFailed {
            debug_request_id: "x".into(),
            reason: DeliveryFailure::StubDisconnected,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"action": "delivery-failed", "debugRequestId": "x", "reason": "stub-disconnected"})
        );
    }

    #[test]
    fn test_from_slice_parses_known_action() {
        let message = BridgeMessage::from_slice(br#"{"action":"no-client-connected","debugRequestId":"r"}"#)
            .unwrap();
        assert_eq!(
            message,
            BridgeMessage::NoClientConnected {
                debug_request_id: "r".into()
            }
        );
    }

    #[test]
    fn test_from_slice_unrecognized_action() {
        let result = BridgeMessage::from_slice(br#"{"action":"teleport"}"#);
        assert!(matches!(result, Err(CodecError::UnrecognizedMessage(a)) if a == "teleport"));
    }

    #[test]
    fn test_from_slice_missing_action() {
        let result = BridgeMessage::from_slice(br#"{"clientId":"x"}"#);
        assert!(matches!(result, Err(CodecError::MissingAction)));
    }

    #[test]
    fn test_actions_table_matches_variants() {
        let samples = [
            BridgeMessage::Register,
            BridgeMessage::Registered { client_id: "c".into() },
            BridgeMessage::DisconnectedSuperseded,
            BridgeMessage::InvocationRequest(Envelope::inline("r", json!(null))),
            BridgeMessage::InvocationResponse(Envelope::inline("r", json!(null))),
            BridgeMessage::NoClientConnected { debug_request_id: "r".into() },
            BridgeMessage::DeliveryFailed {
                debug_request_id: "r".into(),
                reason: DeliveryFailure::Unknown,
            },
            BridgeMessage::Keepalive,
        ];
        for (sample, action) in samples.iter().zip(BridgeMessage::ACTIONS) {
            assert_eq!(sample.action(), action);
            let value = serde_json::to_value(sample).unwrap();
            assert_eq!(value["action"], action);
        }
    }

    #[test]
    fn test_envelope_body_requires_exactly_one() {
        let mut envelope = Envelope::inline("r", json!({}));
        assert!(matches!(envelope.body(), Ok(Body::Inline(_))));
        envelope.payload_pointer = Some("k".into());
        assert!(matches!(envelope.body(), Err(CodecError::InvalidEnvelope(_))));
        envelope.payload = None;
        assert_eq!(envelope.body().unwrap(), Body::Pointer("k"));
    }

    #[test]
    fn test_invocation_result_tagging() {
        let success = InvocationResult::Success {
            body: json!({"status": "ok"}),
        };
        assert_eq!(
            serde_json::to_value(&success).unwrap(),
            json!({"type": "success", "body": {"status": "ok"}})
        );

        let failure: InvocationResult = serde_json::from_value(json!({
            "type": "failure",
            "error": {"errorType": "TypeError", "errorMessage": "boom", "stackTrace": ["at a", "at b"]}
        }))
        .unwrap();
        assert!(!failure.is_success());
    }

    #[test]
    fn test_remote_error_display_includes_stack() {
        let error = RemoteError {
            error_type: "TypeError".into(),
            error_message: "x is undefined".into(),
            stack_trace: vec!["  at handler (index.js:3:9)".into()],
        };
        assert_eq!(
            error.to_string(),
            "TypeError: x is undefined\n    at handler (index.js:3:9)"
        );
    }

    #[test]
    fn test_close_code_mapping() {
        assert_eq!(CloseCode::Superseded.as_u32(), 4901);
        assert_eq!(CloseCode::from_u32(4901), CloseCode::Superseded);
        assert_eq!(CloseCode::from_u32(0), CloseCode::Normal);
        assert_eq!(CloseCode::from_u32(17), CloseCode::ProtocolError);
    }
}
