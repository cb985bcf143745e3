//! Shared frame model and codecs for the realtime event stream.
//!
//! Every message on the sync connection is a [`Frame`]: inbound entity-change
//! events, notifications, request/response pairs for mutations, and the
//! `join:channel` / `leave:channel` control messages. Payloads stay flexible
//! (`serde_json::Value`) while the binary form is protobuf for compact
//! transport. Servers that speak plain JSON can send `{ "type", "payload" }`
//! envelopes instead, decoded by [`decode_text`].

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Syscall of the outbound control message that joins a channel.
pub const JOIN_CHANNEL: &str = "join:channel";

/// Syscall of the outbound control message that leaves a channel.
pub const LEAVE_CHANNEL: &str = "leave:channel";

/// Frame data key for error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Frame data key for grepable error codes.
pub const FRAME_CODE: &str = "code";

/// Error returned by [`decode_frame`] and [`decode_text`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `status` integer on the wire does not map to a known [`Status`] variant.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
    /// A text message was not valid JSON.
    #[error("failed to decode json frame: {0}")]
    Json(#[from] serde_json::Error),
    /// A JSON envelope carried neither a `syscall` nor a `type`.
    #[error("json envelope has no event type")]
    MissingType,
}

/// Lifecycle status of a frame in a request/response exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Request frame, and the status of unsolicited server events.
    Request,
    /// Intermediate streaming item (non-terminal).
    Item,
    /// Intermediate streaming batch (non-terminal).
    Bulk,
    /// Successful terminal response.
    Done,
    /// Error terminal response.
    Error,
    /// Cancellation frame.
    Cancel,
}

impl Status {
    /// Convert status into wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Request => WireFrameStatus::Request as i32,
            Self::Item => WireFrameStatus::Item as i32,
            Self::Bulk => WireFrameStatus::Bulk as i32,
            Self::Done => WireFrameStatus::Done as i32,
            Self::Error => WireFrameStatus::Error as i32,
            Self::Cancel => WireFrameStatus::Cancel as i32,
        }
    }

    /// Terminal statuses end a response stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancel)
    }

    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireFrameStatus::try_from(value) {
            Ok(WireFrameStatus::Request) => Ok(Self::Request),
            Ok(WireFrameStatus::Item) => Ok(Self::Item),
            Ok(WireFrameStatus::Bulk) => Ok(Self::Bulk),
            Ok(WireFrameStatus::Done) => Ok(Self::Done),
            Ok(WireFrameStatus::Error) => Ok(Self::Error),
            Ok(WireFrameStatus::Cancel) => Ok(Self::Cancel),
            Err(_) => Err(CodecError::InvalidStatus(value)),
        }
    }
}

/// A single message on the realtime wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique identifier for this frame (UUID string).
    pub id: String,
    /// ID of the request frame this is responding to, if any.
    pub parent_id: Option<String>,
    /// Milliseconds since the Unix epoch when the frame was created.
    pub ts: i64,
    /// Channel the frame was published on or is addressed to.
    pub channel: Option<String>,
    /// Sender identifier (user ID or system label).
    pub from: Option<String>,
    /// Namespaced event type, e.g. `"task:update"`.
    pub syscall: String,
    /// Lifecycle position of the frame.
    pub status: Status,
    /// Arbitrary JSON payload.
    pub data: Value,
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame with a fresh id.
    pub fn request(syscall: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            ts: now_ms(),
            channel: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Create an unsolicited event frame, as the server pushes them.
    pub fn event(event_type: impl Into<String>, payload: Value) -> Self {
        Self::request(event_type, payload)
    }

    /// Control message joining `channel`.
    #[must_use]
    pub fn join_channel(channel: &str) -> Self {
        Self::request(JOIN_CHANNEL, serde_json::json!({ "channel": channel })).with_channel(channel)
    }

    /// Control message leaving `channel`.
    #[must_use]
    pub fn leave_channel(channel: &str) -> Self {
        Self::request(LEAVE_CHANNEL, serde_json::json!({ "channel": channel })).with_channel(channel)
    }

    /// Successful terminal reply to this frame.
    #[must_use]
    pub fn done_with(&self, data: Value) -> Self {
        self.reply(Status::Done, data)
    }

    /// Error terminal reply to this frame.
    #[must_use]
    pub fn error_reply(&self, code: &str, message: impl Into<String>) -> Self {
        self.reply(
            Status::Error,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    fn reply(&self, status: Status, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            ts: now_ms(),
            channel: self.channel.clone(),
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Insert one key into an object payload. Non-object payloads are replaced.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(key.into(), value.into());
        }
        self
    }
}

// =============================================================================
// ROUTING
// =============================================================================

impl Frame {
    /// The syscall prefix (everything before the first ':').
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }

    /// The syscall operation (everything after the first ':'), empty if none.
    #[must_use]
    pub fn operation(&self) -> &str {
        self.syscall.split_once(':').map_or("", |(_, op)| op)
    }

    /// Error message carried by an error frame.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.data
            .get(FRAME_MESSAGE)
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_owned()
    }

    /// Error code carried by an error frame.
    #[must_use]
    pub fn error_code(&self) -> Option<String> {
        self.data.get(FRAME_CODE).and_then(Value::as_str).map(str::to_owned)
    }
}

// =============================================================================
// BINARY CODEC
// =============================================================================

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::InvalidStatus`] for out-of-range status values.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    wire_to_frame(wire)
}

// =============================================================================
// TEXT CODEC
// =============================================================================

/// Plain JSON event envelope: `{ "type": "task:update", "payload": {...} }`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    channel: Option<String>,
}

/// Decode a text message: either a full JSON [`Frame`] or an event envelope.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for invalid JSON and [`CodecError::MissingType`]
/// when the object is neither shape.
pub fn decode_text(text: &str) -> Result<Frame, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("syscall").is_some() {
        return Ok(serde_json::from_value(value)?);
    }
    if value.get("type").is_none() {
        return Err(CodecError::MissingType);
    }
    let envelope: Envelope = serde_json::from_value(value)?;
    let payload = if envelope.payload.is_null() {
        Value::Object(Map::new())
    } else {
        envelope.payload
    };
    let mut frame = Frame::event(envelope.event_type, payload);
    frame.channel = envelope.channel;
    Ok(frame)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        id: frame.id.clone(),
        parent_id: frame.parent_id.clone(),
        ts: frame.ts,
        channel: frame.channel.clone(),
        from: frame.from.clone(),
        syscall: frame.syscall.clone(),
        status: frame.status.as_i32(),
        data: Some(json_to_proto_value(&frame.data)),
    }
}

fn wire_to_frame(wire: WireFrame) -> Result<Frame, CodecError> {
    Ok(Frame {
        id: wire.id,
        parent_id: wire.parent_id,
        ts: wire.ts,
        channel: wire.channel,
        from: wire.from,
        syscall: wire.syscall,
        status: Status::from_i32(wire.status)?,
        data: wire
            .data
            .map_or(Value::Object(Map::new()), |v| proto_to_json_value(&v)),
    })
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => number_value(*v),
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

/// Protobuf numbers are doubles. Whole values inside the i64 range come back as
/// JSON integers so ids and counts survive the trip unchanged.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number_value(v: f64) -> Value {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        return Value::from(v as i64);
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, optional, tag = "4")]
    channel: Option<String>,
    #[prost(string, optional, tag = "5")]
    from: Option<String>,
    #[prost(string, tag = "6")]
    syscall: String,
    #[prost(enumeration = "WireFrameStatus", tag = "7")]
    status: i32,
    #[prost(message, optional, tag = "8")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireFrameStatus {
    Request = 0,
    Done = 1,
    Error = 2,
    Cancel = 3,
    Item = 4,
    Bulk = 5,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
