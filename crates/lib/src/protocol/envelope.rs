//! The JSON message envelope and its typed decoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::payload::{DataRequest, EncodedPayload};
use crate::sync::error::{ErrorKind, SyncError};
use crate::sync::peer_types::{PeerId, PeerInfo};
use crate::sync::timers::LiveTimerState;

/// Wire name of each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Handshake,
    Ping,
    Pong,
    DataRequest,
    DataResponse,
    DataUpdate,
    TimerStart,
    TimerStop,
    TimerUpdate,
    TimerForceStop,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::DataRequest => "dataRequest",
            MessageType::DataResponse => "dataResponse",
            MessageType::DataUpdate => "dataUpdate",
            MessageType::TimerStart => "timerStart",
            MessageType::TimerStop => "timerStop",
            MessageType::TimerUpdate => "timerUpdate",
            MessageType::TimerForceStop => "timerForceStop",
            MessageType::Error => "error",
        }
    }
}

/// The envelope exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: PeerId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// Body of `timerForceStop`: the receiver must end its timer for
/// `entity_id` at `winner_start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerForceStop {
    pub entity_id: String,
    pub winner_start_time: DateTime<Utc>,
    pub winner_peer_id: PeerId,
}

/// Body of `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SyncError> for ErrorMessage {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A decoded message body. One variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(PeerInfo),
    Ping,
    Pong,
    DataRequest(DataRequest),
    DataResponse(EncodedPayload),
    DataUpdate(EncodedPayload),
    TimerStart(LiveTimerState),
    TimerStop(LiveTimerState),
    TimerUpdate(LiveTimerState),
    TimerForceStop(TimerForceStop),
    Error(ErrorMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake(_) => MessageType::Handshake,
            Message::Ping => MessageType::Ping,
            Message::Pong => MessageType::Pong,
            Message::DataRequest(_) => MessageType::DataRequest,
            Message::DataResponse(_) => MessageType::DataResponse,
            Message::DataUpdate(_) => MessageType::DataUpdate,
            Message::TimerStart(_) => MessageType::TimerStart,
            Message::TimerStop(_) => MessageType::TimerStop,
            Message::TimerUpdate(_) => MessageType::TimerUpdate,
            Message::TimerForceStop(_) => MessageType::TimerForceStop,
            Message::Error(_) => MessageType::Error,
        }
    }

    fn into_data(self) -> Result<Value, SyncError> {
        Ok(match self {
            Message::Ping | Message::Pong => Value::Null,
            Message::Handshake(info) => serde_json::to_value(info)?,
            Message::DataRequest(req) => serde_json::to_value(req)?,
            Message::DataResponse(body) | Message::DataUpdate(body) => body.0,
            Message::TimerStart(t) | Message::TimerStop(t) | Message::TimerUpdate(t) => {
                serde_json::to_value(t)?
            }
            Message::TimerForceStop(stop) => serde_json::to_value(stop)?,
            Message::Error(err) => serde_json::to_value(err)?,
        })
    }

    fn from_data(message_type: MessageType, data: Value) -> Result<Self, SyncError> {
        Ok(match message_type {
            MessageType::Handshake => Message::Handshake(serde_json::from_value(data)?),
            MessageType::Ping => Message::Ping,
            MessageType::Pong => Message::Pong,
            MessageType::DataRequest => Message::DataRequest(serde_json::from_value(data)?),
            MessageType::DataResponse => Message::DataResponse(EncodedPayload(data)),
            MessageType::DataUpdate => Message::DataUpdate(EncodedPayload(data)),
            MessageType::TimerStart => Message::TimerStart(serde_json::from_value(data)?),
            MessageType::TimerStop => Message::TimerStop(serde_json::from_value(data)?),
            MessageType::TimerUpdate => Message::TimerUpdate(serde_json::from_value(data)?),
            MessageType::TimerForceStop => {
                Message::TimerForceStop(serde_json::from_value(data)?)
            }
            MessageType::Error => Message::Error(serde_json::from_value(data)?),
        })
    }
}

/// A typed envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message_id: String,
    pub sender_id: PeerId,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub reply_to: Option<String>,
    pub message: Message,
}

impl Envelope {
    /// A new envelope with a fresh message id.
    pub fn new(sender_id: PeerId, timestamp: DateTime<Utc>, message: Message) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            sender_id,
            timestamp,
            session_id: None,
            reply_to: None,
            message,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    pub fn into_wire(self) -> Result<WireEnvelope, SyncError> {
        let message_type = self.message.message_type();
        Ok(WireEnvelope {
            message_id: self.message_id,
            message_type,
            sender_id: self.sender_id,
            timestamp: self.timestamp,
            session_id: self.session_id,
            reply_to: self.reply_to,
            data: self.message.into_data()?,
        })
    }

    pub fn from_wire(wire: WireEnvelope) -> Result<Self, SyncError> {
        let message = Message::from_data(wire.message_type, wire.data).map_err(|e| {
            SyncError::DataCorrupted(format!(
                "malformed {} body: {e}",
                wire.message_type.as_str()
            ))
        })?;
        Ok(Self {
            message_id: wire.message_id,
            sender_id: wire.sender_id,
            timestamp: wire.timestamp,
            session_id: wire.session_id,
            reply_to: wire.reply_to,
            message,
        })
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(&self.clone().into_wire()?)?)
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, SyncError> {
        let wire: WireEnvelope = serde_json::from_str(text)
            .map_err(|e| SyncError::DataCorrupted(format!("malformed envelope: {e}")))?;
        Self::from_wire(wire)
    }
}
