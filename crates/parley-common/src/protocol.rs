use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{Error, Result};

/// Discriminator carried in the `type` field of every signaling frame.
///
/// Unrecognised kinds are kept as [`MessageKind::Unknown`] so newer clients are
/// not disconnected by an older server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Join,
    ActiveUsers,
    Call,
    CancelCall,
    AcceptCall,
    Offer,
    Answer,
    Candidate,
    HangUp,
    Leave,
    /// Server to client only, sent when error replies are enabled.
    Error,
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Join => "join",
            MessageKind::ActiveUsers => "activeUsers",
            MessageKind::Call => "call",
            MessageKind::CancelCall => "cancelCall",
            MessageKind::AcceptCall => "acceptCall",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::HangUp => "hangUp",
            MessageKind::Leave => "leave",
            MessageKind::Error => "error",
            MessageKind::Unknown(kind) => kind,
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "join" => MessageKind::Join,
            "activeUsers" => MessageKind::ActiveUsers,
            "call" => MessageKind::Call,
            "cancelCall" => MessageKind::CancelCall,
            "acceptCall" => MessageKind::AcceptCall,
            "offer" => MessageKind::Offer,
            "answer" => MessageKind::Answer,
            "candidate" => MessageKind::Candidate,
            "hangUp" => MessageKind::HangUp,
            "leave" => MessageKind::Leave,
            "error" => MessageKind::Error,
            _ => MessageKind::Unknown(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Unknown(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signaling frame: `{type, sender, receiver, data}`.
///
/// `data` is kept as raw JSON text. The server never looks inside offer,
/// answer or candidate payloads, so they go out exactly as they came in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl SignalMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            sender: None,
            receiver: None,
            data: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    /// Attach `data` serialized from any value.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(data).map_err(Error::serialization)?;
        self.data = Some(raw);
        Ok(self)
    }

    /// `{type:"join", receiver:name, data:{result}}`
    pub fn join_result(name: &str, result: bool) -> Result<Self> {
        Self::new(MessageKind::Join)
            .with_receiver(name)
            .with_data(&JoinResult { result })
    }

    /// `{type:"activeUsers", data:{users:[...]}}`
    pub fn active_users(users: Vec<ActiveUser>) -> Result<Self> {
        Self::new(MessageKind::ActiveUsers).with_data(&ActiveUsers { users })
    }

    /// `{type:"error", receiver:name, data:{reason}}`
    pub fn error_reply(receiver: Option<&str>, reason: impl Into<String>) -> Result<Self> {
        let msg = Self::new(MessageKind::Error);
        let msg = match receiver {
            Some(name) => msg.with_receiver(name),
            None => msg,
        };
        msg.with_data(&ErrorReply {
            reason: reason.into(),
        })
    }

    /// Names are opaque: only an absent field counts as missing, `""` is a
    /// name like any other.
    pub fn sender_name(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn receiver_name(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    /// Decode `data` into a concrete type.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = self
            .data
            .as_ref()
            .ok_or_else(|| Error::protocol(format!("{} message has no data", self.kind)))?;
        serde_json::from_str(raw.get()).map_err(Error::serialization)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::protocol)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::serialization)
    }
}

/// Payload of a `join` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResult {
    pub result: bool,
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    pub name: String,
    #[serde(rename = "inCall")]
    pub in_call: bool,
}

/// Payload of an `activeUsers` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUsers {
    pub users: Vec<ActiveUser>,
}

/// Payload of an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub reason: String,
}

/// STUN/TURN server entry in the shape browsers accept for `RTCPeerConnection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServersResponse {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}
