//! Parallax Message Types
//!
//! This module defines the message structure shared by every channel:
//! a [`Header`], an optional parent header, a [`Content`] body and an ordered
//! list of raw buffers.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::error::ProtocolError;

/// Globally unique message identifier (a uuid4 string).
pub type MsgId = String;

/// Engine identifier assigned by the controller at registration.
pub type EngineId = u32;

/// Frame separating routing identities from the message body.
pub const DELIM: &[u8] = b"<IDS|MSG>";

/// `strftime` layout of [`Header::date`] (`%Y-%m-%dT%H:%M:%S.%f`).
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Every kind of message the system exchanges.
///
/// Dispatch on this enum is exhaustive; a header naming anything else fails
/// to parse with [`ProtocolError::UnknownMsgType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    RegistrationRequest,
    RegistrationReply,
    UnregistrationRequest,
    UnregistrationReply,
    RegistrationNotification,
    UnregistrationNotification,
    ConnectionRequest,
    ConnectionReply,
    QueueRequest,
    QueueReply,
    ResultRequest,
    ResultReply,
    PurgeRequest,
    PurgeReply,
    ApplyRequest,
    ApplyReply,
    AbortRequest,
    AbortReply,
    ClearRequest,
    ClearReply,
    ShutdownRequest,
    ShutdownReply,
}

impl MsgType {
    pub const ALL: [MsgType; 22] = [
        MsgType::RegistrationRequest,
        MsgType::RegistrationReply,
        MsgType::UnregistrationRequest,
        MsgType::UnregistrationReply,
        MsgType::RegistrationNotification,
        MsgType::UnregistrationNotification,
        MsgType::ConnectionRequest,
        MsgType::ConnectionReply,
        MsgType::QueueRequest,
        MsgType::QueueReply,
        MsgType::ResultRequest,
        MsgType::ResultReply,
        MsgType::PurgeRequest,
        MsgType::PurgeReply,
        MsgType::ApplyRequest,
        MsgType::ApplyReply,
        MsgType::AbortRequest,
        MsgType::AbortReply,
        MsgType::ClearRequest,
        MsgType::ClearReply,
        MsgType::ShutdownRequest,
        MsgType::ShutdownReply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::RegistrationRequest => "registration_request",
            MsgType::RegistrationReply => "registration_reply",
            MsgType::UnregistrationRequest => "unregistration_request",
            MsgType::UnregistrationReply => "unregistration_reply",
            MsgType::RegistrationNotification => "registration_notification",
            MsgType::UnregistrationNotification => "unregistration_notification",
            MsgType::ConnectionRequest => "connection_request",
            MsgType::ConnectionReply => "connection_reply",
            MsgType::QueueRequest => "queue_request",
            MsgType::QueueReply => "queue_reply",
            MsgType::ResultRequest => "result_request",
            MsgType::ResultReply => "result_reply",
            MsgType::PurgeRequest => "purge_request",
            MsgType::PurgeReply => "purge_reply",
            MsgType::ApplyRequest => "apply_request",
            MsgType::ApplyReply => "apply_reply",
            MsgType::AbortRequest => "abort_request",
            MsgType::AbortReply => "abort_reply",
            MsgType::ClearRequest => "clear_request",
            MsgType::ClearReply => "clear_reply",
            MsgType::ShutdownRequest => "shutdown_request",
            MsgType::ShutdownReply => "shutdown_reply",
        }
    }

    /// The reply type paired with a request type.
    pub fn reply_type(&self) -> Option<MsgType> {
        match self {
            MsgType::RegistrationRequest => Some(MsgType::RegistrationReply),
            MsgType::UnregistrationRequest => Some(MsgType::UnregistrationReply),
            MsgType::ConnectionRequest => Some(MsgType::ConnectionReply),
            MsgType::QueueRequest => Some(MsgType::QueueReply),
            MsgType::ResultRequest => Some(MsgType::ResultReply),
            MsgType::PurgeRequest => Some(MsgType::PurgeReply),
            MsgType::ApplyRequest => Some(MsgType::ApplyReply),
            MsgType::AbortRequest => Some(MsgType::AbortReply),
            MsgType::ClearRequest => Some(MsgType::ClearReply),
            MsgType::ShutdownRequest => Some(MsgType::ShutdownReply),
            _ => None,
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MsgType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MsgType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMsgType(s.to_string()))
    }
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: MsgId,
    pub msg_type: MsgType,
    pub username: String,
    pub session: String,
    pub date: String,
}

/// Message body.
///
/// Relays that only route a message keep the body as the opaque frame it
/// arrived in, so it can be forwarded without being parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Value(Value),
    Packed(Bytes),
}

impl Content {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Content::Value(v) => Some(v),
            Content::Packed(_) => None,
        }
    }

    pub fn is_packed(&self) -> bool {
        matches!(self, Content::Packed(_))
    }
}

/// A parsed message, without its routing identities.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub parent_header: Option<Header>,
    pub content: Content,
    pub buffers: Vec<Bytes>,
}

impl Message {
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    /// Id of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    pub fn content_value(&self) -> Result<&Value, ProtocolError> {
        self.content.as_value().ok_or(ProtocolError::PackedContent)
    }

    /// Deserializes the content into a typed body.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self.content_value()?;
        serde_json::from_value(value.clone())
            .map_err(|e| ProtocolError::InvalidContent(format!("{}: {}", self.header.msg_type, e)))
    }

    /// `status` field of reply content; packed or status-less content reads as `None`.
    pub fn status(&self) -> Option<&str> {
        self.content
            .as_value()
            .and_then(|v| v.get("status"))
            .and_then(Value::as_str)
    }
}
