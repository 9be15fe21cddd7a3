//! Message construction and framing.
//!
//! A [`Session`] stamps headers with its own uuid and username, and turns
//! [`Message`]s into ordered frames and back:
//!
//! ```text
//! [ident_0..ident_k] [DELIM] [key]? [header] [parent_header] [content] [buffer_0..buffer_n]
//! ```

use bytes::Bytes;
use serde_json::Value;
use uuid::Uuid;

use super::error::{ProtocolError, Result};
use super::message::{Content, Header, Message, MsgType, DATE_FORMAT, DELIM};
use crate::transport::{FrameSink, Multipart};

/// Number of body frames after the delimiter and key.
const MIN_BODY_FRAMES: usize = 3;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shared key written after the delimiter and required on receipt.
    ///
    /// Default: `None` (messages are not keyed)
    pub key: Option<Bytes>,
    /// Default: `$USER`, or `"username"` when unset
    pub username: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            key: None,
            username: std::env::var("USER").unwrap_or_else(|_| "username".to_string()),
        }
    }
}

/// Builds, frames and parses messages for one process.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    config: SessionConfig,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
        }
    }

    /// Shortcut for a session keyed with `key`.
    pub fn with_key(key: impl Into<Bytes>) -> Self {
        Self::new(SessionConfig {
            key: Some(key.into()),
            ..SessionConfig::default()
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.config.key.as_ref()
    }

    /// A fresh header with a new msg_id and the current time.
    pub fn msg_header(&self, msg_type: MsgType) -> Header {
        Header {
            msg_id: Uuid::new_v4().to_string(),
            msg_type,
            username: self.config.username.clone(),
            session: self.id.clone(),
            date: chrono::Utc::now().format(DATE_FORMAT).to_string(),
        }
    }

    /// Builds a message with a fresh header.
    pub fn msg(&self, msg_type: MsgType, content: Value, parent: Option<&Header>) -> Message {
        Message {
            header: self.msg_header(msg_type),
            parent_header: parent.cloned(),
            content: Content::Value(content),
            buffers: Vec::new(),
        }
    }

    /// Frames a message behind the given routing identities.
    pub fn serialize(&self, msg: &Message, idents: &[Bytes]) -> Result<Multipart> {
        let mut body = Vec::with_capacity(5 + msg.buffers.len());
        body.push(Bytes::from_static(DELIM));
        if let Some(key) = &self.config.key {
            body.push(key.clone());
        }

        body.push(Bytes::from(serde_json::to_vec(&msg.header)?));
        body.push(match &msg.parent_header {
            Some(parent) => Bytes::from(serde_json::to_vec(parent)?),
            None => Bytes::from_static(b"{}"),
        });
        body.push(match &msg.content {
            Content::Value(value) => Bytes::from(serde_json::to_vec(value)?),
            Content::Packed(raw) => raw.clone(),
        });
        body.extend(msg.buffers.iter().cloned());

        Ok(Multipart::new(idents.to_vec(), body))
    }

    /// Splits routing identities from the message frames.
    ///
    /// The frame right after the identities must be the delimiter; the
    /// returned body starts after it.
    pub fn feed_identities(
        frames: &[Bytes],
        ident_count: usize,
    ) -> std::result::Result<(&[Bytes], &[Bytes]), ProtocolError> {
        match frames.get(ident_count) {
            Some(delim) if delim.as_ref() == DELIM => {
                Ok((&frames[..ident_count], &frames[ident_count + 1..]))
            }
            _ => Err(ProtocolError::MissingDelimiter(ident_count)),
        }
    }

    /// Parses the frames following the delimiter.
    ///
    /// With `content == false` the content frame is kept as
    /// [`Content::Packed`] so it can be relayed untouched.
    pub fn unpack_message(
        &self,
        frames: &[Bytes],
        content: bool,
    ) -> std::result::Result<Message, ProtocolError> {
        let mut frames = frames;
        if let Some(key) = &self.config.key {
            match frames.first() {
                Some(received) if received == key => frames = &frames[1..],
                _ => return Err(ProtocolError::KeyMismatch),
            }
        }

        if frames.len() < MIN_BODY_FRAMES {
            return Err(ProtocolError::TooFewFrames {
                expected: MIN_BODY_FRAMES,
                actual: frames.len(),
            });
        }

        let header = parse_header(&frames[0])?;
        let parent_header = parse_parent(&frames[1])?;
        let content = if content {
            Content::Value(serde_json::from_slice(&frames[2])?)
        } else {
            Content::Packed(frames[2].clone())
        };

        Ok(Message {
            header,
            parent_header,
            content,
            buffers: frames[MIN_BODY_FRAMES..].to_vec(),
        })
    }

    /// Splits and parses a received multipart message.
    pub fn recv(
        &self,
        msg: &Multipart,
        content: bool,
    ) -> std::result::Result<(Vec<Bytes>, Message), ProtocolError> {
        let (idents, body) = Self::feed_identities(&msg.frames, msg.ident_count)?;
        let message = self.unpack_message(body, content)?;
        Ok((idents.to_vec(), message))
    }

    /// Builds a message, sends it, and returns it.
    pub fn send<S: FrameSink + ?Sized>(
        &self,
        sink: &S,
        msg_type: MsgType,
        content: Value,
        buffers: Vec<Bytes>,
        parent: Option<&Header>,
        idents: &[Bytes],
    ) -> Result<Message> {
        let mut msg = self.msg(msg_type, content, parent);
        msg.buffers = buffers;
        self.send_message(sink, &msg, idents)?;
        Ok(msg)
    }

    /// Sends an already built message.
    pub fn send_message<S: FrameSink + ?Sized>(
        &self,
        sink: &S,
        msg: &Message,
        idents: &[Bytes],
    ) -> Result<()> {
        let frames = self.serialize(msg, idents)?;
        sink.send_multipart(frames)
    }
}

fn parse_header(raw: &[u8]) -> std::result::Result<Header, ProtocolError> {
    let value: Value = serde_json::from_slice(raw)?;
    // Check the type first so an unknown kind reports its name.
    match value.get("msg_type").and_then(Value::as_str) {
        Some(kind) => {
            kind.parse::<MsgType>()?;
        }
        None => return Err(ProtocolError::Malformed("header has no msg_type".to_string())),
    }
    Ok(serde_json::from_value(value)?)
}

fn parse_parent(raw: &[u8]) -> std::result::Result<Option<Header>, ProtocolError> {
    let value: Value = serde_json::from_slice(raw)?;
    match &value {
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Null => Ok(None),
        _ => Ok(Some(parse_header(raw)?)),
    }
}
