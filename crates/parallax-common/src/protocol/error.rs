use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::canning::CanningError;
use crate::protocol::message::{EngineId, MsgType};

#[derive(Error, Debug)]
pub enum ParallelError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Canning error: {0}")]
    Canning(#[from] CanningError),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("No such engine: {0}")]
    NoSuchEngine(EngineId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl From<std::net::AddrParseError> for ParallelError {
    fn from(err: std::net::AddrParseError) -> Self {
        ParallelError::InvalidRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ParallelError>;

/// Failures of the framing and message layer.
///
/// These are never fatal to a process: receivers log them and drop the
/// offending message.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Missing delimiter at frame {0}")]
    MissingDelimiter(usize),

    #[error("Expected at least {expected} frames, got {actual}")]
    TooFewFrames { expected: usize, actual: usize },

    #[error("Key mismatch: message was not signed with this session's key")]
    KeyMismatch,

    #[error("Unknown message type: {0}")]
    UnknownMsgType(String),

    #[error("Unexpected message type: {0}")]
    UnexpectedMsgType(MsgType),

    #[error("Content is still packed")]
    PackedContent,

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary content error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Where a remote failure happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub engine_id: Option<EngineId>,
    pub engine_ident: String,
    pub method: String,
}

/// An error raised on the far side of the wire and shipped back as reply
/// content.
///
/// On the wire this is `{status: "error", ename, evalue, traceback,
/// engine_info}`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{ename}({evalue})")]
pub struct RemoteError {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
    #[serde(default)]
    pub engine_info: Option<EngineInfo>,
}

impl RemoteError {
    pub const ENGINE_ERROR: &'static str = "EngineError";
    pub const UNMET_DEPENDENCY: &'static str = "UnmetDependency";
    pub const ABORTED: &'static str = "TaskAborted";
    pub const KEY_ERROR: &'static str = "KeyError";

    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
            engine_info: None,
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }

    pub fn with_engine_info(mut self, info: EngineInfo) -> Self {
        self.engine_info = Some(info);
        self
    }

    /// The error delivered for work owned by an engine that went away.
    pub fn engine_died(engine_id: EngineId, msg_id: &str) -> Self {
        Self::new(
            Self::ENGINE_ERROR,
            format!("Engine {} died while running task {}", engine_id, msg_id),
        )
    }

    /// The error delivered for a task whose dependencies can never be met.
    pub fn unmet_dependency(msg_id: &str, reason: impl Into<String>) -> Self {
        Self::new(
            Self::UNMET_DEPENDENCY,
            format!("task {}: {}", msg_id, reason.into()),
        )
    }

    pub fn is_engine_error(&self) -> bool {
        self.ename == Self::ENGINE_ERROR
    }

    pub fn is_unmet_dependency(&self) -> bool {
        self.ename == Self::UNMET_DEPENDENCY
    }

    /// Reply content carrying this error.
    pub fn to_content(&self) -> Value {
        json!({
            "status": "error",
            "ename": self.ename,
            "evalue": self.evalue,
            "traceback": self.traceback,
            "engine_info": self.engine_info,
        })
    }

    /// Rebuilds the error from reply content, if the content reports one.
    pub fn from_content(content: &Value) -> Option<Self> {
        if content.get("status").and_then(Value::as_str) != Some("error") {
            return None;
        }
        serde_json::from_value(content.clone()).ok()
    }
}
