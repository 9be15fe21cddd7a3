//! Typed message bodies.
//!
//! Content travels as a JSON map; these structs are the shapes each message
//! type carries. Fields that are optional on the wire are `Option` or
//! `#[serde(default)]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::message::{EngineId, MsgId};
use crate::canning::ApplyInfo;
use crate::dependency::Dependency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
    Aborted,
}

/// Sent by an engine on the registration channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Identity the engine will use on its queue, task and control channels.
    pub queue: String,
    /// Identity the engine's heart answers pings with.
    pub heartbeat: String,
}

/// Controller's answer to a [`RegistrationRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EngineId>,
    #[serde(default)]
    pub queue: String,
    #[serde(default)]
    pub control: String,
    #[serde(default)]
    pub task: String,
    /// `[ping (publish) address, pong (reply) address]`
    #[serde(default)]
    pub heartbeat: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RegistrationReply {
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            id: None,
            queue: String::new(),
            control: String::new(),
            task: String::new(),
            heartbeat: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Payload of registration and unregistration notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineNotification {
    pub id: EngineId,
    pub queue: String,
}

/// Addresses a client needs, plus the engines known at connection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReply {
    pub status: Status,
    pub queue: String,
    pub task: String,
    pub control: String,
    pub notification: String,
    /// Engine id → queue identity.
    pub engines: BTreeMap<EngineId, String>,
}

/// Body of an `apply_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequestContent {
    /// Whether the function runs against the engine's persistent namespace.
    pub bound: bool,
    /// How the trailing buffers decompose into function, args and kwargs.
    pub info: ApplyInfo,
    /// Time dependency: the task may not start before this is met.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Dependency>,
    /// Location dependency: the task must run where these ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow: Option<Dependency>,
    /// Restricts load-balanced placement to these engines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<EngineId>>,
    /// How many times a failed task may be resubmitted.
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueRequest {
    /// Engines to report on; all when absent.
    #[serde(default)]
    pub targets: Option<Vec<EngineId>>,
    /// Report msg_id lists instead of counts.
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRequest {
    pub msg_ids: Vec<MsgId>,
    #[serde(default)]
    pub status_only: bool,
}

/// Which stored results a purge drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PurgeTarget {
    /// The literal string `"all"`.
    All(String),
    Ids(Vec<MsgId>),
}

impl PurgeTarget {
    pub fn all() -> Self {
        PurgeTarget::All("all".to_string())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, PurgeTarget::All(s) if s == "all")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeRequest {
    #[serde(default = "PurgeRequest::no_ids")]
    pub msg_ids: PurgeTarget,
    #[serde(default)]
    pub engine_ids: Vec<EngineId>,
}

impl PurgeRequest {
    fn no_ids() -> PurgeTarget {
        PurgeTarget::Ids(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_reply_error_has_no_id() {
        let reply = RegistrationReply::error("queue_id 'q' in use");
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["status"], "error");
        assert!(value.get("id").is_none());
        assert_eq!(value["reason"], "queue_id 'q' in use");
    }

    #[test]
    fn test_purge_target_all() {
        let req: PurgeRequest = serde_json::from_value(json!({"msg_ids": "all"})).unwrap();
        assert!(req.msg_ids.is_all());
        assert!(req.engine_ids.is_empty());

        let req: PurgeRequest =
            serde_json::from_value(json!({"msg_ids": ["a", "b"], "engine_ids": [1]})).unwrap();
        assert_eq!(req.msg_ids, PurgeTarget::Ids(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(req.engine_ids, vec![1]);
    }

    #[test]
    fn test_apply_request_optional_fields_default() {
        let content: ApplyRequestContent = serde_json::from_value(json!({
            "bound": false,
            "info": {"nargs": 1, "narg_bufs": 1, "kw_keys": []}
        }))
        .unwrap();
        assert!(content.after.is_none());
        assert!(content.follow.is_none());
        assert!(content.targets.is_none());
        assert_eq!(content.retries, 0);
    }
}
