use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parallax_common::{unserialize_object, Message, MsgId, Object, ParallelError, RemoteError, Result};

use crate::state::Shared;

/// Handle to the replies of one `apply` call.
///
/// A call to several targets produces one msg_id per target.
#[derive(Clone)]
pub struct AsyncResult {
    msg_ids: Vec<MsgId>,
    shared: Arc<Shared>,
}

impl AsyncResult {
    pub(crate) fn new(msg_ids: Vec<MsgId>, shared: Arc<Shared>) -> Self {
        Self { msg_ids, shared }
    }

    pub fn msg_ids(&self) -> &[MsgId] {
        &self.msg_ids
    }

    /// True once every reply has arrived.
    pub fn ready(&self) -> bool {
        let state = self.shared.lock();
        self.msg_ids.iter().all(|id| state.results.contains_key(id))
    }

    /// Waits for every reply, or until `timeout`. Returns [`ready`](Self::ready).
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        self.shared
            .wait_until(timeout, |state| {
                self.msg_ids.iter().all(|id| state.results.contains_key(id))
            })
            .await
    }

    /// True if every reply arrived and reported success.
    pub fn successful(&self) -> bool {
        let state = self.shared.lock();
        self.msg_ids.iter().all(|id| {
            state
                .results
                .get(id)
                .and_then(Message::status)
                .map(|s| s == "ok")
                .unwrap_or(false)
        })
    }

    /// Waits for every reply and decodes the results in msg_id order.
    ///
    /// The first failed reply is returned as [`ParallelError::Remote`].
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Vec<Object>> {
        if !self.wait(timeout).await {
            return Err(ParallelError::Timeout(
                timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            ));
        }

        let replies: Vec<Message> = {
            let state = self.shared.lock();
            self.msg_ids
                .iter()
                .filter_map(|id| state.results.get(id).cloned())
                .collect()
        };
        replies.into_iter().map(decode_reply).collect()
    }

    /// Like [`get`](Self::get) for a single msg_id.
    pub async fn get_one(&self, timeout: Option<Duration>) -> Result<Object> {
        self.get(timeout)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ParallelError::InvalidResponse("no results".to_string()))
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("msg_ids", &self.msg_ids)
            .field("ready", &self.ready())
            .finish()
    }
}

/// Turns an `apply_reply` into its result or the remote error it carries.
pub(crate) fn decode_reply(reply: Message) -> Result<Object> {
    let status = reply.status().map(str::to_string);
    match status.as_deref() {
        Some("ok") => {
            let mut buffers: VecDeque<_> = reply.buffers.into();
            Ok(unserialize_object(&mut buffers)?)
        }
        Some(_) => Err(remote_error(reply.content_value()?).into()),
        None => Err(ParallelError::InvalidResponse(
            "reply content has no status".to_string(),
        )),
    }
}

/// Rebuilds the error carried by failed or aborted reply content.
pub(crate) fn remote_error(content: &Value) -> RemoteError {
    serde_json::from_value(content.clone()).unwrap_or_else(|_| {
        RemoteError::new(
            content
                .get("ename")
                .and_then(Value::as_str)
                .unwrap_or("RemoteError"),
            content.get("evalue").and_then(Value::as_str).unwrap_or_default(),
        )
    })
}
