//! What a client has learned from the controller, and the task that keeps
//! it current.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use parallax_common::transport::{Multipart, SubSocket};
use parallax_common::{
    EngineId, EngineInfo, EngineNotification, Message, MsgId, MsgType, RemoteError, Session,
};

#[derive(Debug, Default)]
pub(crate) struct ClientState {
    /// Registered engines and their queue identities.
    pub engines: BTreeMap<EngineId, Bytes>,
    /// Submitted apply requests with no reply yet.
    pub outstanding: HashSet<MsgId>,
    /// Engine each direct request was sent to.
    pub direct: HashMap<MsgId, EngineId>,
    /// Apply replies by request id.
    pub results: HashMap<MsgId, Message>,
    /// Replies to controller and control requests by request id.
    pub replies: HashMap<MsgId, Message>,
}

impl ClientState {
    /// Records one incoming message. Returns false if it was not understood.
    pub fn handle(&mut self, session: &Session, msg: Message) -> bool {
        match msg.msg_type() {
            MsgType::ApplyReply => {
                let Some(parent) = msg.parent_msg_id().map(str::to_string) else {
                    return false;
                };
                self.outstanding.remove(&parent);
                self.direct.remove(&parent);
                self.results.insert(parent, msg);
            }
            MsgType::RegistrationNotification => {
                let Ok(note) = msg.content_as::<EngineNotification>() else {
                    return false;
                };
                info!(engine = note.id, "engine joined");
                self.engines.insert(note.id, Bytes::from(note.queue));
            }
            MsgType::UnregistrationNotification => {
                let Ok(note) = msg.content_as::<EngineNotification>() else {
                    return false;
                };
                info!(engine = note.id, "engine left");
                self.engines.remove(&note.id);
                self.engine_died(session, note.id, &note.queue);
            }
            _ => match msg.parent_msg_id().map(str::to_string) {
                Some(parent) => {
                    self.replies.insert(parent, msg);
                }
                None => return false,
            },
        }
        true
    }

    /// Resolves every direct request still waiting on `id` as an
    /// `EngineError`.
    fn engine_died(&mut self, session: &Session, id: EngineId, queue: &str) {
        let stranded: Vec<MsgId> = self
            .direct
            .iter()
            .filter(|(_, engine)| **engine == id)
            .map(|(msg_id, _)| msg_id.clone())
            .collect();

        for msg_id in stranded {
            self.direct.remove(&msg_id);
            if !self.outstanding.remove(&msg_id) {
                continue;
            }
            let error = RemoteError::engine_died(id, &msg_id).with_engine_info(EngineInfo {
                engine_id: Some(id),
                engine_ident: queue.to_string(),
                method: "apply".to_string(),
            });
            let mut parent = session.msg_header(MsgType::ApplyRequest);
            parent.msg_id = msg_id.clone();
            let reply = session.msg(MsgType::ApplyReply, error.to_content(), Some(&parent));
            self.results.insert(msg_id, reply);
        }
    }
}

/// Client state plus the signal fired whenever it changes.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    state: Mutex<ClientState>,
    changed: Notify,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until `done` holds. Returns false if `timeout` passes first.
    pub async fn wait_until<F>(&self, timeout: Option<Duration>, done: F) -> bool
    where
        F: Fn(&ClientState) -> bool,
    {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if done(&self.lock()) {
                    return;
                }
                notified.await;
            }
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    pub fn notify(&self) {
        self.changed.notify_waiters();
    }
}

/// Receiving halves of every channel a client listens on.
pub(crate) struct Inbound {
    pub registration: mpsc::UnboundedReceiver<Multipart>,
    pub queue: mpsc::UnboundedReceiver<Multipart>,
    pub task: mpsc::UnboundedReceiver<Multipart>,
    pub control: mpsc::UnboundedReceiver<Multipart>,
    pub notification: SubSocket,
}

/// Feeds every incoming message into the shared state.
pub(crate) async fn receive(session: Session, shared: std::sync::Arc<Shared>, mut inbound: Inbound) {
    loop {
        let msg = tokio::select! {
            Some(msg) = inbound.registration.recv() => msg,
            Some(msg) = inbound.queue.recv() => msg,
            Some(msg) = inbound.task.recv() => msg,
            Some(msg) = inbound.control.recv() => msg,
            Some(msg) = inbound.notification.recv() => msg,
            else => break,
        };

        let parsed = match session.recv(&msg, true) {
            Ok((_, parsed)) => parsed,
            Err(e) => {
                warn!(error = %e, "dropping malformed message");
                continue;
            }
        };
        let msg_type = parsed.msg_type();
        if !shared.lock().handle(&session, parsed) {
            debug!(%msg_type, "ignoring message");
        }
        shared.notify();
    }
    debug!("client receiver stopped");
}
