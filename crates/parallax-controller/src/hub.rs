//! The controller's registry and bookkeeping actor.
//!
//! The hub owns every map describing the cluster: registered engines, tasks
//! in flight and stored results. Only the hub task touches them. Relays, the
//! task scheduler and the heart monitor report to it over channels.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parallax_common::transport::{Multipart, PubSocket, RouterGuard, RouterHandle};
use parallax_common::{
    ConnectionReply, EngineId, EngineInfo, EngineNotification, Header, Message, MsgId, MsgType,
    PurgeRequest, QueueRequest, RegistrationReply, RegistrationRequest, RemoteError, ResultRequest,
    Session, Status,
};

use crate::heartbeat::HeartEvent;
use crate::scheduler::SchedulerCommand;

/// Leading frame telling the hub which traffic a monitor copy is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSwitch {
    /// Client request on its way to an engine, `[client, engine]`.
    In,
    /// Engine reply on its way to a client, `[engine, client]`.
    Out,
    /// Task submitted to the scheduler, `[client]`.
    InTask,
    /// Task reply, `[engine, client]`, or `[client]` when the scheduler
    /// answered itself.
    OutTask,
    /// Task assigned to an engine; body is `[engine, msg_id]`.
    TrackTask,
}

impl MonitorSwitch {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            MonitorSwitch::In => b"in",
            MonitorSwitch::Out => b"out",
            MonitorSwitch::InTask => b"intask",
            MonitorSwitch::OutTask => b"outtask",
            MonitorSwitch::TrackTask => b"tracktask",
        }
    }

    pub fn as_frame(&self) -> Bytes {
        Bytes::from_static(self.as_bytes())
    }

    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            b"in" => Some(MonitorSwitch::In),
            b"out" => Some(MonitorSwitch::Out),
            b"intask" => Some(MonitorSwitch::InTask),
            b"outtask" => Some(MonitorSwitch::OutTask),
            b"tracktask" => Some(MonitorSwitch::TrackTask),
            _ => None,
        }
    }
}

/// A registered engine's identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConnector {
    pub id: EngineId,
    /// Identity on the queue, task and control channels.
    pub queue: Bytes,
    /// Identity on the registration channel.
    pub registration: Bytes,
    pub heartbeat: Bytes,
}

impl EngineConnector {
    pub fn queue_name(&self) -> String {
        String::from_utf8_lossy(&self.queue).into_owned()
    }
}

/// A request that has been submitted and not yet answered.
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub header: Header,
    pub client: Bytes,
    /// When the hub saw the request.
    pub received: DateTime<Utc>,
    pub engine: Option<EngineId>,
}

/// A stored reply.
#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub header: Option<Header>,
    pub result_header: Header,
    pub content: Value,
    pub buffers: Vec<Bytes>,
    pub engine_id: Option<EngineId>,
    pub completed: DateTime<Utc>,
}

/// Addresses handed out in registration and connection replies.
#[derive(Debug, Clone, Default)]
pub struct HubAddresses {
    pub engine_queue: String,
    pub engine_control: String,
    pub engine_task: String,
    pub heartbeat_ping: String,
    pub heartbeat_pong: String,
    pub client_queue: String,
    pub client_control: String,
    pub client_task: String,
    pub notification: String,
}

/// Everything the hub knows, free of any I/O.
#[derive(Debug, Default)]
pub struct HubState {
    pub engines: BTreeMap<EngineId, EngineConnector>,
    pub by_ident: HashMap<Bytes, EngineId>,
    pub hearts: HashMap<Bytes, EngineId>,
    /// Registered but not yet beating, keyed by heart identity.
    pub incoming: HashMap<Bytes, EngineConnector>,
    pub pending: HashMap<MsgId, PendingTask>,
    pub results: HashMap<MsgId, ResultRecord>,
    /// Direct requests per engine.
    pub queues: HashMap<EngineId, Vec<MsgId>>,
    /// Load-balanced tasks per engine.
    pub tasks: HashMap<EngineId, Vec<MsgId>>,
    pub completed: HashMap<EngineId, Vec<MsgId>>,
    /// Tasks the scheduler has not placed yet.
    pub unassigned: HashSet<MsgId>,
}

impl HubState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest id not used by a registered or registering engine.
    pub fn next_engine_id(&self) -> EngineId {
        let used: HashSet<EngineId> = self
            .engines
            .keys()
            .copied()
            .chain(self.incoming.values().map(|c| c.id))
            .collect();
        (0..).find(|id| !used.contains(id)).unwrap_or_default()
    }

    /// Checks that neither identity is taken.
    pub fn check_identities(&self, queue: &[u8], heart: &[u8]) -> Result<(), String> {
        let queue_taken =
            self.by_ident.contains_key(queue) || self.incoming.values().any(|c| c.queue == queue);
        if queue_taken {
            return Err(format!("queue_id {:?} in use", String::from_utf8_lossy(queue)));
        }
        if self.hearts.contains_key(heart) || self.incoming.contains_key(heart) {
            return Err(format!("heart_id {:?} in use", String::from_utf8_lossy(heart)));
        }
        Ok(())
    }

    /// Moves a registration from incoming to registered.
    pub fn finalize(&mut self, heart: &[u8]) -> Option<EngineConnector> {
        let connector = self.incoming.remove(heart)?;
        self.by_ident.insert(connector.queue.clone(), connector.id);
        self.hearts.insert(connector.heartbeat.clone(), connector.id);
        self.engines.insert(connector.id, connector.clone());
        Some(connector)
    }

    /// Removes an engine. Its direct requests are resolved as `EngineError`
    /// results and their ids returned.
    pub fn unregister(&mut self, id: EngineId) -> Option<(EngineConnector, Vec<MsgId>)> {
        let connector = self.engines.remove(&id)?;
        self.by_ident.remove(&connector.queue);
        self.hearts.remove(&connector.heartbeat);

        let stranded = self.queues.remove(&id).unwrap_or_default();
        for msg_id in &stranded {
            let Some(pending) = self.pending.remove(msg_id) else {
                continue;
            };
            let error = RemoteError::engine_died(id, msg_id).with_engine_info(EngineInfo {
                engine_id: Some(id),
                engine_ident: connector.queue_name(),
                method: "apply".to_string(),
            });
            let result_header = Header {
                msg_id: uuid::Uuid::new_v4().to_string(),
                msg_type: MsgType::ApplyReply,
                username: pending.header.username.clone(),
                session: pending.header.session.clone(),
                date: Utc::now().format(parallax_common::DATE_FORMAT).to_string(),
            };
            self.results.insert(
                msg_id.clone(),
                ResultRecord {
                    header: Some(pending.header),
                    result_header,
                    content: error.to_content(),
                    buffers: Vec::new(),
                    engine_id: Some(id),
                    completed: Utc::now(),
                },
            );
        }
        self.tasks.remove(&id);
        self.completed.remove(&id);
        Some((connector, stranded))
    }

    pub fn save_request(&mut self, header: Header, client: Bytes, engine: Option<EngineId>) {
        let msg_id = header.msg_id.clone();
        if self.results.contains_key(&msg_id) || self.pending.contains_key(&msg_id) {
            warn!(%msg_id, "duplicate msg_id");
            return;
        }
        match engine {
            Some(id) => self.queues.entry(id).or_default().push(msg_id.clone()),
            None => {
                self.unassigned.insert(msg_id.clone());
            }
        }
        self.pending.insert(
            msg_id,
            PendingTask {
                header,
                client,
                received: Utc::now(),
                engine,
            },
        );
    }

    /// Records where the scheduler sent a task.
    pub fn save_destination(&mut self, msg_id: &str, engine: EngineId) {
        self.unassigned.remove(msg_id);
        let Some(pending) = self.pending.get_mut(msg_id) else {
            debug!(msg_id, "destination for unknown task");
            return;
        };
        if let Some(previous) = pending.engine.replace(engine) {
            if let Some(tasks) = self.tasks.get_mut(&previous) {
                tasks.retain(|id| id != msg_id);
            }
        }
        self.tasks.entry(engine).or_default().push(msg_id.to_string());
    }

    /// Stores a reply and clears the request it answers.
    ///
    /// Returns the engine the request ran on, or `None` when the reply was
    /// a duplicate.
    pub fn save_result(
        &mut self,
        msg: Message,
        engine_hint: Option<EngineId>,
    ) -> Option<Option<EngineId>> {
        let msg_id = msg.parent_msg_id()?.to_string();
        if self.results.contains_key(&msg_id) {
            debug!(%msg_id, "ignoring reply for a stored result");
            return None;
        }

        let pending = self.pending.remove(&msg_id);
        let engine = pending.as_ref().and_then(|p| p.engine).or(engine_hint);
        self.unassigned.remove(&msg_id);
        if let Some(id) = engine {
            for map in [&mut self.queues, &mut self.tasks] {
                if let Some(ids) = map.get_mut(&id) {
                    ids.retain(|m| m != &msg_id);
                }
            }
            if self.engines.contains_key(&id) {
                self.completed.entry(id).or_default().push(msg_id.clone());
            }
        }

        let content = msg.content.as_value().cloned().unwrap_or(Value::Null);
        self.results.insert(
            msg_id,
            ResultRecord {
                header: pending.map(|p| p.header).or(msg.parent_header.clone()),
                result_header: msg.header,
                content,
                buffers: msg.buffers,
                engine_id: engine,
                completed: Utc::now(),
            },
        );
        Some(engine)
    }

    pub fn queue_status(&self, request: &QueueRequest) -> Result<Value, RemoteError> {
        let targets: Vec<EngineId> = match &request.targets {
            Some(targets) => {
                for id in targets {
                    if !self.engines.contains_key(id) {
                        return Err(RemoteError::new("IndexError", format!("No such engine: {}", id)));
                    }
                }
                targets.clone()
            }
            None => self.engines.keys().copied().collect(),
        };

        let summarize = |ids: Option<&Vec<MsgId>>| -> Value {
            let ids = ids.map(Vec::as_slice).unwrap_or_default();
            if request.verbose {
                json!(ids)
            } else {
                json!(ids.len())
            }
        };

        let mut content = Map::new();
        content.insert("status".to_string(), json!("ok"));
        for id in targets {
            content.insert(
                id.to_string(),
                json!({
                    "queue": summarize(self.queues.get(&id)),
                    "completed": summarize(self.completed.get(&id)),
                    "tasks": summarize(self.tasks.get(&id)),
                }),
            );
        }
        let mut unassigned: Vec<&MsgId> = self.unassigned.iter().collect();
        unassigned.sort();
        content.insert(
            "unassigned".to_string(),
            if request.verbose {
                json!(unassigned)
            } else {
                json!(unassigned.len())
            },
        );
        Ok(Value::Object(content))
    }

    /// Looks up results. Completed ids get their content, and their buffers
    /// appended in the order of the `completed` list.
    pub fn result_status(&self, request: &ResultRequest) -> Result<(Value, Vec<Bytes>), RemoteError> {
        let mut pending = Vec::new();
        let mut completed = Vec::new();
        let mut content = Map::new();
        let mut buffers = Vec::new();

        for msg_id in &request.msg_ids {
            if self.pending.contains_key(msg_id) {
                pending.push(msg_id.clone());
            } else if let Some(record) = self.results.get(msg_id) {
                completed.push(msg_id.clone());
                if !request.status_only {
                    content.insert(
                        msg_id.clone(),
                        json!({
                            "header": record.header,
                            "result_header": record.result_header,
                            "content": record.content,
                            "engine_id": record.engine_id,
                            "completed": record.completed.format(parallax_common::DATE_FORMAT).to_string(),
                            "buffer_count": record.buffers.len(),
                        }),
                    );
                    buffers.extend(record.buffers.iter().cloned());
                }
            } else {
                return Err(RemoteError::new(
                    RemoteError::KEY_ERROR,
                    format!("No such msg: {}", msg_id),
                ));
            }
        }

        content.insert("status".to_string(), json!("ok"));
        content.insert("pending".to_string(), json!(pending));
        content.insert("completed".to_string(), json!(completed));
        Ok((Value::Object(content), buffers))
    }

    pub fn purge(&mut self, request: &PurgeRequest) -> Result<(), RemoteError> {
        if request.msg_ids.is_all() {
            self.results.clear();
            self.completed.values_mut().for_each(Vec::clear);
        } else if let parallax_common::PurgeTarget::Ids(ids) = &request.msg_ids {
            for msg_id in ids {
                if self.pending.contains_key(msg_id) {
                    return Err(RemoteError::new(
                        "ValueError",
                        format!("Cannot purge pending msg: {}", msg_id),
                    ));
                }
                if !self.results.contains_key(msg_id) {
                    return Err(RemoteError::new(
                        RemoteError::KEY_ERROR,
                        format!("No such msg: {}", msg_id),
                    ));
                }
            }
            for msg_id in ids {
                self.results.remove(msg_id);
                for done in self.completed.values_mut() {
                    done.retain(|m| m != msg_id);
                }
            }
        }

        for engine_id in &request.engine_ids {
            if !self.engines.contains_key(engine_id) {
                return Err(RemoteError::new(
                    "IndexError",
                    format!("No such engine: {}", engine_id),
                ));
            }
            self.results
                .retain(|_, record| record.engine_id != Some(*engine_id));
            if let Some(done) = self.completed.get_mut(engine_id) {
                done.clear();
            }
        }
        Ok(())
    }
}

/// The hub task.
pub struct Hub {
    session: Session,
    addrs: HubAddresses,
    registration_timeout: Duration,
    registrar: RouterHandle,
    requests: mpsc::UnboundedReceiver<Multipart>,
    _registrar: RouterGuard,
    notifier: PubSocket,
    monitor: mpsc::UnboundedReceiver<Multipart>,
    heart_events: mpsc::UnboundedReceiver<HeartEvent>,
    scheduler: mpsc::UnboundedSender<SchedulerCommand>,
    purge_tx: mpsc::UnboundedSender<(Bytes, EngineId)>,
    purge_rx: mpsc::UnboundedReceiver<(Bytes, EngineId)>,
    state: HubState,
    stopping: bool,
}

/// Channels and sockets the hub is built from.
pub struct HubChannels {
    pub registrar: (RouterHandle, mpsc::UnboundedReceiver<Multipart>, RouterGuard),
    pub notifier: PubSocket,
    pub monitor: mpsc::UnboundedReceiver<Multipart>,
    pub heart_events: mpsc::UnboundedReceiver<HeartEvent>,
    pub scheduler: mpsc::UnboundedSender<SchedulerCommand>,
}

type Reply = Result<(Value, Vec<Bytes>), RemoteError>;

impl Hub {
    pub fn new(
        session: Session,
        addrs: HubAddresses,
        registration_timeout: Duration,
        channels: HubChannels,
    ) -> Self {
        let (registrar, requests, guard) = channels.registrar;
        let (purge_tx, purge_rx) = mpsc::unbounded_channel();
        Self {
            session,
            addrs,
            registration_timeout,
            registrar,
            requests,
            _registrar: guard,
            notifier: channels.notifier,
            monitor: channels.monitor,
            heart_events: channels.heart_events,
            scheduler: channels.scheduler,
            purge_tx,
            purge_rx,
            state: HubState::new(),
            stopping: false,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        info!("hub running");
        while !self.stopping {
            tokio::select! {
                msg = self.requests.recv() => match msg {
                    Some(msg) => self.dispatch_request(msg),
                    None => break,
                },
                msg = self.monitor.recv() => match msg {
                    Some(msg) => self.dispatch_monitor(msg),
                    None => break,
                },
                event = self.heart_events.recv() => match event {
                    Some(HeartEvent::NewHeart(heart)) => self.handle_new_heart(heart),
                    Some(HeartEvent::HeartFailure(heart)) => self.handle_heart_failure(heart),
                    None => break,
                },
                Some((heart, id)) = self.purge_rx.recv() => self.purge_stalled_registration(heart, id),
            }
        }
        info!("hub stopped");
    }

    fn dispatch_request(&mut self, msg: Multipart) {
        let (idents, msg) = match self.session.recv(&msg, true) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "dropping malformed request");
                return;
            }
        };
        let msg_type = msg.msg_type();
        debug!(%msg_type, msg_id = msg.msg_id(), "hub request");

        let reply = match msg_type {
            MsgType::RegistrationRequest => self.register_engine(&idents, &msg),
            MsgType::UnregistrationRequest => self.unregistration_request(&msg),
            MsgType::ConnectionRequest => self.connection_request(),
            MsgType::QueueRequest => msg
                .content_as::<QueueRequest>()
                .map_err(invalid)
                .and_then(|req| self.state.queue_status(&req))
                .map(|v| (v, Vec::new())),
            MsgType::ResultRequest => msg
                .content_as::<ResultRequest>()
                .map_err(invalid)
                .and_then(|req| self.state.result_status(&req)),
            MsgType::PurgeRequest => msg
                .content_as::<PurgeRequest>()
                .map_err(invalid)
                .and_then(|req| self.state.purge(&req))
                .map(|_| (json!({"status": "ok"}), Vec::new())),
            MsgType::ShutdownRequest => {
                info!("shutdown requested");
                self.stopping = true;
                Ok((json!({"status": "ok"}), Vec::new()))
            }
            other => {
                warn!(msg_type = %other, "hub ignoring unexpected message type");
                return;
            }
        };

        let (content, buffers) = match reply {
            Ok(reply) => reply,
            Err(error) => (error.to_content(), Vec::new()),
        };
        let Some(reply_type) = msg_type.reply_type() else {
            return;
        };
        if let Err(e) = self.session.send(
            &self.registrar,
            reply_type,
            content,
            buffers,
            Some(&msg.header),
            &idents,
        ) {
            warn!(error = %e, "failed to send hub reply");
        }
    }

    fn register_engine(&mut self, idents: &[Bytes], msg: &Message) -> Reply {
        let req: RegistrationRequest = msg.content_as().map_err(invalid)?;
        let queue = Bytes::from(req.queue.clone());
        let heart = Bytes::from(req.heartbeat.clone());

        let reply = match self.state.check_identities(&queue, &heart) {
            Err(reason) => {
                warn!(queue = %req.queue, %reason, "registration rejected");
                RegistrationReply::error(reason)
            }
            Ok(()) => {
                let id = self.state.next_engine_id();
                let connector = EngineConnector {
                    id,
                    queue,
                    registration: idents.first().cloned().unwrap_or_default(),
                    heartbeat: heart.clone(),
                };
                self.state.incoming.insert(heart.clone(), connector);
                info!(engine = id, queue = %req.queue, "registration pending heartbeat");

                let purge_tx = self.purge_tx.clone();
                let timeout = self.registration_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if purge_tx.send((heart, id)).is_err() {
                        debug!(engine = id, "hub stopped before registration purge");
                    }
                });

                RegistrationReply {
                    status: Status::Ok,
                    id: Some(id),
                    queue: self.addrs.engine_queue.clone(),
                    control: self.addrs.engine_control.clone(),
                    task: self.addrs.engine_task.clone(),
                    heartbeat: vec![
                        self.addrs.heartbeat_ping.clone(),
                        self.addrs.heartbeat_pong.clone(),
                    ],
                    reason: None,
                }
            }
        };
        let content = serde_json::to_value(reply)
            .map_err(|e| RemoteError::new("ValueError", e.to_string()))?;
        Ok((content, Vec::new()))
    }

    fn unregistration_request(&mut self, msg: &Message) -> Reply {
        let id = msg
            .content_value()
            .ok()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_u64)
            .ok_or_else(|| RemoteError::new("ValueError", "unregistration_request needs an id"))?;
        let id = id as EngineId;
        if !self.state.engines.contains_key(&id) {
            return Err(RemoteError::new("IndexError", format!("No such engine: {}", id)));
        }
        self.unregister_engine(id);
        Ok((json!({"status": "ok"}), Vec::new()))
    }

    fn connection_request(&self) -> Reply {
        let reply = ConnectionReply {
            status: Status::Ok,
            queue: self.addrs.client_queue.clone(),
            task: self.addrs.client_task.clone(),
            control: self.addrs.client_control.clone(),
            notification: self.addrs.notification.clone(),
            engines: self
                .state
                .engines
                .values()
                .map(|c| (c.id, c.queue_name()))
                .collect(),
        };
        let content = serde_json::to_value(reply)
            .map_err(|e| RemoteError::new("ValueError", e.to_string()))?;
        Ok((content, Vec::new()))
    }

    fn handle_new_heart(&mut self, heart: Bytes) {
        let Some(connector) = self.state.finalize(&heart) else {
            debug!(heart = %String::from_utf8_lossy(&heart), "beat from unregistered heart");
            return;
        };
        info!(engine = connector.id, queue = %connector.queue_name(), "engine registered");

        self.schedule(SchedulerCommand::AddEngine {
            id: connector.id,
            ident: connector.queue.clone(),
        });
        self.notify(
            MsgType::RegistrationNotification,
            EngineNotification {
                id: connector.id,
                queue: connector.queue_name(),
            },
        );
    }

    fn handle_heart_failure(&mut self, heart: Bytes) {
        match self.state.hearts.get(&heart).copied() {
            Some(id) => {
                warn!(engine = id, "engine heart failed");
                self.unregister_engine(id);
            }
            None => debug!(heart = %String::from_utf8_lossy(&heart), "failure of unknown heart"),
        }
    }

    fn purge_stalled_registration(&mut self, heart: Bytes, id: EngineId) {
        if self.state.incoming.get(&heart).map(|c| c.id) == Some(id) {
            self.state.incoming.remove(&heart);
            warn!(engine = id, "registration timed out before the engine's heart beat");
        }
    }

    fn unregister_engine(&mut self, id: EngineId) {
        let Some((connector, stranded)) = self.state.unregister(id) else {
            return;
        };
        info!(engine = id, stranded = stranded.len(), "engine unregistered");

        for msg_id in stranded {
            self.schedule(SchedulerCommand::Completed {
                msg_id,
                engine_id: Some(id),
                success: false,
            });
        }
        self.schedule(SchedulerCommand::RemoveEngine { id });
        self.notify(
            MsgType::UnregistrationNotification,
            EngineNotification {
                id,
                queue: connector.queue_name(),
            },
        );
    }

    fn schedule(&self, command: SchedulerCommand) {
        if let Err(e) = self.scheduler.send(command) {
            warn!(command = ?e.0, "task scheduler is gone; dropping command");
        }
    }

    fn notify(&self, msg_type: MsgType, content: EngineNotification) {
        let content = match serde_json::to_value(content) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to encode notification");
                return;
            }
        };
        if let Err(e) = self
            .session
            .send(&self.notifier, msg_type, content, Vec::new(), None, &[])
        {
            warn!(error = %e, "failed to publish notification");
        }
    }

    fn dispatch_monitor(&mut self, mut msg: Multipart) {
        let Some(switch) = msg
            .pop_ident_front()
            .and_then(|frame| MonitorSwitch::from_frame(&frame))
        else {
            warn!("monitor message without a valid switch");
            return;
        };

        if switch == MonitorSwitch::TrackTask {
            let body = msg.body();
            let (Some(engine), Some(msg_id)) = (body.first(), body.get(1)) else {
                warn!("malformed tracktask message");
                return;
            };
            let msg_id = String::from_utf8_lossy(msg_id).into_owned();
            match self.state.by_ident.get(engine).copied() {
                Some(id) => self.state.save_destination(&msg_id, id),
                None => warn!(%msg_id, "task sent to unknown engine"),
            }
            return;
        }

        let with_content = matches!(switch, MonitorSwitch::Out | MonitorSwitch::OutTask);
        let (idents, parsed) = match self.session.recv(&msg, with_content) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(?switch, error = %e, "dropping malformed monitor message");
                return;
            }
        };

        match switch {
            MonitorSwitch::In => {
                let (Some(client), Some(engine)) = (idents.first(), idents.get(1)) else {
                    return;
                };
                match self.state.by_ident.get(engine).copied() {
                    Some(id) => self.state.save_request(parsed.header, client.clone(), Some(id)),
                    None => warn!(msg_id = parsed.msg_id(), "request for unknown engine"),
                }
            }
            MonitorSwitch::InTask => {
                let client = idents.first().cloned().unwrap_or_default();
                self.state.save_request(parsed.header, client, None);
            }
            MonitorSwitch::Out => {
                let engine_hint = idents.first().and_then(|e| self.state.by_ident.get(e).copied());
                let success = parsed.status() == Some("ok");
                let msg_id = parsed.parent_msg_id().map(str::to_string);
                if let (Some(engine), Some(msg_id)) = (self.state.save_result(parsed, engine_hint), msg_id) {
                    self.schedule(SchedulerCommand::Completed {
                        msg_id,
                        engine_id: engine,
                        success,
                    });
                }
            }
            MonitorSwitch::OutTask => {
                let engine_hint = if idents.len() >= 2 {
                    self.state.by_ident.get(&idents[0]).copied()
                } else {
                    None
                };
                self.state.save_result(parsed, engine_hint);
            }
            MonitorSwitch::TrackTask => {}
        }
    }
}

fn invalid(e: parallax_common::ProtocolError) -> RemoteError {
    RemoteError::new("ValueError", e.to_string())
}
