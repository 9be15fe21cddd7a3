use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use parallax_common::transport::{DealerHandle, DealerSocket, Multipart};
use parallax_common::{
    ApplyRequestContent, CanningConfig, EngineId, EngineInfo, FunctionRegistry, Header, Message,
    MsgId, MsgType, ParallelError, RegistrationReply, RegistrationRequest, RemoteError, Result,
    Session, SessionConfig, Status,
};

use crate::executor::Executor;
use crate::heart::{Heart, HeartHandle};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The controller's registration address.
    ///
    /// Default: 127.0.0.1:10101
    pub registration_addr: String,
    /// Queue identity; a fresh uuid when unset.
    pub ident: Option<String>,
    /// How long to wait for the registration reply.
    ///
    /// Default: 10s
    pub registration_timeout: Duration,
    pub session: SessionConfig,
    pub canning: CanningConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registration_addr: "127.0.0.1:10101".to_string(),
            ident: None,
            registration_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
            canning: CanningConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Queue,
    Task,
}

/// Most aborted ids remembered at once; the oldest is forgotten first.
const MAX_ABORTED: usize = 1024;

/// Ids to answer as aborted when their request arrives.
#[derive(Debug, Default)]
struct AbortList {
    ids: HashSet<MsgId>,
    order: VecDeque<MsgId>,
}

impl AbortList {
    fn insert(&mut self, msg_id: MsgId) {
        if !self.ids.insert(msg_id.clone()) {
            return;
        }
        self.order.push_back(msg_id);
        while self.order.len() > MAX_ABORTED {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    /// Removes `msg_id`, returning whether it was aborted.
    fn take(&mut self, msg_id: &str) -> bool {
        if !self.ids.remove(msg_id) {
            return false;
        }
        self.order.retain(|id| id != msg_id);
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

struct Running {
    stream: Stream,
    idents: Vec<Bytes>,
    header: Header,
    handle: JoinHandle<std::result::Result<Vec<Bytes>, RemoteError>>,
}

type Finished = (Running, std::result::Result<std::result::Result<Vec<Bytes>, RemoteError>, JoinError>);

/// A registered engine.
///
/// Requests arrive on two streams: direct requests from the queue relay and
/// load-balanced tasks from the scheduler. One request runs at a time, on
/// the blocking pool. Control messages are handled first, even while a
/// request is running.
pub struct Engine {
    id: EngineId,
    ident: Bytes,
    session: Session,
    executor: Executor,
    registration: DealerHandle,
    registration_rx: mpsc::UnboundedReceiver<Multipart>,
    queue: DealerHandle,
    queue_rx: mpsc::UnboundedReceiver<Multipart>,
    task: DealerHandle,
    task_rx: mpsc::UnboundedReceiver<Multipart>,
    control: DealerHandle,
    control_rx: mpsc::UnboundedReceiver<Multipart>,
    heart: Option<HeartHandle>,
    aborted: AbortList,
    /// Stream the last request came from; the other one is polled first next.
    last_served: Stream,
    running: Option<Running>,
}

impl Engine {
    /// Registers with the controller, connects every channel and starts the
    /// heart.
    ///
    /// A rejected registration is returned as [`ParallelError::Registration`].
    pub async fn start(config: EngineConfig, registry: FunctionRegistry) -> Result<Self> {
        let session = Session::new(config.session.clone());
        let ident = Bytes::from(
            config
                .ident
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        let heart_ident = Bytes::from(uuid::Uuid::new_v4().to_string());
        // Separate from the queue identity so a colliding queue name still
        // reaches the controller and gets an error reply.
        let registration_ident = Bytes::from(uuid::Uuid::new_v4().to_string());

        let (registration, mut registration_rx) =
            DealerSocket::connect(&config.registration_addr, registration_ident)
                .await?
                .into_parts();

        let request = RegistrationRequest {
            queue: String::from_utf8_lossy(&ident).into_owned(),
            heartbeat: String::from_utf8_lossy(&heart_ident).into_owned(),
        };
        session.send(
            &registration,
            MsgType::RegistrationRequest,
            serde_json::to_value(&request)?,
            Vec::new(),
            None,
            &[],
        )?;

        let reply = tokio::time::timeout(config.registration_timeout, registration_rx.recv())
            .await
            .map_err(|_| ParallelError::Timeout(config.registration_timeout.as_millis() as u64))?
            .ok_or_else(|| ParallelError::Connection("controller closed the registration channel".to_string()))?;
        let (_, reply) = session.recv(&reply, true)?;
        let reply: RegistrationReply = reply.content_as()?;

        if reply.status != Status::Ok {
            let reason = reply.reason.unwrap_or_else(|| "registration rejected".to_string());
            error!(%reason, "registration failed");
            return Err(ParallelError::Registration(reason));
        }
        let id = reply
            .id
            .ok_or_else(|| ParallelError::InvalidResponse("registration reply has no id".to_string()))?;
        let (ping_addr, pong_addr) = match reply.heartbeat.as_slice() {
            [ping, pong] => (ping.clone(), pong.clone()),
            _ => {
                return Err(ParallelError::InvalidResponse(
                    "registration reply needs two heartbeat addresses".to_string(),
                ))
            }
        };

        let (queue, queue_rx) = DealerSocket::connect(&reply.queue, ident.clone()).await?.into_parts();
        let (task, task_rx) = DealerSocket::connect(&reply.task, ident.clone()).await?.into_parts();
        let (control, control_rx) = DealerSocket::connect(&reply.control, ident.clone()).await?.into_parts();
        let heart = Heart::new(ping_addr, pong_addr, heart_ident).start().await?;

        let engine_info = EngineInfo {
            engine_id: Some(id),
            engine_ident: request.queue.clone(),
            method: "apply".to_string(),
        };
        info!(engine = id, ident = %request.queue, "engine registered");

        Ok(Self {
            id,
            ident,
            session,
            executor: Executor::new(registry, config.canning, engine_info),
            registration,
            registration_rx,
            queue,
            queue_rx,
            task,
            task_rx,
            control,
            control_rx,
            heart: Some(heart),
            aborted: AbortList::default(),
            last_served: Stream::Task,
            running: None,
        })
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn ident(&self) -> &Bytes {
        &self.ident
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Serves requests until a `shutdown_request` arrives or the controller
    /// goes away, then unregisters.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                msg = self.control_rx.recv() => match msg {
                    Some(msg) => {
                        if self.dispatch_control(msg) {
                            break;
                        }
                    }
                    None => break,
                },
                done = wait_running(&mut self.running), if self.running.is_some() => {
                    if let Some(done) = done {
                        self.finish(done);
                    }
                }
                (stream, msg) = next_request(&mut self.queue_rx, &mut self.task_rx, self.last_served),
                    if self.running.is_none() => match msg {
                    Some(msg) => {
                        self.last_served = stream;
                        self.dispatch_apply(stream, msg);
                    }
                    None => break,
                },
            }
        }
        self.unregister().await;
        Ok(())
    }

    fn sink(&self, stream: Stream) -> &DealerHandle {
        match stream {
            Stream::Queue => &self.queue,
            Stream::Task => &self.task,
        }
    }

    fn dispatch_apply(&mut self, stream: Stream, msg: Multipart) {
        let (idents, msg) = match self.session.recv(&msg, true) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(engine = self.id, error = %e, "dropping malformed request");
                return;
            }
        };
        if msg.msg_type() != MsgType::ApplyRequest {
            warn!(engine = self.id, msg_type = %msg.msg_type(), "unexpected message on request stream");
            return;
        }
        let msg_id = msg.msg_id().to_string();

        if self.aborted.take(&msg_id) {
            info!(engine = self.id, %msg_id, "request aborted");
            let error = self.executor.error(RemoteError::ABORTED, format!("task {} aborted", msg_id));
            let mut content = error.to_content();
            content["status"] = json!(Status::Aborted);
            self.reply(stream, &idents, &msg.header, content, Vec::new());
            return;
        }

        let content: ApplyRequestContent = match msg.content_as() {
            Ok(content) => content,
            Err(e) => {
                let error = self.executor.error("ValueError", e.to_string());
                self.reply(stream, &idents, &msg.header, error.to_content(), Vec::new());
                return;
            }
        };

        debug!(engine = self.id, %msg_id, ?stream, "running request");
        let executor = self.executor.clone();
        let Message { header, buffers, .. } = msg;
        let handle = tokio::task::spawn_blocking(move || executor.execute(&content, buffers));
        self.running = Some(Running {
            stream,
            idents,
            header,
            handle,
        });
    }

    fn finish(&mut self, (running, result): Finished) {
        let (content, buffers) = match result {
            Ok(Ok(buffers)) => (
                json!({"status": "ok", "engine_info": self.executor.engine_info()}),
                buffers,
            ),
            Ok(Err(error)) => (error.to_content(), Vec::new()),
            Err(e) => {
                error!(engine = self.id, msg_id = %running.header.msg_id, error = %e, "request panicked");
                let error = self.executor.error("RuntimeError", format!("task panicked: {}", e));
                (error.to_content(), Vec::new())
            }
        };
        self.reply(running.stream, &running.idents, &running.header, content, buffers);
    }

    fn reply(&self, stream: Stream, idents: &[Bytes], parent: &Header, content: Value, buffers: Vec<Bytes>) {
        if let Err(e) = self.session.send(
            self.sink(stream),
            MsgType::ApplyReply,
            content,
            buffers,
            Some(parent),
            idents,
        ) {
            warn!(engine = self.id, error = %e, "failed to send reply");
        }
    }

    /// Returns true when the engine should stop.
    fn dispatch_control(&mut self, msg: Multipart) -> bool {
        let (idents, msg) = match self.session.recv(&msg, true) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(engine = self.id, error = %e, "dropping malformed control message");
                return false;
            }
        };

        let msg_type = msg.msg_type();
        let mut stop = false;
        let content = match msg_type {
            MsgType::AbortRequest => {
                let ids: Vec<MsgId> = msg
                    .content_value()
                    .ok()
                    .and_then(|v| v.get("msg_ids"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let running = self.running.as_ref().map(|r| r.header.msg_id.clone());
                for id in ids {
                    // The running request is past the point of aborting.
                    if running.as_deref() != Some(id.as_str()) {
                        self.aborted.insert(id);
                    }
                }
                info!(engine = self.id, pending_aborts = self.aborted.len(), "aborting requests");
                json!({"status": "ok"})
            }
            MsgType::ClearRequest => {
                info!(engine = self.id, "clearing namespace");
                self.executor.clear();
                json!({"status": "ok"})
            }
            MsgType::ShutdownRequest => {
                info!(engine = self.id, "shutdown requested");
                stop = true;
                json!({"status": "ok"})
            }
            other => {
                warn!(engine = self.id, msg_type = %other, "unexpected control message");
                return false;
            }
        };

        if let Some(reply_type) = msg_type.reply_type() {
            if let Err(e) =
                self.session
                    .send(&self.control, reply_type, content, Vec::new(), Some(&msg.header), &idents)
            {
                warn!(engine = self.id, error = %e, "failed to send control reply");
            }
        }
        stop
    }

    async fn unregister(&mut self) {
        let sent = self.session.send(
            &self.registration,
            MsgType::UnregistrationRequest,
            json!({"id": self.id}),
            Vec::new(),
            None,
            &[],
        );
        if sent.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(1), self.registration_rx.recv()).await;
        }
        if let Some(heart) = self.heart.take() {
            heart.stop();
        }
        info!(engine = self.id, "engine stopped");
    }
}

/// Waits for the next request, polling the stream `last` did not serve first.
async fn next_request(
    queue: &mut mpsc::UnboundedReceiver<Multipart>,
    task: &mut mpsc::UnboundedReceiver<Multipart>,
    last: Stream,
) -> (Stream, Option<Multipart>) {
    match last {
        Stream::Queue => tokio::select! {
            biased;
            msg = task.recv() => (Stream::Task, msg),
            msg = queue.recv() => (Stream::Queue, msg),
        },
        Stream::Task => tokio::select! {
            biased;
            msg = queue.recv() => (Stream::Queue, msg),
            msg = task.recv() => (Stream::Task, msg),
        },
    }
}

async fn wait_running(running: &mut Option<Running>) -> Option<Finished> {
    let result = match running.as_mut() {
        Some(r) => (&mut r.handle).await,
        None => return None,
    };
    running.take().map(|r| (r, result))
}
