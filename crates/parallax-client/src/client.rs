use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use parallax_common::transport::{DealerHandle, DealerSocket, SubSocket};
use parallax_common::{
    pack_apply_message, ApplyRequestContent, CanningConfig, ConnectionReply, Dependency, EngineId,
    FunctionRef, Message, MsgId, MsgType, Object, ParallelError, PurgeRequest, PurgeTarget,
    QueueRequest, ResultRequest, Result, Session, SessionConfig, Status, BUILTIN_MODULE,
};

use crate::async_result::{remote_error, AsyncResult};
use crate::state::{receive, Inbound, Shared};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The controller's registration address.
    ///
    /// Default: 127.0.0.1:10101
    pub registration_addr: String,
    /// How long to wait for replies to controller and control requests.
    ///
    /// Default: 10s
    pub request_timeout: Duration,
    pub session: SessionConfig,
    pub canning: CanningConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registration_addr: "127.0.0.1:10101".to_string(),
            request_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
            canning: CanningConfig::default(),
        }
    }
}

/// How an `apply` call is routed and waited on.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Run against the engine's persistent namespace.
    pub bound: bool,
    /// Wait for the replies before returning.
    pub block: bool,
    /// Engines to run on. `None` goes through the load-balanced task queue.
    pub targets: Option<Vec<EngineId>>,
    /// Send through the task queue even when `targets` is set, restricting
    /// placement to those engines.
    pub balanced: bool,
    /// Do not start before these tasks finish. Task queue only.
    pub after: Option<Dependency>,
    /// Run where these tasks ran. Task queue only.
    pub follow: Option<Dependency>,
    /// Resubmissions allowed after a failure. Task queue only.
    pub retries: u32,
}

impl ApplyOptions {
    pub fn blocking() -> Self {
        Self {
            block: true,
            ..Self::default()
        }
    }

    pub fn on(targets: Vec<EngineId>) -> Self {
        Self {
            targets: Some(targets),
            ..Self::default()
        }
    }
}

struct Sockets {
    registration: DealerHandle,
    queue: DealerHandle,
    task: DealerHandle,
    control: DealerHandle,
}

struct Inner {
    session: Session,
    config: ClientConfig,
    sockets: Sockets,
    shared: Arc<Shared>,
    receiver: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Connection to a Parallax cluster.
///
/// Cheap to clone; clones share one set of connections.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Asks the controller for its addresses and connects to all of them.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let session = Session::new(config.session.clone());
        let identity = Bytes::from(uuid::Uuid::new_v4().to_string());

        let (registration, mut registration_rx) =
            DealerSocket::connect(&config.registration_addr, identity.clone())
                .await?
                .into_parts();
        session.send(
            &registration,
            MsgType::ConnectionRequest,
            json!({}),
            Vec::new(),
            None,
            &[],
        )?;
        let reply = tokio::time::timeout(config.request_timeout, registration_rx.recv())
            .await
            .map_err(|_| ParallelError::Timeout(config.request_timeout.as_millis() as u64))?
            .ok_or_else(|| ParallelError::Connection("controller closed the connection".to_string()))?;
        let (_, reply) = session.recv(&reply, true)?;
        let reply: ConnectionReply = reply.content_as()?;
        if reply.status != Status::Ok {
            return Err(ParallelError::Connection("connection request refused".to_string()));
        }

        let (queue, queue_rx) = DealerSocket::connect(&reply.queue, identity.clone()).await?.into_parts();
        let (task, task_rx) = DealerSocket::connect(&reply.task, identity.clone()).await?.into_parts();
        let (control, control_rx) = DealerSocket::connect(&reply.control, identity.clone()).await?.into_parts();
        let notification = SubSocket::connect(&reply.notification, identity).await?;

        let shared = Arc::new(Shared::default());
        shared.lock().engines = reply
            .engines
            .into_iter()
            .map(|(id, queue)| (id, Bytes::from(queue)))
            .collect();

        let receiver = tokio::spawn(receive(
            session.clone(),
            shared.clone(),
            Inbound {
                registration: registration_rx,
                queue: queue_rx,
                task: task_rx,
                control: control_rx,
                notification,
            },
        ));
        info!(controller = %config.registration_addr, "client connected");

        Ok(Self {
            inner: Arc::new(Inner {
                session,
                config,
                sockets: Sockets {
                    registration,
                    queue,
                    task,
                    control,
                },
                shared,
                receiver,
            }),
        })
    }

    /// Registered engine ids.
    pub fn ids(&self) -> Vec<EngineId> {
        self.inner.shared.lock().engines.keys().copied().collect()
    }

    /// Waits until at least `count` engines are registered.
    pub async fn wait_for_engines(&self, count: usize, timeout: Duration) -> bool {
        self.inner
            .shared
            .wait_until(Some(timeout), |state| state.engines.len() >= count)
            .await
    }

    /// Calls `f(*args, **kwargs)` on the cluster.
    ///
    /// Without targets the call goes through the load-balanced task queue.
    /// With targets it is sent straight to each engine, producing one msg_id
    /// per engine.
    pub async fn apply(
        &self,
        f: &FunctionRef,
        args: Vec<Object>,
        kwargs: BTreeMap<String, Object>,
        options: ApplyOptions,
    ) -> Result<AsyncResult> {
        let (buffers, info) = pack_apply_message(f, &args, &kwargs, &self.inner.config.canning)?;

        let msg_ids = match (&options.targets, options.balanced) {
            (Some(targets), false) => {
                let content = ApplyRequestContent {
                    bound: options.bound,
                    info,
                    after: None,
                    follow: None,
                    targets: None,
                    retries: 0,
                };
                let engines = targets
                    .iter()
                    .map(|&target| self.engine_ident(target).map(|ident| (target, ident)))
                    .collect::<Result<Vec<_>>>()?;
                engines
                    .into_iter()
                    .map(|engine| self.submit(&content, &buffers, Some(engine)))
                    .collect::<Result<Vec<_>>>()?
            }
            _ => {
                let content = ApplyRequestContent {
                    bound: options.bound,
                    info,
                    after: options.after.clone(),
                    follow: options.follow.clone(),
                    targets: options.targets.clone(),
                    retries: options.retries,
                };
                vec![self.submit(&content, &buffers, None)?]
            }
        };
        debug!(function = %f.qualified_name(), ?msg_ids, "applied");

        let result = AsyncResult::new(msg_ids, self.inner.shared.clone());
        if options.block {
            result.wait(None).await;
        }
        Ok(result)
    }

    fn engine_ident(&self, id: EngineId) -> Result<Bytes> {
        self.inner
            .shared
            .lock()
            .engines
            .get(&id)
            .cloned()
            .ok_or(ParallelError::NoSuchEngine(id))
    }

    /// Sends one apply request, directly when `engine` is given.
    fn submit(
        &self,
        content: &ApplyRequestContent,
        buffers: &[Bytes],
        engine: Option<(EngineId, Bytes)>,
    ) -> Result<MsgId> {
        let mut msg = self.inner.session.msg(
            MsgType::ApplyRequest,
            serde_json::to_value(content)?,
            None,
        );
        msg.buffers = buffers.to_vec();
        let msg_id = msg.msg_id().to_string();

        // Track before sending so a fast reply cannot be missed.
        {
            let mut state = self.inner.shared.lock();
            state.outstanding.insert(msg_id.clone());
            if let Some((id, _)) = &engine {
                state.direct.insert(msg_id.clone(), *id);
            }
        }

        let sent = match &engine {
            Some((_, ident)) => self.inner.session.send_message(
                &self.inner.sockets.queue,
                &msg,
                std::slice::from_ref(ident),
            ),
            None => self.inner.session.send_message(&self.inner.sockets.task, &msg, &[]),
        };
        if let Err(e) = sent {
            let mut state = self.inner.shared.lock();
            state.outstanding.remove(&msg_id);
            state.direct.remove(&msg_id);
            return Err(e);
        }
        Ok(msg_id)
    }

    /// Waits until none of `msg_ids` is outstanding. Returns false on timeout.
    pub async fn barrier(&self, msg_ids: &[MsgId], timeout: Option<Duration>) -> bool {
        self.inner
            .shared
            .wait_until(timeout, |state| {
                msg_ids.iter().all(|id| !state.outstanding.contains(id))
            })
            .await
    }

    /// Merges `values` into the namespace of each target engine.
    pub async fn push(
        &self,
        values: BTreeMap<String, Object>,
        targets: Option<Vec<EngineId>>,
        block: bool,
    ) -> Result<AsyncResult> {
        let targets = targets.unwrap_or_else(|| self.ids());
        self.apply(
            &FunctionRef::new(BUILTIN_MODULE, "push"),
            vec![Object::Dict(values)],
            BTreeMap::new(),
            ApplyOptions {
                bound: true,
                block,
                targets: Some(targets),
                ..ApplyOptions::default()
            },
        )
        .await
    }

    /// Reads names from each target engine's namespace. One name yields the
    /// value, several yield a list.
    pub async fn pull(
        &self,
        names: &[&str],
        targets: Option<Vec<EngineId>>,
        block: bool,
    ) -> Result<AsyncResult> {
        let arg = match names {
            [name] => Object::Str(name.to_string()),
            _ => Object::List(names.iter().map(|n| Object::Str(n.to_string())).collect()),
        };
        let targets = targets.unwrap_or_else(|| self.ids());
        self.apply(
            &FunctionRef::new(BUILTIN_MODULE, "pull"),
            vec![arg],
            BTreeMap::new(),
            ApplyOptions {
                bound: true,
                block,
                targets: Some(targets),
                ..ApplyOptions::default()
            },
        )
        .await
    }

    /// Asks engines to answer the listed requests as aborted instead of
    /// running them.
    pub async fn abort(&self, msg_ids: &[MsgId], targets: Option<Vec<EngineId>>) -> Result<()> {
        self.control_all(MsgType::AbortRequest, json!({"msg_ids": msg_ids}), targets)
            .await
    }

    /// Resets the namespace of each target engine.
    pub async fn clear(&self, targets: Option<Vec<EngineId>>) -> Result<()> {
        self.control_all(MsgType::ClearRequest, json!({}), targets).await
    }

    /// Stops the target engines and, if `controller` is set, the controller.
    pub async fn shutdown(&self, targets: Option<Vec<EngineId>>, controller: bool) -> Result<()> {
        self.control_all(MsgType::ShutdownRequest, json!({}), targets)
            .await?;
        if controller {
            self.hub_request(MsgType::ShutdownRequest, json!({})).await?;
        }
        Ok(())
    }

    pub async fn queue_status(&self, targets: Option<Vec<EngineId>>, verbose: bool) -> Result<Value> {
        let request = QueueRequest { targets, verbose };
        self.hub_request(MsgType::QueueRequest, serde_json::to_value(request)?)
            .await
            .map(|reply| reply.0)
    }

    /// The controller's view of `msg_ids`: `pending` and `completed` lists
    /// plus, unless `status_only`, each completed reply's content.
    pub async fn result_status(&self, msg_ids: &[MsgId], status_only: bool) -> Result<Value> {
        let request = ResultRequest {
            msg_ids: msg_ids.to_vec(),
            status_only,
        };
        self.hub_request(MsgType::ResultRequest, serde_json::to_value(request)?)
            .await
            .map(|reply| reply.0)
    }

    /// Drops results stored on the controller.
    pub async fn purge_results(&self, msg_ids: PurgeTarget, engine_ids: Vec<EngineId>) -> Result<()> {
        let request = PurgeRequest { msg_ids, engine_ids };
        self.hub_request(MsgType::PurgeRequest, serde_json::to_value(request)?)
            .await
            .map(|_| ())
    }

    async fn hub_request(&self, msg_type: MsgType, content: Value) -> Result<(Value, Message)> {
        let sink = &self.inner.sockets.registration;
        let msg = self.inner.session.send(sink, msg_type, content, Vec::new(), None, &[])?;
        let reply = self.await_reply(msg.msg_id()).await?;
        Ok((reply.content_value()?.clone(), reply))
    }

    async fn control_all(
        &self,
        msg_type: MsgType,
        content: Value,
        targets: Option<Vec<EngineId>>,
    ) -> Result<()> {
        let targets = targets.unwrap_or_else(|| self.ids());
        let mut sent = Vec::with_capacity(targets.len());
        for target in targets {
            let ident = self.engine_ident(target)?;
            let msg = self.inner.session.send(
                &self.inner.sockets.control,
                msg_type,
                content.clone(),
                Vec::new(),
                None,
                &[ident],
            )?;
            sent.push(msg.msg_id().to_string());
        }
        for msg_id in sent {
            self.await_reply(&msg_id).await?;
        }
        Ok(())
    }

    /// Waits for the reply to `msg_id`, turning an error status into
    /// [`ParallelError::Remote`].
    async fn await_reply(&self, msg_id: &str) -> Result<Message> {
        let timeout = self.inner.config.request_timeout;
        let arrived = self
            .inner
            .shared
            .wait_until(Some(timeout), |state| state.replies.contains_key(msg_id))
            .await;
        let reply = self.inner.shared.lock().replies.remove(msg_id);
        let reply = match (arrived, reply) {
            (true, Some(reply)) => reply,
            _ => return Err(ParallelError::Timeout(timeout.as_millis() as u64)),
        };
        match reply.status() {
            Some("ok") => Ok(reply),
            Some(_) => Err(remote_error(reply.content_value()?).into()),
            None => Err(ParallelError::InvalidResponse(format!(
                "{} has no status",
                reply.msg_type()
            ))),
        }
    }
}
