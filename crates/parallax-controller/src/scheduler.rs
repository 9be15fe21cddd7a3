//! Load-balanced task queue.
//!
//! Clients submit `apply_request`s without naming an engine. Each task waits
//! until its `after` and `follow` dependencies are met, then goes to an
//! engine picked by the [`LoadBalancer`]. Tasks whose dependencies can never
//! be met are answered with an `UnmetDependency` error straight away.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parallax_common::transport::{FrameSink, Multipart, RouterSocket};
use parallax_common::{
    ApplyRequestContent, Dependency, DependencyMode, EngineId, EngineInfo, Header, MsgId, MsgType,
    RemoteError, Session, Status,
};

use crate::hub::MonitorSwitch;
use crate::load_balancer::{LoadBalancer, SchedulerScheme};

/// Task scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Default: [`SchedulerScheme::RoundRobin`]
    pub scheme: SchedulerScheme,
    /// Outstanding tasks allowed per engine; 0 means unlimited.
    ///
    /// Default: 0
    pub hwm: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheme: SchedulerScheme::RoundRobin,
            hwm: 0,
        }
    }
}

/// Updates the hub sends the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    AddEngine { id: EngineId, ident: Bytes },
    RemoveEngine { id: EngineId },
    /// A direct request finished; dependencies may watch it too.
    Completed {
        msg_id: MsgId,
        engine_id: Option<EngineId>,
        success: bool,
    },
}

/// A submitted task.
#[derive(Debug, Clone)]
pub struct Job {
    pub msg_id: MsgId,
    pub client: Bytes,
    pub header: Header,
    /// Frames from the delimiter on, forwarded untouched.
    pub body: Vec<Bytes>,
    pub after: Dependency,
    pub follow: Dependency,
    pub targets: Option<Vec<EngineId>>,
    pub retries: u32,
    /// Engines this task already failed on.
    pub blacklist: HashSet<Bytes>,
}

impl Job {
    pub fn new(msg_id: MsgId, client: Bytes, header: Header, body: Vec<Bytes>, content: ApplyRequestContent) -> Self {
        Self {
            msg_id,
            client,
            header,
            body,
            after: content.after.unwrap_or_default(),
            follow: content.follow.unwrap_or_default(),
            targets: content.targets,
            retries: content.retries,
            blacklist: HashSet::new(),
        }
    }
}

/// What the scheduler decided to send.
#[derive(Debug)]
pub enum Action {
    /// Hand a task to an engine.
    Submit {
        engine: Bytes,
        client: Bytes,
        msg_id: MsgId,
        body: Vec<Bytes>,
    },
    /// Pass an engine's reply on to the client.
    Forward {
        engine: Bytes,
        client: Bytes,
        body: Vec<Bytes>,
    },
    /// Answer a task with an error without running it.
    Fail {
        client: Bytes,
        parent: Header,
        error: RemoteError,
    },
}

/// Scheduling decisions, free of any I/O.
pub struct SchedulerState {
    lb: LoadBalancer,
    idents: HashMap<EngineId, Bytes>,
    ids: HashMap<Bytes, EngineId>,
    waiting: VecDeque<Job>,
    running: HashMap<Bytes, HashMap<MsgId, Job>>,
    completed: HashSet<MsgId>,
    failed: HashSet<MsgId>,
    /// Engine each finished task ran on.
    destinations: HashMap<MsgId, Bytes>,
}

impl SchedulerState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            lb: LoadBalancer::new(config.scheme, config.hwm),
            idents: HashMap::new(),
            ids: HashMap::new(),
            waiting: VecDeque::new(),
            running: HashMap::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            destinations: HashMap::new(),
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.values().map(HashMap::len).sum()
    }

    pub fn add_engine(&mut self, id: EngineId, ident: Bytes) -> Vec<Action> {
        self.lb.add_engine(ident.clone());
        self.idents.insert(id, ident.clone());
        self.ids.insert(ident, id);
        self.update()
    }

    /// Drops an engine; its running tasks are retried or failed.
    pub fn remove_engine(&mut self, id: EngineId) -> Vec<Action> {
        let Some(ident) = self.idents.remove(&id) else {
            return Vec::new();
        };
        self.ids.remove(&ident);
        self.lb.remove_engine(&ident);

        let mut actions = Vec::new();
        let stranded = self.running.remove(&ident).unwrap_or_default();
        for (_, mut job) in stranded {
            if job.retries > 0 {
                job.retries -= 1;
                job.blacklist.insert(ident.clone());
                info!(msg_id = %job.msg_id, engine = id, "resubmitting task from dead engine");
                self.waiting.push_front(job);
            } else {
                self.failed.insert(job.msg_id.clone());
                let error = RemoteError::engine_died(id, &job.msg_id).with_engine_info(EngineInfo {
                    engine_id: Some(id),
                    engine_ident: String::from_utf8_lossy(&ident).into_owned(),
                    method: "apply".to_string(),
                });
                actions.push(Action::Fail {
                    client: job.client,
                    parent: job.header,
                    error,
                });
            }
        }
        actions.extend(self.update());
        actions
    }

    pub fn submit(&mut self, job: Job) -> Vec<Action> {
        self.waiting.push_back(job);
        self.update()
    }

    /// Handles an engine's reply to a task.
    pub fn handle_result(
        &mut self,
        engine: Bytes,
        client: Bytes,
        msg_id: &str,
        status: Option<Status>,
        body: Vec<Bytes>,
    ) -> Vec<Action> {
        self.lb.release(&engine);
        let job = self
            .running
            .get_mut(&engine)
            .and_then(|jobs| jobs.remove(msg_id));

        if let Some(mut job) = job {
            if status == Some(Status::Error) && job.retries > 0 {
                job.retries -= 1;
                job.blacklist.insert(engine.clone());
                info!(msg_id, retries_left = job.retries, "task failed, resubmitting");
                self.waiting.push_front(job);
                return self.update();
            }
        } else {
            debug!(msg_id, "result for untracked task");
        }

        if status == Some(Status::Ok) {
            self.completed.insert(msg_id.to_string());
        } else {
            self.failed.insert(msg_id.to_string());
        }
        self.destinations.insert(msg_id.to_string(), engine.clone());

        let mut actions = vec![Action::Forward {
            engine,
            client,
            body,
        }];
        actions.extend(self.update());
        actions
    }

    /// Records a direct request's completion.
    pub fn record_completion(&mut self, msg_id: MsgId, engine_id: Option<EngineId>, success: bool) -> Vec<Action> {
        if let Some(ident) = engine_id.and_then(|id| self.idents.get(&id)) {
            self.destinations.insert(msg_id.clone(), ident.clone());
        }
        if success {
            self.completed.insert(msg_id);
        } else {
            self.failed.insert(msg_id);
        }
        self.update()
    }

    /// Runs or fails every waiting task that can be decided now.
    fn update(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let failed_before = self.failed.len();
            let mut still_waiting = VecDeque::with_capacity(self.waiting.len());

            while let Some(job) = self.waiting.pop_front() {
                if let Some(reason) = self.unreachable_reason(&job) {
                    warn!(msg_id = %job.msg_id, %reason, "task can never run");
                    self.failed.insert(job.msg_id.clone());
                    let error = RemoteError::unmet_dependency(&job.msg_id, reason);
                    actions.push(Action::Fail {
                        client: job.client,
                        parent: job.header,
                        error,
                    });
                    continue;
                }

                if !job.after.check(&self.completed, &self.failed)
                    || !job.follow.check(&self.completed, &self.failed)
                {
                    still_waiting.push_back(job);
                    continue;
                }

                match self.choose_engine(&job) {
                    Some(engine) => {
                        self.lb.add_load(&engine);
                        actions.push(Action::Submit {
                            engine: engine.clone(),
                            client: job.client.clone(),
                            msg_id: job.msg_id.clone(),
                            body: job.body.clone(),
                        });
                        self.running
                            .entry(engine)
                            .or_default()
                            .insert(job.msg_id.clone(), job);
                    }
                    None => still_waiting.push_back(job),
                }
            }

            self.waiting = still_waiting;
            // New failures can make other waiting tasks unreachable.
            if self.failed.len() == failed_before {
                break;
            }
        }
        actions
    }

    fn unreachable_reason(&self, job: &Job) -> Option<String> {
        if job.after.unreachable(&self.failed) {
            return Some("time dependency can never be met".to_string());
        }
        if job.follow.unreachable(&self.failed) {
            return Some("location dependency can never be met".to_string());
        }

        if let Some(targets) = &job.targets {
            if !targets.iter().any(|id| self.idents.contains_key(id)) {
                return Some(format!("no registered engine among targets {:?}", targets));
            }
        }

        if job.follow.check(&self.completed, &self.failed) {
            if let Some(location) = self.location(&job.follow) {
                if !location.iter().any(|e| self.lb.contains(e)) {
                    return Some("followed tasks did not run on a common live engine".to_string());
                }
            }
        }
        None
    }

    /// Engines a task following `follow` may run on, or `None` for anywhere.
    fn location(&self, follow: &Dependency) -> Option<HashSet<Bytes>> {
        if follow.is_empty() {
            return None;
        }
        let ran_on = follow
            .ids
            .iter()
            .filter_map(|id| self.destinations.get(id).cloned());

        Some(match follow.mode {
            DependencyMode::Any => ran_on.collect(),
            DependencyMode::All => {
                let engines: HashSet<Bytes> = ran_on.collect();
                if engines.len() == 1 {
                    engines
                } else {
                    HashSet::new()
                }
            }
        })
    }

    fn choose_engine(&mut self, job: &Job) -> Option<Bytes> {
        let targets: Option<HashSet<Bytes>> = job.targets.as_ref().map(|ids| {
            ids.iter()
                .filter_map(|id| self.idents.get(id).cloned())
                .collect()
        });
        let location = self.location(&job.follow);

        let eligible = |e: &Bytes| {
            targets.as_ref().map_or(true, |t| t.contains(e))
                && location.as_ref().map_or(true, |l| l.contains(e))
        };

        // Prefer an engine the task has not failed on.
        let fresh_exists = self
            .lb
            .engines()
            .iter()
            .any(|e| eligible(e) && !job.blacklist.contains(e));
        if fresh_exists {
            self.lb
                .next_engine(|e| eligible(e) && !job.blacklist.contains(e))
        } else {
            self.lb.next_engine(eligible)
        }
    }
}

/// The scheduler task: a client-facing router, an engine-facing router and
/// a [`SchedulerState`].
pub struct TaskScheduler {
    session: Session,
    client_side: RouterSocket,
    engine_side: RouterSocket,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    monitor: mpsc::UnboundedSender<Multipart>,
    state: SchedulerState,
}

impl TaskScheduler {
    pub fn new(
        session: Session,
        client_side: RouterSocket,
        engine_side: RouterSocket,
        commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        monitor: mpsc::UnboundedSender<Multipart>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            session,
            client_side,
            engine_side,
            commands,
            monitor,
            state: SchedulerState::new(&config),
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        loop {
            let actions = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                msg = self.client_side.recv() => match msg {
                    Some(msg) => self.dispatch_submission(msg),
                    None => break,
                },
                msg = self.engine_side.recv() => match msg {
                    Some(msg) => self.dispatch_result(msg),
                    None => break,
                },
            };
            self.perform(actions);
        }
        debug!("task scheduler stopped");
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) -> Vec<Action> {
        match cmd {
            SchedulerCommand::AddEngine { id, ident } => {
                info!(engine = id, "scheduler adding engine");
                self.state.add_engine(id, ident)
            }
            SchedulerCommand::RemoveEngine { id } => {
                info!(engine = id, "scheduler removing engine");
                self.state.remove_engine(id)
            }
            SchedulerCommand::Completed {
                msg_id,
                engine_id,
                success,
            } => self.state.record_completion(msg_id, engine_id, success),
        }
    }

    fn dispatch_submission(&mut self, msg: Multipart) -> Vec<Action> {
        let (idents, parsed) = match self.session.recv(&msg, true) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "dropping malformed task submission");
                return Vec::new();
            }
        };
        let Some(client) = idents.first().cloned() else {
            return Vec::new();
        };
        if parsed.msg_type() != MsgType::ApplyRequest {
            warn!(msg_type = %parsed.msg_type(), "task queue only accepts apply_request");
            return Vec::new();
        }

        let mut copy = msg.clone();
        copy.push_ident_front(MonitorSwitch::InTask.as_frame());
        self.report(copy);

        let body = msg.body().to_vec();
        match parsed.content_as::<ApplyRequestContent>() {
            Ok(content) => {
                let job = Job::new(parsed.header.msg_id.clone(), client, parsed.header, body, content);
                self.state.submit(job)
            }
            Err(e) => vec![Action::Fail {
                client,
                parent: parsed.header,
                error: RemoteError::new("ValueError", e.to_string()),
            }],
        }
    }

    fn dispatch_result(&mut self, msg: Multipart) -> Vec<Action> {
        if msg.ident_count < 2 {
            warn!("dropping task result without a client identity");
            return Vec::new();
        }
        let (_, parsed) = match self.session.recv(&msg, true) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "dropping malformed task result");
                return Vec::new();
            }
        };
        let Some(msg_id) = parsed.parent_msg_id().map(str::to_string) else {
            warn!("task result has no parent header");
            return Vec::new();
        };
        let status = parsed
            .status()
            .and_then(|s| serde_json::from_value::<Status>(serde_json::Value::from(s)).ok());

        let engine = msg.frames[0].clone();
        let client = msg.frames[1].clone();
        self.state
            .handle_result(engine, client, &msg_id, status, msg.body().to_vec())
    }

    /// Copies traffic to the hub's monitor channel.
    fn report(&self, msg: Multipart) {
        if self.monitor.send(msg).is_err() {
            warn!("hub monitor channel closed; bookkeeping copy dropped");
        }
    }

    fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            let result = match action {
                Action::Submit {
                    engine,
                    client,
                    msg_id,
                    body,
                } => {
                    let track = Multipart::new(
                        vec![MonitorSwitch::TrackTask.as_frame()],
                        vec![engine.clone(), Bytes::from(msg_id)],
                    );
                    self.report(track);
                    self.engine_side
                        .handle()
                        .send_multipart(Multipart::new(vec![engine, client], body))
                }
                Action::Forward {
                    engine,
                    client,
                    body,
                } => {
                    self.report(Multipart::new(
                        vec![MonitorSwitch::OutTask.as_frame(), engine.clone(), client.clone()],
                        body.clone(),
                    ));
                    self.client_side
                        .handle()
                        .send_multipart(Multipart::new(vec![client, engine], body))
                }
                Action::Fail {
                    client,
                    parent,
                    error,
                } => {
                    let reply = self
                        .session
                        .msg(MsgType::ApplyReply, error.to_content(), Some(&parent));
                    self.session
                        .send_message(&self.monitor, &reply, &[MonitorSwitch::OutTask.as_frame(), client.clone()])
                        .and_then(|_| {
                            self.session
                                .send_message(&self.client_side.handle(), &reply, &[client])
                        })
                }
            };
            if let Err(e) = result {
                warn!(error = %e, "scheduler send failed");
            }
        }
    }
}
