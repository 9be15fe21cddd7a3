use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use parallax_common::transport::{PubSocket, RouterSocket};
use parallax_common::{Result, Session, SessionConfig};

use crate::heartbeat::{HeartMonitor, HeartbeatConfig};
use crate::hub::{Hub, HubAddresses, HubChannels};
use crate::relay::Relay;
use crate::scheduler::{SchedulerConfig, TaskScheduler};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interface every socket binds to.
    ///
    /// Default: 127.0.0.1
    pub ip: String,
    /// Port of the registration channel, the one address engines and
    /// clients need up front. Every other socket takes a free port.
    ///
    /// Default: 0 (any free port)
    pub port: u16,
    pub heartbeat: HeartbeatConfig,
    pub scheduler: SchedulerConfig,
    pub session: SessionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 0,
            heartbeat: HeartbeatConfig::default(),
            scheduler: SchedulerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// A running controller.
///
/// The controller is a set of tasks: the hub, the heart monitor, the direct
/// and control relays and the task scheduler. They share one registration
/// address; everything else is handed out in registration and connection
/// replies.
pub struct Controller {
    registration_addr: SocketAddr,
    hub: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Binds every socket and starts all controller tasks.
    ///
    /// # Example
    /// ```no_run
    /// # use parallax_controller::{Controller, ControllerConfig};
    /// # #[tokio::main]
    /// # async fn main() -> parallax_common::Result<()> {
    /// let controller = Controller::start(ControllerConfig::default()).await?;
    /// println!("engines and clients connect to {}", controller.registration_addr());
    /// controller.wait().await;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(config: ControllerConfig) -> Result<Self> {
        let session = Session::new(config.session.clone());
        let bind = |port: u16| format!("{}:{}", config.ip, port);

        let registrar = RouterSocket::bind(&bind(config.port)).await?;
        let notifier = PubSocket::bind(&bind(0)).await?;
        let ping = PubSocket::bind(&bind(0)).await?;
        let pong = RouterSocket::bind(&bind(0)).await?;
        let mux_clients = RouterSocket::bind(&bind(0)).await?;
        let mux_engines = RouterSocket::bind(&bind(0)).await?;
        let control_clients = RouterSocket::bind(&bind(0)).await?;
        let control_engines = RouterSocket::bind(&bind(0)).await?;
        let task_clients = RouterSocket::bind(&bind(0)).await?;
        let task_engines = RouterSocket::bind(&bind(0)).await?;

        let addrs = HubAddresses {
            engine_queue: mux_engines.local_addr().to_string(),
            engine_control: control_engines.local_addr().to_string(),
            engine_task: task_engines.local_addr().to_string(),
            heartbeat_ping: ping.local_addr().to_string(),
            heartbeat_pong: pong.local_addr().to_string(),
            client_queue: mux_clients.local_addr().to_string(),
            client_control: control_clients.local_addr().to_string(),
            client_task: task_clients.local_addr().to_string(),
            notification: notifier.local_addr().to_string(),
        };
        let registration_addr = registrar.local_addr();
        info!(registration = %registration_addr, ?addrs, "controller listening");

        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let (heart_tx, heart_rx) = mpsc::unbounded_channel();
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();

        let workers = vec![
            HeartMonitor::new(ping, pong, config.heartbeat.clone(), heart_tx).spawn(),
            Relay::monitored("mux", mux_clients, mux_engines, monitor_tx.clone()).spawn(),
            Relay::unmonitored("control", control_clients, control_engines).spawn(),
            TaskScheduler::new(
                session.clone(),
                task_clients,
                task_engines,
                scheduler_rx,
                monitor_tx,
                config.scheduler.clone(),
            )
            .spawn(),
        ];

        let hub = Hub::new(
            session,
            addrs,
            config.heartbeat.registration_timeout(),
            HubChannels {
                registrar: registrar.into_parts(),
                notifier,
                monitor: monitor_rx,
                heart_events: heart_rx,
                scheduler: scheduler_tx,
            },
        )
        .spawn();

        Ok(Self {
            registration_addr,
            hub,
            workers,
        })
    }

    pub fn registration_addr(&self) -> SocketAddr {
        self.registration_addr
    }

    /// Runs until the hub stops, either on a `shutdown_request` or because
    /// one of its channels closed, then stops the remaining tasks.
    pub async fn wait(self) {
        let _ = self.hub.await;
        for worker in &self.workers {
            worker.abort();
        }
        info!("controller stopped");
    }

    /// Stops every controller task immediately.
    pub fn shutdown(self) {
        self.hub.abort();
        for worker in &self.workers {
            worker.abort();
        }
    }
}
