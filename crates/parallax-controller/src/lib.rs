//! Parallax controller.
//!
//! The controller is the hub every engine and client connects to. It keeps
//! the engine registry, relays direct requests to engines, runs the
//! load-balanced task queue and watches engine liveness with heartbeats.
//! Its state lives in a single hub task; everything else reports to it over
//! channels.

pub mod controller;
pub mod heartbeat;
pub mod hub;
pub mod load_balancer;
pub mod relay;
pub mod scheduler;

pub use controller::{Controller, ControllerConfig};
pub use heartbeat::{HeartEvent, HeartMonitor, HeartbeatConfig, HeartbeatTracker};
pub use hub::{EngineConnector, Hub, HubState, MonitorSwitch, PendingTask, ResultRecord};
pub use load_balancer::{LoadBalancer, SchedulerScheme};
pub use relay::Relay;
pub use scheduler::{SchedulerConfig, SchedulerState, TaskScheduler};
