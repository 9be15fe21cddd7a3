//! Loopback cluster used by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use parallax_client::{Client, ClientConfig};
use parallax_common::{FunctionError, FunctionRegistry, Object};
use parallax_controller::{Controller, ControllerConfig, HeartbeatConfig};
use parallax_engine::{Engine, EngineConfig};

pub const HEARTBEAT: Duration = Duration::from_millis(100);
pub const WAIT: Duration = Duration::from_secs(10);

/// Functions every test engine knows.
pub fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::with_builtins();
    registry.register("demo", "double", Some(1), |_, args, _| match args[0].as_int() {
        Some(n) => Ok(Object::Int(n * 2)),
        None => Err(FunctionError::type_error("double expects an int")),
    });
    registry.register("demo", "divide", Some(2), |_, args, _| {
        match (args[0].as_int(), args[1].as_int()) {
            (Some(_), Some(0)) => Err(FunctionError::new("ZeroDivisionError", "division by zero")),
            (Some(a), Some(b)) => Ok(Object::Int(a / b)),
            _ => Err(FunctionError::type_error("divide expects ints")),
        }
    });
    registry.register("demo", "sleep", Some(1), |_, args, _| {
        let ms = args[0].as_int().unwrap_or(0).max(0) as u64;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(Object::None)
    });
    registry
}

pub struct Cluster {
    pub controller: Controller,
    pub addr: String,
}

impl Cluster {
    pub async fn start() -> Self {
        let config = ControllerConfig {
            heartbeat: HeartbeatConfig { period: HEARTBEAT },
            ..ControllerConfig::default()
        };
        let controller = Controller::start(config).await.expect("controller should start");
        let addr = controller.registration_addr().to_string();
        Self { controller, addr }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            registration_addr: self.addr.clone(),
            ..EngineConfig::default()
        }
    }

    pub async fn add_engine(&self) -> Engine {
        Engine::start(self.engine_config(), registry())
            .await
            .expect("engine should register")
    }

    pub async fn client(&self) -> Client {
        Client::connect(ClientConfig {
            registration_addr: self.addr.clone(),
            ..ClientConfig::default()
        })
        .await
        .expect("client should connect")
    }

    /// A controller, a connected client and `engines` running engines.
    pub async fn with_engines(engines: usize) -> (Self, Client) {
        let cluster = Self::start().await;
        let client = cluster.client().await;
        for _ in 0..engines {
            cluster.add_engine().await.spawn();
        }
        assert!(
            client.wait_for_engines(engines, WAIT).await,
            "engines should register"
        );
        (cluster, client)
    }
}
