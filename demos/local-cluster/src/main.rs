use anyhow::{bail, Context, Result};
use argh::FromArgs;
use std::collections::BTreeMap;
use std::time::Duration;

use parallax_client::{ApplyOptions, Client, ClientConfig};
use parallax_common::{Dependency, FunctionError, FunctionRef, FunctionRegistry, Object};
use parallax_controller::{Controller, ControllerConfig, SchedulerConfig, SchedulerScheme};
use parallax_engine::{Engine, EngineConfig};

/// Run a controller, some engines and a client in one process.
#[derive(FromArgs)]
struct Args {
    /// number of engines to start (default 4)
    #[argh(option, short = 'n', default = "4")]
    engines: usize,

    /// number of load-balanced tasks to submit (default 16)
    #[argh(option, short = 't', default = "16")]
    tasks: i64,

    /// pick the least loaded engine instead of rotating
    #[argh(switch)]
    least_load: bool,

    /// heartbeat period in milliseconds (default 1000)
    #[argh(option, default = "1000")]
    heartbeat_ms: u64,
}

fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::with_builtins();
    registry.register("demo", "square", Some(1), |_, args, _| match args[0].as_int() {
        Some(n) => Ok(Object::Int(n * n)),
        None => Err(FunctionError::type_error("square expects an int")),
    });
    registry.register("demo", "sum", None, |_, args, _| {
        let mut total = 0;
        for arg in &args {
            match arg {
                Object::Int(n) => total += n,
                Object::List(items) => total += items.iter().filter_map(Object::as_int).sum::<i64>(),
                other => {
                    return Err(FunctionError::type_error(format!(
                        "cannot sum {}",
                        other.type_name()
                    )))
                }
            }
        }
        Ok(Object::Int(total))
    });
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let controller = Controller::start(ControllerConfig {
        heartbeat: parallax_controller::HeartbeatConfig {
            period: Duration::from_millis(args.heartbeat_ms),
        },
        scheduler: SchedulerConfig {
            scheme: if args.least_load {
                SchedulerScheme::LeastLoad
            } else {
                SchedulerScheme::RoundRobin
            },
            ..SchedulerConfig::default()
        },
        ..ControllerConfig::default()
    })
    .await
    .context("failed to start controller")?;
    let addr = controller.registration_addr().to_string();
    tracing::info!("Controller registration address: {}", addr);

    let client = Client::connect(ClientConfig {
        registration_addr: addr.clone(),
        ..ClientConfig::default()
    })
    .await
    .context("failed to connect client")?;

    for _ in 0..args.engines {
        let engine = Engine::start(
            EngineConfig {
                registration_addr: addr.clone(),
                ..EngineConfig::default()
            },
            registry(),
        )
        .await
        .context("failed to start engine")?;
        engine.spawn();
    }
    if !client
        .wait_for_engines(args.engines, Duration::from_millis(args.heartbeat_ms * 5 + 5000))
        .await
    {
        bail!("engines did not register in time");
    }
    tracing::info!("Engines ready: {:?}", client.ids());

    let square = FunctionRef::new("demo", "square");
    let mut squares = Vec::new();
    for n in 0..args.tasks {
        squares.push(
            client
                .apply(&square, vec![Object::Int(n)], BTreeMap::new(), ApplyOptions::default())
                .await?,
        );
    }

    let mut values = Vec::with_capacity(squares.len());
    for result in &squares {
        values.push(result.get_one(None).await?);
    }
    tracing::info!("Squares: {:?}", values);

    // Gated on every square having finished, so it runs last.
    let msg_ids: Vec<String> = squares.iter().flat_map(|r| r.msg_ids().to_vec()).collect();
    let summed = client
        .apply(
            &FunctionRef::new("demo", "sum"),
            vec![Object::List(values)],
            BTreeMap::new(),
            ApplyOptions {
                block: true,
                after: Some(Dependency::all(msg_ids)),
                ..ApplyOptions::default()
            },
        )
        .await?
        .get_one(None)
        .await?;
    tracing::info!("Sum of squares: {:?}", summed);

    let queues = client.queue_status(None, false).await?;
    tracing::info!("Queue status: {}", queues);

    client.shutdown(None, true).await?;
    controller.wait().await;
    Ok(())
}
