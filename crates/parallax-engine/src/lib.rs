//! Parallax engine.
//!
//! An engine registers with a controller, starts a heart on its own thread
//! and then runs `apply_request`s against a [`FunctionRegistry`] and a
//! persistent namespace.
//!
//! ```no_run
//! # use parallax_common::FunctionRegistry;
//! # use parallax_engine::{Engine, EngineConfig};
//! # #[tokio::main]
//! # async fn main() -> parallax_common::Result<()> {
//! let config = EngineConfig {
//!     registration_addr: "127.0.0.1:10101".to_string(),
//!     ..EngineConfig::default()
//! };
//! let engine = Engine::start(config, FunctionRegistry::with_builtins()).await?;
//! engine.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`FunctionRegistry`]: parallax_common::FunctionRegistry

pub mod engine;
pub mod executor;
pub mod heart;

pub use engine::{Engine, EngineConfig};
pub use executor::Executor;
pub use heart::{Heart, HeartHandle};
