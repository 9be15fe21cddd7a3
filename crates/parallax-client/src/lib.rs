//! Parallax client.
//!
//! A [`Client`] connects to a controller, learns the cluster's addresses and
//! engines, and submits calls either straight to chosen engines or through
//! the load-balanced task queue. Every call returns an [`AsyncResult`].
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! # use parallax_client::{ApplyOptions, Client, ClientConfig};
//! # use parallax_common::{FunctionRef, Object};
//! # #[tokio::main]
//! # async fn main() -> parallax_common::Result<()> {
//! let client = Client::connect(ClientConfig::default()).await?;
//! let result = client
//!     .apply(
//!         &FunctionRef::new("demo", "square"),
//!         vec![Object::Int(3)],
//!         BTreeMap::new(),
//!         ApplyOptions::default(),
//!     )
//!     .await?;
//! let value = result.get_one(None).await?;
//! # Ok(())
//! # }
//! ```

mod async_result;
mod client;
mod state;

pub use async_result::AsyncResult;
pub use client::{ApplyOptions, Client, ClientConfig};
