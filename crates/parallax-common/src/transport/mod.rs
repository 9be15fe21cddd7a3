//! Parallax Transport Layer
//!
//! This module provides multipart messaging over TCP with the four socket
//! roles the system is built from.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one long-lived connection per peer
//! - **Codec**: [`MultipartCodec`] length-prefixed frames with an explicit
//!   identity count
//! - **Wire Format**: `[u32 ident_count][u32 frame_count]` then
//!   `[u32 len][bytes]` per frame, all big-endian
//!
//! # Components
//!
//! - **[`RouterSocket`]**: bound; tags inbound messages with the sender's
//!   identity and routes outbound messages by their first identity frame
//! - **[`DealerSocket`]**: connected; sends and receives messages as-is
//! - **[`PubSocket`]** / **[`SubSocket`]**: one-way fan-out
//!
//! Every connecting socket opens with a handshake envelope holding its
//! identity, which is how a router learns who is on the other end.
//!
//! Sending never blocks: each connection has a writer task fed by an
//! unbounded channel, so event handlers can reply without awaiting.
//!
//! # Message Size Limits
//!
//! Envelopes are capped at 100 MB to prevent memory exhaustion.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use parallax_common::transport::{DealerSocket, FrameSink, Multipart, RouterSocket};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut router = RouterSocket::bind("127.0.0.1:0").await?;
//! let addr = router.local_addr().to_string();
//!
//! let dealer = DealerSocket::connect(&addr, Bytes::from_static(b"peer-1")).await?;
//! dealer.send_multipart(Multipart::new(vec![], vec![Bytes::from_static(b"hello")]))?;
//!
//! let msg = router.recv().await.unwrap();
//! assert_eq!(msg.idents()[0], Bytes::from_static(b"peer-1"));
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod conn;
pub mod dealer;
pub mod pubsub;
pub mod router;

pub use codec::{Multipart, MultipartCodec, MAX_MESSAGE_SIZE};
pub use dealer::{DealerHandle, DealerSocket};
pub use pubsub::{PubSocket, SubSocket};
pub use router::{RouterGuard, RouterHandle, RouterSocket};

use crate::protocol::error::{ParallelError, Result};
use tokio::sync::mpsc;

/// Anything a multipart message can be handed to without waiting.
pub trait FrameSink {
    fn send_multipart(&self, msg: Multipart) -> Result<()>;
}

impl FrameSink for mpsc::UnboundedSender<Multipart> {
    fn send_multipart(&self, msg: Multipart) -> Result<()> {
        self.send(msg)
            .map_err(|_| ParallelError::Transport("receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests;
