use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::codec::{Multipart, MultipartCodec};
use super::conn;
use super::FrameSink;
use crate::protocol::error::Result;

/// Connected socket that sends and receives multipart messages unchanged.
pub struct DealerSocket {
    handle: DealerHandle,
    inbound: mpsc::UnboundedReceiver<Multipart>,
}

/// Cloneable sending side of a [`DealerSocket`].
#[derive(Clone)]
pub struct DealerHandle {
    identity: Bytes,
    tx: mpsc::UnboundedSender<Multipart>,
}

impl DealerSocket {
    /// Connects to a router at `addr`, announcing `identity`.
    pub async fn connect(addr: &str, identity: Bytes) -> Result<Self> {
        let (mut reader, writer) = conn::connect_with_identity(addr, &identity).await?;
        let tx = conn::spawn_writer(writer);

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let name = String::from_utf8_lossy(&identity).into_owned();
        tokio::spawn(async move {
            loop {
                match MultipartCodec::read(&mut reader).await {
                    Ok(Some(msg)) => {
                        if inbound_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(identity = %name, error = %e, "dealer reader stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            handle: DealerHandle { identity, tx },
            inbound,
        })
    }

    pub fn identity(&self) -> &Bytes {
        &self.handle.identity
    }

    pub fn handle(&self) -> DealerHandle {
        self.handle.clone()
    }

    /// Next inbound message, `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.inbound.recv().await
    }

    pub fn into_parts(self) -> (DealerHandle, mpsc::UnboundedReceiver<Multipart>) {
        (self.handle, self.inbound)
    }
}

impl DealerHandle {
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }
}

impl FrameSink for DealerHandle {
    fn send_multipart(&self, msg: Multipart) -> Result<()> {
        self.tx.send_multipart(msg)
    }
}

impl FrameSink for DealerSocket {
    fn send_multipart(&self, msg: Multipart) -> Result<()> {
        self.handle.send_multipart(msg)
    }
}
