use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::codec::{Multipart, MultipartCodec};
use super::conn;
use super::FrameSink;
use crate::protocol::error::{ParallelError, Result};

type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Multipart>>>>;

/// Bound fan-out socket. Every message goes to every connected subscriber.
#[derive(Clone)]
pub struct PubSocket {
    local_addr: SocketAddr,
    subscribers: Subscribers,
    _shutdown: Arc<watch::Sender<()>>,
}

impl PubSocket {
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ParallelError::Connection(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, mut shutdown_rx) = watch::channel(());

        let subs = subscribers.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = shutdown_rx.changed() => break,
                };
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept subscriber");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let subs = subs.clone();
                tokio::spawn(async move {
                    let (mut reader, writer) = stream.into_split();
                    match conn::read_handshake(&mut reader).await {
                        Ok(identity) => {
                            debug!(%peer_addr, identity = %String::from_utf8_lossy(&identity), "subscriber connected");
                            if let Ok(mut subs) = subs.lock() {
                                subs.push(conn::spawn_writer(writer));
                            }
                        }
                        Err(e) => warn!(%peer_addr, error = %e, "subscriber handshake failed"),
                    }
                });
            }
            if let Ok(mut subs) = subs.lock() {
                subs.clear();
            }
        });

        Ok(Self {
            local_addr,
            subscribers,
            _shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl FrameSink for PubSocket {
    /// Broadcasts, dropping subscribers whose connection has gone away.
    fn send_multipart(&self, msg: Multipart) -> Result<()> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| ParallelError::Transport("subscriber list poisoned".to_string()))?;
        subs.retain(|tx| tx.send(msg.clone()).is_ok());
        Ok(())
    }
}

/// Connected receiving end of a [`PubSocket`].
pub struct SubSocket {
    inbound: mpsc::UnboundedReceiver<Multipart>,
}

impl SubSocket {
    pub async fn connect(addr: &str, identity: Bytes) -> Result<Self> {
        let (mut reader, writer) = conn::connect_with_identity(addr, &identity).await?;

        let (tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Held so the publisher does not see the connection half-closed.
            let _writer: OwnedWriteHalf = writer;
            while let Ok(Some(msg)) = MultipartCodec::read(&mut reader).await {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        Ok(Self { inbound })
    }

    /// Next broadcast, `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.inbound.recv().await
    }
}
