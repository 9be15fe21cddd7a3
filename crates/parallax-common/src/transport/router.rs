use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::codec::{Multipart, MultipartCodec};
use super::conn;
use super::FrameSink;
use crate::protocol::error::{ParallelError, Result};

struct Peer {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Multipart>,
}

type PeerMap = Arc<Mutex<HashMap<Bytes, Peer>>>;

/// Bound socket that routes by peer identity.
///
/// Each inbound message arrives with the sender's identity pushed in front
/// of its identity frames. Outbound messages are delivered to the peer named
/// by their first identity frame, which is stripped.
pub struct RouterSocket {
    local_addr: SocketAddr,
    handle: RouterHandle,
    inbound: mpsc::UnboundedReceiver<Multipart>,
    // Dropping this stops the accept loop and every reader.
    _shutdown: watch::Sender<()>,
}

/// Cloneable sending side of a [`RouterSocket`].
#[derive(Clone)]
pub struct RouterHandle {
    peers: PeerMap,
}

impl RouterSocket {
    /// Binds to `bind_addr` (e.g. `"127.0.0.1:0"`) and starts accepting peers.
    pub async fn bind(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ParallelError::Connection(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(());

        tokio::spawn(accept_loop(listener, peers.clone(), inbound_tx, shutdown_rx));

        Ok(Self {
            local_addr,
            handle: RouterHandle { peers },
            inbound,
            _shutdown: shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Next inbound message, `None` once the socket is closed.
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.inbound.recv().await
    }

    /// Splits the socket for use from separate tasks.
    ///
    /// The returned guard keeps the listener alive.
    pub fn into_parts(self) -> (RouterHandle, mpsc::UnboundedReceiver<Multipart>, RouterGuard) {
        (
            self.handle,
            self.inbound,
            RouterGuard {
                _shutdown: self._shutdown,
            },
        )
    }
}

/// Keeps a split [`RouterSocket`] listening until dropped.
pub struct RouterGuard {
    _shutdown: watch::Sender<()>,
}

impl RouterHandle {
    /// Identities currently connected.
    pub fn peers(&self) -> Vec<Bytes> {
        match self.peers.lock() {
            Ok(peers) => peers.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_connected(&self, identity: &[u8]) -> bool {
        self.peers
            .lock()
            .map(|peers| peers.contains_key(identity))
            .unwrap_or(false)
    }
}

impl FrameSink for RouterHandle {
    fn send_multipart(&self, mut msg: Multipart) -> Result<()> {
        let Some(dest) = msg.pop_ident_front() else {
            return Err(ParallelError::Transport(
                "router message has no destination identity".to_string(),
            ));
        };

        let peers = self
            .peers
            .lock()
            .map_err(|_| ParallelError::Transport("peer table poisoned".to_string()))?;
        match peers.get(&dest) {
            Some(peer) => {
                if peer.tx.send(msg).is_err() {
                    debug!(peer = %String::from_utf8_lossy(&dest), "peer writer closed");
                }
            }
            None => {
                warn!(
                    peer = %String::from_utf8_lossy(&dest),
                    "dropping message for unknown identity"
                );
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: PeerMap,
    inbound: mpsc::UnboundedSender<Multipart>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut next_conn_id = 0u64;
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                next_conn_id += 1;
                tokio::spawn(handle_connection(
                    stream,
                    peer_addr,
                    next_conn_id,
                    peers.clone(),
                    inbound.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
            }
        }
    }

    if let Ok(mut peers) = peers.lock() {
        peers.clear();
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    conn_id: u64,
    peers: PeerMap,
    inbound: mpsc::UnboundedSender<Multipart>,
    mut shutdown: watch::Receiver<()>,
) {
    let (mut reader, writer) = stream.into_split();

    let identity = match conn::read_handshake(&mut reader).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%peer_addr, error = %e, "handshake failed");
            return;
        }
    };
    let name = String::from_utf8_lossy(&identity).into_owned();

    {
        let Ok(mut table) = peers.lock() else { return };
        if table.contains_key(&identity) {
            warn!(%peer_addr, identity = %name, "rejecting duplicate identity");
            return;
        }
        table.insert(
            identity.clone(),
            Peer {
                conn_id,
                tx: conn::spawn_writer(writer),
            },
        );
    }
    debug!(%peer_addr, identity = %name, "peer connected");

    loop {
        let read = tokio::select! {
            read = MultipartCodec::read(&mut reader) => read,
            _ = shutdown.changed() => break,
        };
        match read {
            Ok(Some(mut msg)) => {
                msg.push_ident_front(identity.clone());
                if inbound.send(msg).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                info!(identity = %name, error = %e, "connection closed");
                break;
            }
        }
    }

    if let Ok(mut table) = peers.lock() {
        if table.get(&identity).map(|p| p.conn_id) == Some(conn_id) {
            table.remove(&identity);
        }
    }
    debug!(identity = %name, "peer disconnected");
}
