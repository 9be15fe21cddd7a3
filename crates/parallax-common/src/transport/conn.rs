//! Connection plumbing shared by the socket roles.

use bytes::Bytes;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use super::codec::{Multipart, MultipartCodec};
use crate::protocol::error::{ParallelError, Result};

/// Timeout for establishing a connection and for reading the handshake.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to `addr`, trying each resolved address until one succeeds.
pub(crate) async fn connect(addr: &str) -> Result<TcpStream> {
    let socket_addrs = lookup_host(addr)
        .await
        .map_err(|e| ParallelError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(socket_addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some("timed out".to_string()),
        }
    }

    Err(ParallelError::Connection(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err.unwrap_or_else(|| "Unknown error".to_string())
    )))
}

/// Connects and announces `identity`, returning both stream halves.
pub(crate) async fn connect_with_identity(
    addr: &str,
    identity: &Bytes,
) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let stream = connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    MultipartCodec::write(&mut writer, &Multipart::new(vec![], vec![identity.clone()])).await?;
    Ok((reader, writer))
}

/// Reads the identity a freshly accepted peer announces.
pub(crate) async fn read_handshake(reader: &mut OwnedReadHalf) -> Result<Bytes> {
    let msg = tokio::time::timeout(CONNECT_TIMEOUT, MultipartCodec::read(reader))
        .await
        .map_err(|_| ParallelError::Timeout(CONNECT_TIMEOUT.as_millis() as u64))??;

    match msg {
        Some(mut msg) if msg.frames.len() == 1 => Ok(msg.frames.remove(0)),
        Some(msg) => Err(ParallelError::Transport(format!(
            "handshake must be one frame, got {}",
            msg.frames.len()
        ))),
        None => Err(ParallelError::Connection(
            "peer closed before handshake".to_string(),
        )),
    }
}

/// Spawns the task that owns the write half and drains the returned channel.
///
/// The write half is shut down once every sender is dropped.
pub(crate) fn spawn_writer(mut writer: OwnedWriteHalf) -> mpsc::UnboundedSender<Multipart> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Multipart>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = MultipartCodec::write(&mut writer, &msg).await {
                debug!(error = %e, "writer stopped");
                break;
            }
        }
    });
    tx
}
