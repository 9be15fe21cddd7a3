//! Heartbeat responder.
//!
//! The heart echoes every ping from the controller back with its own
//! identity. It runs on a dedicated OS thread with its own runtime, so a
//! busy engine keeps beating.

use bytes::Bytes;
use std::thread;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use parallax_common::transport::{DealerSocket, FrameSink, Multipart, SubSocket};
use parallax_common::{ParallelError, Result};

/// Addresses and identity of a heart.
#[derive(Debug, Clone)]
pub struct Heart {
    ping_addr: String,
    pong_addr: String,
    identity: Bytes,
}

/// A running heart. Dropping it stops the thread.
pub struct HeartHandle {
    stop: watch::Sender<bool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Heart {
    pub fn new(ping_addr: impl Into<String>, pong_addr: impl Into<String>, identity: Bytes) -> Self {
        Self {
            ping_addr: ping_addr.into(),
            pong_addr: pong_addr.into(),
            identity,
        }
    }

    /// Starts the heart thread and waits until it is connected.
    pub async fn start(self) -> Result<HeartHandle> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop, stop_rx) = watch::channel(false);

        let thread = thread::Builder::new()
            .name("parallax-heart".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ParallelError::Io(e)));
                        return;
                    }
                };
                runtime.block_on(self.beat(ready_tx, stop_rx));
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(HeartHandle {
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ParallelError::Connection(
                "heart thread exited before connecting".to_string(),
            )),
        }
    }

    async fn beat(self, ready: oneshot::Sender<Result<()>>, mut stop: watch::Receiver<bool>) {
        let connected = async {
            let ping = SubSocket::connect(&self.ping_addr, self.identity.clone()).await?;
            let pong = DealerSocket::connect(&self.pong_addr, self.identity.clone()).await?;
            Ok::<_, ParallelError>((ping, pong))
        };
        let (mut ping, pong) = match connected.await {
            Ok(sockets) => sockets,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        debug!(heart = %String::from_utf8_lossy(&self.identity), "heart beating");

        loop {
            tokio::select! {
                msg = ping.recv() => match msg {
                    Some(msg) => {
                        let echo = Multipart::new(vec![], msg.frames);
                        if let Err(e) = pong.send_multipart(echo) {
                            warn!(error = %e, "failed to answer ping");
                            break;
                        }
                    }
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }
        debug!(heart = %String::from_utf8_lossy(&self.identity), "heart stopped");
    }
}

impl HeartHandle {
    /// Stops the heart and joins its thread.
    pub fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
