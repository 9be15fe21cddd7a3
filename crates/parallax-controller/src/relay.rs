//! Direct relays between clients and engines.
//!
//! A client addresses an engine by putting the engine's queue identity in
//! front of its message. The client-side router adds the client's identity,
//! so the relay sees `[client, engine, ...]` and swaps the two before
//! handing it to the engine-side router. Replies take the reverse path.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use parallax_common::transport::{FrameSink, Multipart, RouterHandle, RouterSocket};

use crate::hub::MonitorSwitch;

/// Moves messages both ways between a client-facing and an engine-facing
/// router.
pub struct Relay {
    name: &'static str,
    client_side: RouterSocket,
    engine_side: RouterSocket,
    monitor: Option<mpsc::UnboundedSender<Multipart>>,
}

impl Relay {
    /// A relay that copies traffic to the hub's monitor channel.
    pub fn monitored(
        name: &'static str,
        client_side: RouterSocket,
        engine_side: RouterSocket,
        monitor: mpsc::UnboundedSender<Multipart>,
    ) -> Self {
        Self {
            name,
            client_side,
            engine_side,
            monitor: Some(monitor),
        }
    }

    pub fn unmonitored(name: &'static str, client_side: RouterSocket, engine_side: RouterSocket) -> Self {
        Self {
            name,
            client_side,
            engine_side,
            monitor: None,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        let to_engines = self.engine_side.handle();
        let to_clients = self.client_side.handle();

        loop {
            tokio::select! {
                msg = self.client_side.recv() => match msg {
                    Some(msg) => self.forward(msg, &to_engines, MonitorSwitch::In),
                    None => break,
                },
                msg = self.engine_side.recv() => match msg {
                    Some(msg) => self.forward(msg, &to_clients, MonitorSwitch::Out),
                    None => break,
                },
            }
        }
        debug!(relay = self.name, "relay stopped");
    }

    fn forward(&self, mut msg: Multipart, dest: &RouterHandle, switch: MonitorSwitch) {
        if msg.ident_count < 2 {
            warn!(relay = self.name, idents = msg.ident_count, "dropping unaddressed message");
            return;
        }

        if let Some(monitor) = &self.monitor {
            let mut copy = msg.clone();
            copy.push_ident_front(switch.as_frame());
            if monitor.send(copy).is_err() {
                warn!(relay = self.name, "hub monitor channel closed; bookkeeping copy dropped");
            }
        }

        msg.frames.swap(0, 1);
        if let Err(e) = dest.send_multipart(msg) {
            warn!(relay = self.name, error = %e, "relay send failed");
        }
    }
}
