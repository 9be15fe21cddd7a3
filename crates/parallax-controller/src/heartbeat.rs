//! Heartbeat-based liveness detection.
//!
//! Every period the monitor publishes a new lifetime token. Hearts answer by
//! echoing the token back with their own identity. A heart that misses one
//! tick is put on probation; missing the next one too declares it failed.

use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parallax_common::transport::{FrameSink, Multipart, PubSocket, RouterSocket};

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between pings.
    ///
    /// Default: 3000ms
    pub period: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(3000),
        }
    }
}

impl HeartbeatConfig {
    /// How long a registering engine has to start beating: max(5s, 2 periods).
    pub fn registration_timeout(&self) -> Duration {
        std::cmp::max(Duration::from_secs(5), self.period * 2)
    }
}

/// Liveness changes reported to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartEvent {
    NewHeart(Bytes),
    HeartFailure(Bytes),
}

/// How a pong was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pong {
    /// Answered the latest ping.
    Current,
    /// Answered the ping before, one period late.
    Late,
    /// Any other token; ignored.
    Stale,
}

/// What one tick decided.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Beat {
    /// Token to publish for the coming period.
    pub token: u64,
    pub new_hearts: Vec<Bytes>,
    pub failures: Vec<Bytes>,
}

/// The tick state machine, free of any I/O.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    lifetime: u64,
    last_ping: u64,
    hearts: HashSet<Bytes>,
    responses: HashSet<Bytes>,
    on_probation: HashSet<Bytes>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the current period and opens the next one.
    pub fn beat(&mut self) -> Beat {
        self.last_ping = self.lifetime;
        self.lifetime += 1;

        let responses = std::mem::take(&mut self.responses);

        let mut new_hearts: Vec<Bytes> = responses.difference(&self.hearts).cloned().collect();
        new_hearts.sort();
        let missed: HashSet<Bytes> = self.hearts.difference(&responses).cloned().collect();

        let mut failures: Vec<Bytes> = missed.intersection(&self.on_probation).cloned().collect();
        failures.sort();
        self.on_probation = missed.difference(&self.on_probation).cloned().collect();

        for heart in &new_hearts {
            self.hearts.insert(heart.clone());
        }
        for heart in &failures {
            self.hearts.remove(heart);
        }

        Beat {
            token: self.lifetime,
            new_hearts,
            failures,
        }
    }

    /// Records a reply carrying `token` from `heart`.
    pub fn handle_pong(&mut self, heart: Bytes, token: u64) -> Pong {
        if token == self.lifetime {
            self.responses.insert(heart);
            Pong::Current
        } else if token == self.last_ping && self.last_ping != 0 {
            self.responses.insert(heart);
            Pong::Late
        } else {
            Pong::Stale
        }
    }

    pub fn is_beating(&self, heart: &[u8]) -> bool {
        self.hearts.contains(heart)
    }

    pub fn on_probation(&self, heart: &[u8]) -> bool {
        self.on_probation.contains(heart)
    }

    pub fn heart_count(&self) -> usize {
        self.hearts.len()
    }
}

/// Drives a [`HeartbeatTracker`] over a ping publisher and a pong router.
pub struct HeartMonitor {
    ping: PubSocket,
    pong: RouterSocket,
    tracker: HeartbeatTracker,
    config: HeartbeatConfig,
    events: mpsc::UnboundedSender<HeartEvent>,
}

impl HeartMonitor {
    pub fn new(
        ping: PubSocket,
        pong: RouterSocket,
        config: HeartbeatConfig,
        events: mpsc::UnboundedSender<HeartEvent>,
    ) -> Self {
        Self {
            ping,
            pong,
            tracker: HeartbeatTracker::new(),
            config,
            events,
        }
    }

    /// Starts the monitor task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.tick() {
                        break;
                    }
                }
                msg = self.pong.recv() => match msg {
                    Some(msg) => self.handle_pong(msg),
                    None => break,
                },
            }
        }
        debug!("heart monitor stopped");
    }

    /// Returns false once the hub is gone.
    fn tick(&mut self) -> bool {
        let beat = self.tracker.beat();

        for heart in beat.new_hearts {
            info!(heart = %String::from_utf8_lossy(&heart), "new heart");
            if self.events.send(HeartEvent::NewHeart(heart)).is_err() {
                return false;
            }
        }
        for heart in beat.failures {
            warn!(heart = %String::from_utf8_lossy(&heart), "heart failed");
            if self.events.send(HeartEvent::HeartFailure(heart)).is_err() {
                return false;
            }
        }

        let ping = Multipart::new(vec![], vec![Bytes::from(beat.token.to_string())]);
        if let Err(e) = self.ping.send_multipart(ping) {
            warn!(error = %e, "failed to publish ping");
        }
        true
    }

    fn handle_pong(&mut self, mut msg: Multipart) {
        let Some(heart) = msg.pop_ident_front() else {
            return;
        };
        let token = msg
            .body()
            .first()
            .and_then(|frame| std::str::from_utf8(frame).ok())
            .and_then(|s| s.parse::<u64>().ok());

        let name = String::from_utf8_lossy(&heart).into_owned();
        match token {
            Some(token) => match self.tracker.handle_pong(heart, token) {
                Pong::Current => {}
                Pong::Late => warn!(heart = %name, "heart missed a beat"),
                Pong::Stale => debug!(heart = %name, token, "got bad heartbeat (possibly old?)"),
            },
            None => warn!(heart = %name, "malformed heartbeat"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_registration_timeout_floor() {
        let fast = HeartbeatConfig {
            period: Duration::from_millis(100),
        };
        assert_eq!(fast.registration_timeout(), Duration::from_secs(5));

        let slow = HeartbeatConfig {
            period: Duration::from_secs(4),
        };
        assert_eq!(slow.registration_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn test_new_heart_admitted() {
        let mut tracker = HeartbeatTracker::new();
        let first = tracker.beat();
        assert_eq!(tracker.handle_pong(h("a"), first.token), Pong::Current);

        let second = tracker.beat();
        assert_eq!(second.new_hearts, vec![h("a")]);
        assert!(second.failures.is_empty());
        assert!(tracker.is_beating(b"a"));
    }

    #[test]
    fn test_responding_heart_never_fails() {
        let mut tracker = HeartbeatTracker::new();
        let mut token = tracker.beat().token;
        for _ in 0..50 {
            tracker.handle_pong(h("a"), token);
            let beat = tracker.beat();
            assert!(beat.failures.is_empty());
            token = beat.token;
        }
        assert!(tracker.is_beating(b"a"));
        assert!(!tracker.on_probation(b"a"));
    }

    #[test]
    fn test_silent_heart_fails_after_two_missed_periods() {
        let mut tracker = HeartbeatTracker::new();
        let token = tracker.beat().token;
        tracker.handle_pong(h("a"), token);
        tracker.beat(); // admitted

        let first_miss = tracker.beat();
        assert!(first_miss.failures.is_empty());
        assert!(tracker.on_probation(b"a"));

        let second_miss = tracker.beat();
        assert_eq!(second_miss.failures, vec![h("a")]);
        assert!(!tracker.is_beating(b"a"));
        assert_eq!(tracker.heart_count(), 0);
    }

    #[test]
    fn test_probation_cleared_by_reply() {
        let mut tracker = HeartbeatTracker::new();
        let token = tracker.beat().token;
        tracker.handle_pong(h("a"), token);
        tracker.beat();

        let missed = tracker.beat();
        assert!(tracker.on_probation(b"a"));

        tracker.handle_pong(h("a"), missed.token);
        let recovered = tracker.beat();
        assert!(recovered.failures.is_empty());
        assert!(!tracker.on_probation(b"a"));
        assert!(tracker.is_beating(b"a"));
    }

    #[test]
    fn test_late_and_stale_pongs() {
        let mut tracker = HeartbeatTracker::new();
        let old = tracker.beat().token;
        let current = tracker.beat().token;

        assert_eq!(tracker.handle_pong(h("a"), current), Pong::Current);
        assert_eq!(tracker.handle_pong(h("b"), old), Pong::Late);
        assert_eq!(tracker.handle_pong(h("c"), current + 7), Pong::Stale);

        let beat = tracker.beat();
        assert_eq!(beat.new_hearts, vec![h("a"), h("b")]);
    }
}
