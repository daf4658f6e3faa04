//! Keep-alive pings and round-trip measurement for one connection.
//!
//! The connection manager polls [`KeepAlive`] every tick. It sends a ping
//! as soon as the connection comes up and then once per interval. Each
//! ping carries a millisecond stamp that the server echoes back. The
//! connection is declared dead once a ping is outstanding and nothing at
//! all has been heard for the ping timeout.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::framing::Envelope;

/// Number of RTT samples kept for averaging.
const RTT_WINDOW: usize = 32;

#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Time between pings. Default: 30 s.
    pub interval: Duration,
    /// Silence after which the connection is considered dead. Default: 300 s.
    pub timeout: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
        }
    }
}

/// What the manager should do after polling.
#[derive(Debug, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    Send(Envelope),
    /// The link has been silent past the timeout; tear it down.
    Expired,
}

/// Snapshot of a link's keep-alive traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveStats {
    /// Mean over the most recent echoed pings.
    pub average_rtt: Option<Duration>,
    pub pings_sent: u64,
    pub pongs_received: u64,
}

#[derive(Debug)]
struct PendingPing {
    stamp: u32,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct KeepAlive {
    config: KeepAliveConfig,
    epoch: Instant,
    next_ping_at: Instant,
    pending: VecDeque<PendingPing>,
    rtt_samples: VecDeque<Duration>,
    pings_sent: u64,
    pongs_received: u64,
}

impl KeepAlive {
    /// Start tracking a link that came up at `now`. The first ping is due
    /// immediately.
    pub fn new(config: KeepAliveConfig, now: Instant) -> Self {
        Self {
            config,
            epoch: now,
            next_ping_at: now,
            pending: VecDeque::new(),
            rtt_samples: VecDeque::with_capacity(RTT_WINDOW),
            pings_sent: 0,
            pongs_received: 0,
        }
    }

    pub fn poll(&mut self, now: Instant, last_heard: Instant) -> KeepAliveAction {
        if self.pings_sent > 0 && now.saturating_duration_since(last_heard) >= self.config.timeout
        {
            return KeepAliveAction::Expired;
        }

        let timeout = self.config.timeout;
        while let Some(front) = self.pending.front() {
            if now.saturating_duration_since(front.sent_at) > timeout {
                self.pending.pop_front();
            } else {
                break;
            }
        }

        if now < self.next_ping_at {
            return KeepAliveAction::Idle;
        }

        let stamp = now.saturating_duration_since(self.epoch).as_millis() as u32;
        self.pending.push_back(PendingPing {
            stamp,
            sent_at: now,
        });
        self.pings_sent += 1;
        self.next_ping_at = now + self.config.interval;
        KeepAliveAction::Send(Envelope::ping(stamp))
    }

    /// Match an echoed ping. Returns the round-trip time if the stamp was
    /// outstanding.
    pub fn on_pong(&mut self, body: &[u8], now: Instant) -> Option<Duration> {
        let stamp = u32::from_le_bytes(body.get(..4)?.try_into().ok()?);
        let pos = self.pending.iter().position(|p| p.stamp == stamp)?;
        let ping = self.pending.remove(pos)?;
        let rtt = now.saturating_duration_since(ping.sent_at);

        if self.rtt_samples.len() >= RTT_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);
        self.pongs_received += 1;
        Some(rtt)
    }

    /// Average RTT over the recent window.
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: Duration = self.rtt_samples.iter().sum();
        Some(sum / self.rtt_samples.len() as u32)
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs_received
    }

    pub fn stats(&self) -> KeepAliveStats {
        KeepAliveStats {
            average_rtt: self.average_rtt(),
            pings_sent: self.pings_sent,
            pongs_received: self.pongs_received,
        }
    }
}
