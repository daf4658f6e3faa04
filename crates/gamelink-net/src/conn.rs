//! Per-protocol connection lifecycle.
//!
//! Each [`ConnManager`] owns at most one live [`Conn`] for its protocol and
//! decides when to connect, reconnect, ping, and give up. Managers never
//! touch the transaction registry. Every handler returns a [`Fallout`]
//! describing which transactions to cancel and which errors to report,
//! and the network context applies it after releasing the manager lock.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use gamelink_config::ConnectionConfig;

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::NetError;
use crate::framing::Envelope;
use crate::keepalive::{KeepAlive, KeepAliveAction, KeepAliveConfig, KeepAliveStats};
use crate::protocol::{ConnectHeader, ProductInfo, Protocol};
use crate::socket::{EventSender, SocketDriver};

/// Identifies one connection attempt. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Monotonic [`ConnId`] source shared by all managers.
pub struct ConnIdGenerator {
    next: AtomicU32,
}

impl ConnIdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_id(&self) -> ConnId {
        ConnId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to one socket.
///
/// The manager and every transaction bound to the connection hold an
/// `Arc<Conn>`. The socket is closed when the last holder lets go, so a
/// response can still be matched after the manager has abandoned the link.
pub struct Conn {
    id: ConnId,
    protocol: Protocol,
    addr: SocketAddr,
    driver: Arc<dyn SocketDriver>,
    live: Arc<AtomicUsize>,
}

impl Conn {
    pub(crate) fn open(
        id: ConnId,
        protocol: Protocol,
        addr: SocketAddr,
        driver: Arc<dyn SocketDriver>,
        live: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        live.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            id,
            protocol,
            addr,
            driver,
            live,
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a message on this connection.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.driver.send(self.id, envelope)
    }

    /// Close the socket now, even if other holders remain.
    pub(crate) fn close(&self) {
        self.driver.disconnect(self.id);
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.driver.disconnect(self.id);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("addr", &self.addr)
            .finish()
    }
}

/// Reconnect and keep-alive tuning for a manager.
#[derive(Debug, Clone)]
pub struct ConnPolicy {
    pub min_reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    /// Consecutive unvalidated short-lived connections before giving up.
    pub max_immediate_disconnects: u32,
    /// Consecutive failed connect attempts before giving up.
    pub max_failed_connects: u32,
    /// Uptime after which a connection counts as validated.
    pub min_valid_connection: Duration,
    /// Silence after which a lost connection is not retried.
    pub disconnected_timeout: Duration,
    pub ping_enabled: bool,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Jitter factor applied to reconnect backoff.
    pub reconnect_jitter: f64,
}

impl Default for ConnPolicy {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            min_reconnect_interval: Duration::from_millis(config.min_reconnect_interval_ms),
            max_reconnect_interval: Duration::from_millis(config.max_reconnect_interval_ms),
            max_immediate_disconnects: config.max_immediate_disconnects,
            max_failed_connects: config.max_failed_connects,
            min_valid_connection: Duration::from_millis(config.min_valid_connection_ms),
            disconnected_timeout: Duration::from_millis(config.disconnected_timeout_ms),
            ping_enabled: config.ping_enabled,
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
            reconnect_jitter: 0.25,
        }
    }
}

impl ConnPolicy {
    fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            min_delay: self.min_reconnect_interval,
            max_delay: self.max_reconnect_interval,
            multiplier: 2.0,
            jitter: self.reconnect_jitter,
        }
    }

    fn keepalive_config(&self) -> KeepAliveConfig {
        KeepAliveConfig {
            interval: self.ping_interval,
            timeout: self.ping_timeout,
        }
    }
}

/// What a manager needs to open a socket.
pub struct LinkContext<'a> {
    pub driver: &'a Arc<dyn SocketDriver>,
    pub ids: &'a ConnIdGenerator,
    pub events: &'a EventSender,
    pub product: &'a ProductInfo,
}

/// Consequences of a manager state change, applied by the context.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fallout {
    /// Complete every transaction bound to the connection with the error.
    pub cancel_conn: Option<(ConnId, NetError)>,
    /// Complete every pending transaction of the protocol with the error.
    pub cancel_protocol: Option<NetError>,
    /// Hand the error to the context's error hook.
    pub report: Option<NetError>,
}

impl Fallout {
    pub fn is_empty(&self) -> bool {
        self.cancel_conn.is_none() && self.cancel_protocol.is_none() && self.report.is_none()
    }

    fn for_conn(conn: ConnId, error: NetError) -> Self {
        Self {
            cancel_conn: Some((conn, error)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
}

struct Link {
    conn: Arc<Conn>,
    phase: Phase,
    connected_at: Option<Instant>,
    validated: bool,
    keepalive: KeepAlive,
}

/// Connection state machine for one protocol.
pub struct ConnManager {
    protocol: Protocol,
    policy: ConnPolicy,
    running: bool,
    candidates: Vec<SocketAddr>,
    next_candidate: usize,
    pending_lookups: usize,
    link: Option<Link>,
    /// `None` with no link means "attempt on the next update".
    next_attempt: Option<Instant>,
    backoff: Backoff,
    failed_connects: u32,
    immediate_disconnects: u32,
    gave_up: bool,
    ping_enabled: bool,
    last_heard: Option<Instant>,
    live: Arc<AtomicUsize>,
}

impl ConnManager {
    pub fn new(protocol: Protocol, policy: ConnPolicy) -> Self {
        let backoff = Backoff::new(policy.backoff_config());
        let ping_enabled = policy.ping_enabled;
        Self {
            protocol,
            policy,
            running: false,
            candidates: Vec::new(),
            next_candidate: 0,
            pending_lookups: 0,
            link: None,
            next_attempt: None,
            backoff,
            failed_connects: 0,
            immediate_disconnects: 0,
            gave_up: false,
            ping_enabled,
            last_heard: None,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Point the manager at a fresh address list and start connecting.
    ///
    /// `pending_lookups` host names are still resolving and will arrive via
    /// [`ConnManager::add_resolved`]. Any existing link is abandoned.
    pub fn initialize(
        &mut self,
        addrs: Vec<SocketAddr>,
        pending_lookups: usize,
        now: Instant,
    ) -> Fallout {
        let fallout = match self.take_link() {
            Some(old) => Fallout::for_conn(old, NetError::Disconnected),
            None => Fallout::default(),
        };
        self.running = true;
        self.candidates = addrs;
        self.next_candidate = 0;
        self.pending_lookups = pending_lookups;
        self.reset_counters(now);
        tracing::info!(
            "{} manager initialized with {} address(es), {} lookup(s) pending",
            self.protocol,
            self.candidates.len(),
            pending_lookups
        );
        fallout
    }

    /// Stop reconnecting and drop the current link.
    /// Returns the abandoned connection, if there was one.
    pub fn abandon(&mut self) -> Option<ConnId> {
        self.running = false;
        self.next_attempt = None;
        self.take_link()
    }

    /// Clear the give-up state and counters so connecting resumes.
    pub fn reset_connectivity(&mut self, now: Instant) {
        self.reset_counters(now);
        tracing::info!("{} connectivity reset", self.protocol);
    }

    pub fn add_resolved(&mut self, addrs: Vec<SocketAddr>) {
        self.pending_lookups = self.pending_lookups.saturating_sub(1);
        for addr in addrs {
            if !self.candidates.contains(&addr) {
                self.candidates.push(addr);
            }
        }
    }

    pub fn lookup_failed(&mut self, host: &str) -> Fallout {
        self.pending_lookups = self.pending_lookups.saturating_sub(1);
        tracing::warn!("{} name lookup failed for {host}", self.protocol);
        if self.running && self.pending_lookups == 0 && self.candidates.is_empty() {
            self.give_up(NetError::NameLookupFailed)
        } else {
            Fallout::default()
        }
    }

    /// Advance timers: start a connect attempt when one is due, promote a
    /// long-lived link to validated, and drive keep-alive pings.
    pub fn update(&mut self, now: Instant, ctx: &LinkContext<'_>) -> Fallout {
        if !self.running || self.gave_up {
            return Fallout::default();
        }

        let Some(link) = self.link.as_mut() else {
            let due = self.next_attempt.is_none_or(|at| now >= at);
            if due && !self.candidates.is_empty() {
                self.start_connect(now, ctx);
            }
            return Fallout::default();
        };

        if link.phase != Phase::Connected {
            return Fallout::default();
        }

        if !link.validated
            && link
                .connected_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.policy.min_valid_connection)
        {
            link.validated = true;
        }

        if !self.ping_enabled {
            return Fallout::default();
        }

        let last_heard = self.last_heard.unwrap_or(now);
        match link.keepalive.poll(now, last_heard) {
            KeepAliveAction::Idle => Fallout::default(),
            KeepAliveAction::Send(ping) => {
                link.conn.send(ping);
                Fallout::default()
            }
            KeepAliveAction::Expired => {
                let id = link.conn.id();
                tracing::warn!("{} {id} ping timeout, dropping link", self.protocol);
                link.conn.close();
                self.on_disconnected(id, now)
            }
        }
    }

    fn start_connect(&mut self, now: Instant, ctx: &LinkContext<'_>) {
        let addr = self.candidates[self.next_candidate % self.candidates.len()];
        let id = ctx.ids.next_id();
        let conn = Conn::open(
            id,
            self.protocol,
            addr,
            Arc::clone(ctx.driver),
            Arc::clone(&self.live),
        );
        self.link = Some(Link {
            conn,
            phase: Phase::Connecting,
            connected_at: None,
            validated: false,
            keepalive: KeepAlive::new(self.policy.keepalive_config(), now),
        });
        self.next_attempt = None;
        tracing::debug!("{} {id} connecting to {addr}", self.protocol);
        let preamble = ConnectHeader::new(self.protocol, *ctx.product).encode();
        ctx.driver.connect(id, addr, preamble, ctx.events);
    }

    pub fn on_connected(&mut self, conn: ConnId, now: Instant) -> bool {
        let keepalive = KeepAlive::new(self.policy.keepalive_config(), now);
        let Some(link) = self.current_link(conn) else {
            return false;
        };
        link.phase = Phase::Connected;
        link.connected_at = Some(now);
        link.keepalive = keepalive;
        let addr = link.conn.addr();
        self.last_heard = Some(now);
        self.failed_connects = 0;
        self.backoff.reset();
        tracing::info!("{} {conn} connected to {addr}", self.protocol);
        true
    }

    pub fn on_connect_failed(&mut self, conn: ConnId, now: Instant) -> Fallout {
        if self.current_link(conn).is_none() {
            return Fallout::default();
        }
        self.link = None;
        self.next_candidate = self.next_candidate.wrapping_add(1);
        if !self.running {
            return Fallout::default();
        }

        self.failed_connects += 1;
        tracing::warn!(
            "{} {conn} connect failed ({}/{})",
            self.protocol,
            self.failed_connects,
            self.policy.max_failed_connects
        );
        if self.failed_connects >= self.policy.max_failed_connects || self.silent_for_too_long(now)
        {
            return self.give_up(NetError::ConnectFailed);
        }

        let delay = self.backoff.next_delay();
        self.next_attempt = Some(now + delay);
        tracing::debug!("{} reconnecting in {delay:?}", self.protocol);
        Fallout::default()
    }

    pub fn on_disconnected(&mut self, conn: ConnId, now: Instant) -> Fallout {
        let Some(link) = self.current_link(conn) else {
            return Fallout::default();
        };
        let was_connected = link.phase == Phase::Connected;
        let validated = link.validated;
        let uptime = link
            .connected_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        self.link = None;

        let mut fallout = Fallout::for_conn(conn, NetError::Disconnected);
        if !self.running || !was_connected {
            return fallout;
        }

        tracing::info!("{} {conn} disconnected after {uptime:?}", self.protocol);
        if self.silent_for_too_long(now) {
            let give_up = self.give_up(NetError::Disconnected);
            fallout.cancel_protocol = give_up.cancel_protocol;
            fallout.report = give_up.report;
            return fallout;
        }

        if validated || uptime >= self.policy.min_valid_connection {
            self.immediate_disconnects = 0;
            self.backoff.reset();
            self.next_attempt = Some(now + self.policy.min_reconnect_interval);
            return fallout;
        }

        self.immediate_disconnects += 1;
        if self.immediate_disconnects >= self.policy.max_immediate_disconnects {
            let give_up = self.give_up(NetError::Disconnected);
            fallout.cancel_protocol = give_up.cancel_protocol;
            fallout.report = give_up.report;
            return fallout;
        }
        self.next_attempt = Some(now + self.policy.max_reconnect_interval);
        fallout
    }

    /// Record inbound traffic. Returns `false` if `conn` is not this
    /// manager's connected link.
    pub fn on_read(&mut self, conn: ConnId, now: Instant) -> bool {
        let connected = self
            .current_link(conn)
            .is_some_and(|link| link.phase == Phase::Connected);
        if connected {
            self.last_heard = Some(now);
        }
        connected
    }

    pub fn on_pong(&mut self, conn: ConnId, body: &[u8], now: Instant) -> Option<Duration> {
        let link = self.current_link(conn)?;
        link.keepalive.on_pong(body, now)
    }

    pub fn keepalive_stats(&self) -> Option<KeepAliveStats> {
        self.link
            .as_ref()
            .filter(|link| link.phase == Phase::Connected)
            .map(|link| link.keepalive.stats())
    }

    /// A transaction succeeded on `conn`, so the server accepted us.
    pub fn mark_validated(&mut self, conn: ConnId) {
        if let Some(link) = self.current_link(conn) {
            link.validated = true;
        }
    }

    /// Drop the link after a protocol violation on it.
    pub fn force_disconnect(&mut self, conn: ConnId, now: Instant) -> Fallout {
        let Some(link) = self.current_link(conn) else {
            return Fallout::default();
        };
        link.conn.close();
        tracing::warn!("{} {conn} dropped after malformed message", self.protocol);
        self.on_disconnected(conn, now)
    }

    pub fn set_ping_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled && !self.ping_enabled {
            if let Some(link) = self.link.as_mut() {
                link.keepalive = KeepAlive::new(self.policy.keepalive_config(), now);
            }
            self.last_heard = Some(now);
        }
        self.ping_enabled = enabled;
    }

    /// The connected link transactions may bind to.
    pub fn active_conn(&self) -> Option<Arc<Conn>> {
        match &self.link {
            Some(link) if self.running && link.phase == Phase::Connected => {
                Some(Arc::clone(&link.conn))
            }
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.active_conn().is_some()
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.active_conn().map(|conn| conn.id())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn failed_connects(&self) -> u32 {
        self.failed_connects
    }

    pub fn immediate_disconnects(&self) -> u32 {
        self.immediate_disconnects
    }

    /// Earliest time the next connect attempt may start.
    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Connections of this protocol not yet released by every holder.
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn current_link(&mut self, conn: ConnId) -> Option<&mut Link> {
        self.link.as_mut().filter(|link| link.conn.id() == conn)
    }

    fn take_link(&mut self) -> Option<ConnId> {
        let link = self.link.take()?;
        link.conn.close();
        Some(link.conn.id())
    }

    fn reset_counters(&mut self, now: Instant) {
        self.gave_up = false;
        self.failed_connects = 0;
        self.immediate_disconnects = 0;
        self.backoff.reset();
        self.next_attempt = None;
        self.last_heard = Some(now);
    }

    fn silent_for_too_long(&self, now: Instant) -> bool {
        self.last_heard
            .is_some_and(|at| now.saturating_duration_since(at) >= self.policy.disconnected_timeout)
    }

    fn give_up(&mut self, error: NetError) -> Fallout {
        self.gave_up = true;
        self.next_attempt = None;
        tracing::error!("{} giving up on connection: {error}", self.protocol);
        Fallout {
            cancel_conn: None,
            cancel_protocol: Some(error.clone()),
            report: Some(error),
        }
    }
}
