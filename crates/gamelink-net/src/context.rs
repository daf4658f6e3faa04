//! The network context: one connection manager per protocol, the pending
//! transaction table, and the per-tick update that drives them.
//!
//! Locking: the registry lock may be held while briefly taking a manager
//! lock, never the other way round. Completion hooks, the error hook and
//! notify handlers all run with no lock held, so they may submit follow-up
//! transactions.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use gamelink_config::{Config, ConfigError};

use crate::conn::{ConnId, ConnIdGenerator, ConnManager, ConnPolicy, Fallout, LinkContext};
use crate::error::{NetError, TransResult};
use crate::framing::Envelope;
use crate::keepalive::KeepAliveStats;
use crate::protocol::{ProductInfo, Protocol};
use crate::registry::{Finished, RecvDisposition, TransRegistry};
use crate::socket::{EventReceiver, EventSender, SocketDriver, SocketEvent, event_channel};
use crate::trans::{TransId, TransState, Transaction};
use crate::transactions::wait::WaitTrans;

/// Engine settings resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: ConnPolicy,
    pub default_timeout: Duration,
    pub tick_interval: Duration,
    pub default_port: u16,
    pub product: ProductInfo,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            policy: ConnPolicy::from(&config.connection),
            default_timeout: Duration::from_millis(config.transactions.default_timeout_ms),
            tick_interval: Duration::from_millis(config.transactions.tick_interval_ms),
            default_port: config.servers.port,
            product: ProductInfo::from_config(&config.product)?,
        })
    }
}

/// Receives connection-level failures, once per failure.
pub type ErrorHook = Arc<dyn Fn(Protocol, &NetError) + Send + Sync>;

/// Receives unsolicited server messages (transaction id 0) for a protocol.
pub type NotifyHandler = Arc<dyn Fn(u16, &[u8]) + Send + Sync>;

enum Address {
    Resolved(SocketAddr),
    Lookup(String, u16),
}

/// Split a configured server string into an address or a name to resolve.
/// Accepts `ip`, `ip:port`, `[v6]:port`, `host` and `host:port`.
fn parse_address(addr: &str, default_port: u16) -> Address {
    let addr = addr.trim();
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Address::Resolved(sock);
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Address::Resolved(SocketAddr::new(ip, default_port));
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => Address::Lookup(host.to_string(), port),
            Err(_) => Address::Lookup(addr.to_string(), default_port),
        },
        _ => Address::Lookup(addr.to_string(), default_port),
    }
}

pub struct NetworkContext {
    config: EngineConfig,
    driver: Arc<dyn SocketDriver>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    ids: ConnIdGenerator,
    managers: Vec<Mutex<ConnManager>>,
    registry: Mutex<TransRegistry>,
    error_hook: RwLock<ErrorHook>,
    notify_handlers: RwLock<HashMap<Protocol, NotifyHandler>>,
    update_lock: Mutex<()>,
}

/// Work collected during a tick and carried out once every lock is released.
#[derive(Default)]
struct TickOutput {
    fallouts: Vec<(Protocol, Fallout)>,
    notifications: Vec<(Protocol, Envelope)>,
    finished: Vec<Finished>,
    reports: Vec<(Protocol, NetError)>,
}

impl NetworkContext {
    pub fn new(config: EngineConfig, driver: Arc<dyn SocketDriver>) -> Self {
        let (events_tx, events_rx) = event_channel();
        let managers = Protocol::ALL
            .iter()
            .map(|protocol| Mutex::new(ConnManager::new(*protocol, config.policy.clone())))
            .collect();
        let default_hook: ErrorHook = Arc::new(|protocol: Protocol, error: &NetError| {
            tracing::error!("{protocol} connection error: {error}");
        });
        Self {
            config,
            driver,
            events_tx,
            events_rx,
            ids: ConnIdGenerator::new(),
            managers,
            registry: Mutex::new(TransRegistry::new()),
            error_hook: RwLock::new(default_hook),
            notify_handlers: RwLock::new(HashMap::new()),
            update_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Channel on which socket drivers report events.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Replace the connection-failure hook. The default logs the error.
    pub fn set_error_hook(&self, hook: impl Fn(Protocol, &NetError) + Send + Sync + 'static) {
        *self.error_hook.write() = Arc::new(hook);
    }

    pub fn set_notify_handler(
        &self,
        protocol: Protocol,
        handler: impl Fn(u16, &[u8]) + Send + Sync + 'static,
    ) {
        self.notify_handlers
            .write()
            .insert(protocol, Arc::new(handler));
    }

    fn manager(&self, protocol: Protocol) -> &Mutex<ConnManager> {
        &self.managers[protocol.index()]
    }

    // ---------------------------------------------------------------------
    // Per-protocol connection control
    // ---------------------------------------------------------------------

    /// Start connecting `protocol` to the given servers. Host names are
    /// resolved in the background; nothing here blocks.
    pub fn initialize(&self, protocol: Protocol, addrs: &[String]) {
        let mut resolved = Vec::new();
        let mut lookups = Vec::new();
        for addr in addrs {
            match parse_address(addr, self.config.default_port) {
                Address::Resolved(sock) => resolved.push(sock),
                Address::Lookup(host, port) => lookups.push((host, port)),
            }
        }
        if resolved.is_empty() && lookups.is_empty() {
            tracing::warn!("{protocol} initialized without any server address");
        }

        let fallout = self
            .manager(protocol)
            .lock()
            .initialize(resolved, lookups.len(), Instant::now());
        for (host, port) in lookups {
            self.driver.lookup(protocol, host, port, &self.events_tx);
        }
        self.apply_now(protocol, fallout);
    }

    /// Stop `protocol`: cancel its transactions with
    /// [`NetError::RemoteShutdown`] and drop its connection. With `wait`,
    /// keep ticking until every reference to the socket is gone.
    pub fn destroy(&self, protocol: Protocol, wait: bool) {
        let abandoned = self.manager(protocol).lock().abandon();
        let mut finished = self
            .registry
            .lock()
            .cancel_by_protocol(protocol, NetError::RemoteShutdown);
        if let Some(conn) = abandoned {
            tracing::info!("{protocol} {conn} abandoned");
            finished.extend(
                self.registry
                    .lock()
                    .cancel_by_conn(conn, NetError::RemoteShutdown),
            );
        }
        Finished::post_all(finished);

        if wait {
            while self.manager(protocol).lock().live_connections() > 0 {
                self.try_update();
                std::thread::sleep(self.config.tick_interval);
            }
        }
    }

    pub fn query_connected(&self, protocol: Protocol) -> bool {
        self.manager(protocol).lock().is_connected()
    }

    pub fn conn_id(&self, protocol: Protocol) -> Option<ConnId> {
        self.manager(protocol).lock().conn_id()
    }

    pub fn ping_enable(&self, protocol: Protocol, enabled: bool) {
        self.ping_enable_at(protocol, enabled, Instant::now());
    }

    /// Turn keep-alive pings on or off as of `now`. Turning them on pings
    /// at once and restarts the silence clock.
    pub fn ping_enable_at(&self, protocol: Protocol, enabled: bool, now: Instant) {
        self.manager(protocol).lock().set_ping_enabled(enabled, now);
    }

    /// Keep-alive counters and recent round-trip average of the protocol's
    /// connected link.
    pub fn keepalive_stats(&self, protocol: Protocol) -> Option<KeepAliveStats> {
        self.manager(protocol).lock().keepalive_stats()
    }

    /// Clear a protocol's give-up state so reconnect attempts resume.
    pub fn reset_connectivity(&self, protocol: Protocol) {
        self.manager(protocol)
            .lock()
            .reset_connectivity(Instant::now());
    }

    /// Connections of `protocol` still referenced by the manager or by
    /// pending transactions.
    pub fn live_connections(&self, protocol: Protocol) -> usize {
        self.manager(protocol).lock().live_connections()
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Submit a transaction with the default timeout. It is sent right away
    /// if its protocol is connected. On error the transaction is dropped
    /// without being posted.
    pub fn send(&self, trans: Box<dyn Transaction>) -> Result<TransId, NetError> {
        self.submit(trans, self.config.default_timeout, Instant::now())
    }

    pub fn send_with_timeout(
        &self,
        trans: Box<dyn Transaction>,
        timeout: Duration,
    ) -> Result<TransId, NetError> {
        self.submit(trans, timeout, Instant::now())
    }

    /// Submit and block until the transaction has posted, ticking the
    /// context meanwhile. Works with or without a running dispatcher, but
    /// must not be called from inside a completion hook.
    pub fn send_and_wait(&self, trans: Box<dyn Transaction>) -> TransResult {
        let (wait, mut done) = WaitTrans::new(trans);
        self.send(Box::new(wait))?;
        loop {
            match done.try_recv() {
                Ok(result) => return result,
                Err(tokio::sync::oneshot::error::TryRecvError::Empty) => {
                    self.update();
                    std::thread::sleep(self.config.tick_interval);
                }
                Err(tokio::sync::oneshot::error::TryRecvError::Closed) => {
                    return Err(NetError::Cancelled);
                }
            }
        }
    }

    pub(crate) fn submit(
        &self,
        trans: Box<dyn Transaction>,
        timeout: Duration,
        now: Instant,
    ) -> Result<TransId, NetError> {
        let protocol = trans.protocol();
        let mut registry = self.registry.lock();
        let id = registry.insert(trans, timeout, now)?;
        let conn = self.manager(protocol).lock().active_conn();
        if let Some(conn) = conn {
            registry.start(id, &conn, now);
        }
        Ok(id)
    }

    /// Route a reply to a pending transaction. Returns `false` if the reply
    /// was malformed and the connection must be dropped. Replies for ids
    /// that are no longer pending are ignored.
    pub fn recv(&self, conn: ConnId, id: TransId, msg_id: u16, body: &[u8]) -> bool {
        let disposition = self.registry.lock().recv(conn, id, msg_id, body);
        match disposition {
            RecvDisposition::Unmatched => {
                tracing::debug!("{conn} dropped reply for {id}, no longer pending");
                true
            }
            RecvDisposition::Pending => true,
            RecvDisposition::Completed(ok) => {
                if ok && let Some(manager) = self.owner_of(conn) {
                    manager.lock().mark_validated(conn);
                }
                true
            }
            RecvDisposition::Malformed => false,
        }
    }

    pub fn cancel(&self, id: TransId, error: NetError) -> bool {
        let finished = self.registry.lock().cancel(id, error);
        match finished {
            Some(trans) => {
                trans.post();
                true
            }
            None => false,
        }
    }

    pub fn cancel_by_protocol(&self, protocol: Protocol, error: NetError) {
        let finished = self.registry.lock().cancel_by_protocol(protocol, error);
        Finished::post_all(finished);
    }

    pub fn cancel_by_conn_id(&self, conn: ConnId, error: NetError) {
        let finished = self.registry.lock().cancel_by_conn(conn, error);
        Finished::post_all(finished);
    }

    pub fn cancel_all(&self, error: NetError) {
        let finished = self.registry.lock().cancel_all(error);
        Finished::post_all(finished);
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn pending_count_for(&self, protocol: Protocol) -> usize {
        self.registry.lock().count_for(protocol)
    }

    pub fn state(&self, id: TransId) -> Option<TransState> {
        self.registry.lock().state(id)
    }

    // ---------------------------------------------------------------------
    // Tick
    // ---------------------------------------------------------------------

    pub fn update(&self) {
        self.update_at(Instant::now());
    }

    /// Run one tick as of `now`. Ticks are serialized; delivery happens
    /// after the tick lock is released, so hooks may tick again.
    pub fn update_at(&self, now: Instant) {
        let out = {
            let _tick = self.update_lock.lock();
            self.collect(now)
        };
        self.deliver(out);
    }

    /// Tick unless another thread is mid-tick.
    fn try_update(&self) {
        let Some(tick) = self.update_lock.try_lock() else {
            return;
        };
        let out = self.collect(Instant::now());
        drop(tick);
        self.deliver(out);
    }

    fn collect(&self, now: Instant) -> TickOutput {
        let mut out = TickOutput::default();

        for event in self.events_rx.try_iter() {
            self.handle_event(event, now, &mut out);
        }

        let link_ctx = LinkContext {
            driver: &self.driver,
            ids: &self.ids,
            events: &self.events_tx,
            product: &self.config.product,
        };
        for protocol in Protocol::ALL {
            let fallout = self.manager(protocol).lock().update(now, &link_ctx);
            if !fallout.is_empty() {
                out.fallouts.push((protocol, fallout));
            }
        }

        {
            let mut registry = self.registry.lock();
            for (protocol, fallout) in std::mem::take(&mut out.fallouts) {
                if let Some((conn, error)) = fallout.cancel_conn {
                    out.finished.extend(registry.cancel_by_conn(conn, error));
                }
                if let Some(error) = fallout.cancel_protocol {
                    out.finished
                        .extend(registry.cancel_by_protocol(protocol, error));
                }
                if let Some(error) = fallout.report {
                    out.reports.push((protocol, error));
                }
            }

            for protocol in Protocol::ALL {
                let conn = self.manager(protocol).lock().active_conn();
                if let Some(conn) = conn {
                    registry.start_waiting(&conn, now);
                }
            }

            registry.expire(now);
            out.finished.extend(registry.take_completed());
            registry.advance_tick();
        }

        out
    }

    fn handle_event(&self, event: SocketEvent, now: Instant, out: &mut TickOutput) {
        match event {
            SocketEvent::Connected { conn } => {
                for manager in &self.managers {
                    if manager.lock().on_connected(conn, now) {
                        break;
                    }
                }
            }
            SocketEvent::ConnectFailed { conn } => {
                for manager in &self.managers {
                    let mut manager = manager.lock();
                    let fallout = manager.on_connect_failed(conn, now);
                    if !fallout.is_empty() {
                        out.fallouts.push((manager.protocol(), fallout));
                    }
                }
            }
            SocketEvent::Disconnected { conn } => {
                for manager in &self.managers {
                    let mut manager = manager.lock();
                    let fallout = manager.on_disconnected(conn, now);
                    if !fallout.is_empty() {
                        out.fallouts.push((manager.protocol(), fallout));
                    }
                }
            }
            SocketEvent::Read { conn, envelope } => self.handle_read(conn, envelope, now, out),
            SocketEvent::Resolved { protocol, addrs } => {
                tracing::debug!("{protocol} resolved {} address(es)", addrs.len());
                self.manager(protocol).lock().add_resolved(addrs);
            }
            SocketEvent::LookupFailed { protocol, host } => {
                let fallout = self.manager(protocol).lock().lookup_failed(&host);
                if !fallout.is_empty() {
                    out.fallouts.push((protocol, fallout));
                }
            }
        }
    }

    fn handle_read(&self, conn: ConnId, envelope: Envelope, now: Instant, out: &mut TickOutput) {
        let owner = self.managers.iter().find_map(|manager| {
            let mut manager = manager.lock();
            manager.on_read(conn, now).then(|| manager.protocol())
        });

        if envelope.is_keepalive() {
            if let Some(protocol) = owner
                && let Some(rtt) = self.manager(protocol).lock().on_pong(conn, &envelope.body, now)
            {
                tracing::trace!("{protocol} {conn} keep-alive rtt {rtt:?}");
            }
            return;
        }

        let Some(id) = TransId::from_raw(envelope.trans_id) else {
            match owner {
                Some(protocol) => out.notifications.push((protocol, envelope)),
                None => tracing::debug!("{conn} dropped notification from stale link"),
            }
            return;
        };

        if !self.recv(conn, id, envelope.msg_id, &envelope.body)
            && let Some(protocol) = owner
        {
            let fallout = self.manager(protocol).lock().force_disconnect(conn, now);
            if !fallout.is_empty() {
                out.fallouts.push((protocol, fallout));
            }
        }
    }

    fn owner_of(&self, conn: ConnId) -> Option<&Mutex<ConnManager>> {
        self.managers
            .iter()
            .find(|manager| manager.lock().conn_id() == Some(conn))
    }

    /// Apply a fallout produced outside the tick.
    fn apply_now(&self, protocol: Protocol, fallout: Fallout) {
        let mut out = TickOutput::default();
        {
            let mut registry = self.registry.lock();
            if let Some((conn, error)) = fallout.cancel_conn {
                out.finished.extend(registry.cancel_by_conn(conn, error));
            }
            if let Some(error) = fallout.cancel_protocol {
                out.finished
                    .extend(registry.cancel_by_protocol(protocol, error));
            }
        }
        if let Some(error) = fallout.report {
            out.reports.push((protocol, error));
        }
        self.deliver(out);
    }

    /// Report errors, post finished transactions, then hand notifications
    /// to their handlers.
    fn deliver(&self, out: TickOutput) {
        if !out.reports.is_empty() {
            let hook = Arc::clone(&self.error_hook.read());
            for (protocol, error) in &out.reports {
                hook(*protocol, error);
            }
        }

        Finished::post_all(out.finished);

        for (protocol, envelope) in out.notifications {
            let handler = self.notify_handlers.read().get(&protocol).cloned();
            match handler {
                Some(handler) => handler(envelope.msg_id, &envelope.body),
                None => tracing::debug!(
                    "{protocol} no handler for notification {}",
                    envelope.msg_id
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{PostLog, Probe, RecordingDriver};

    struct Engine {
        driver: Arc<RecordingDriver>,
        ctx: NetworkContext,
        events: EventSender,
    }

    fn engine() -> Engine {
        let mut config = EngineConfig::from_config(&Config::default()).unwrap();
        config.policy.ping_enabled = false;
        config.policy.reconnect_jitter = 0.0;
        engine_with(config)
    }

    fn engine_with(config: EngineConfig) -> Engine {
        let driver = Arc::new(RecordingDriver::default());
        let ctx = NetworkContext::new(config, driver.clone());
        let events = ctx.event_sender();
        Engine {
            driver,
            ctx,
            events,
        }
    }

    impl Engine {
        fn connect(&self, protocol: Protocol, now: Instant) -> ConnId {
            self.ctx.initialize(protocol, &["10.0.0.1:14617".to_string()]);
            self.ctx.update_at(now);
            let conn = self.driver.connects().last().unwrap().0;
            self.events.send(SocketEvent::Connected { conn }).unwrap();
            conn
        }

        fn reply(&self, conn: ConnId, id: TransId, body: &[u8]) {
            self.events
                .send(SocketEvent::Read {
                    conn,
                    envelope: Envelope::new(1, id.get(), body.to_vec()),
                })
                .unwrap();
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_parse_address_forms() {
        assert!(matches!(
            parse_address("10.1.2.3", 14617),
            Address::Resolved(a) if a == "10.1.2.3:14617".parse().unwrap()
        ));
        assert!(matches!(
            parse_address("10.1.2.3:80", 14617),
            Address::Resolved(a) if a.port() == 80
        ));
        assert!(matches!(
            parse_address("::1", 14617),
            Address::Resolved(a) if a.is_ipv6() && a.port() == 14617
        ));
        assert!(matches!(
            parse_address("gk.example.net", 14617),
            Address::Lookup(ref h, 14617) if h == "gk.example.net"
        ));
        assert!(matches!(
            parse_address("gk.example.net:9000", 14617),
            Address::Lookup(ref h, 9000) if h == "gk.example.net"
        ));
    }

    #[test]
    fn test_game_timeout_after_late_connect() {
        let e = engine();
        let log = PostLog::default();
        let t0 = Instant::now();

        e.ctx.initialize(Protocol::Game, &["10.0.0.1".to_string()]);
        let id = e
            .ctx
            .submit(Probe::new(Protocol::Game, &log, 1).boxed(), ms(1000), t0)
            .unwrap();
        e.ctx.update_at(t0);
        assert_eq!(e.ctx.state(id), Some(TransState::WaitServerConnect));

        let conn = e.driver.connects()[0].0;
        e.events.send(SocketEvent::Connected { conn }).unwrap();
        e.ctx.update_at(t0 + ms(50));
        assert_eq!(e.ctx.state(id), Some(TransState::WaitServerResponse));
        assert_eq!(e.driver.requests().len(), 1);

        e.ctx.update_at(t0 + ms(1049));
        assert!(log.results().is_empty());

        e.ctx.update_at(t0 + ms(1050));
        assert_eq!(log.results(), vec![(1, Err(NetError::Timeout))]);

        e.ctx.update_at(t0 + ms(2000));
        assert_eq!(log.results().len(), 1);
        assert_eq!(e.ctx.pending_count(), 0);
    }

    #[test]
    fn test_deferred_waits_for_same_tick_response() {
        let e = engine();
        let log = PostLog::default();
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Auth, t0);
        e.ctx.update_at(t0 + ms(10));

        let b = e
            .ctx
            .submit(Probe::new(Protocol::Auth, &log, 2).boxed(), ms(60_000), t0 + ms(20))
            .unwrap();
        let c = e
            .ctx
            .submit(
                Probe::new(Protocol::Auth, &log, 3).deferred().boxed(),
                ms(60_000),
                t0 + ms(20),
            )
            .unwrap();

        e.reply(conn, c, &[0]);
        e.ctx.update_at(t0 + ms(30));
        assert!(log.results().is_empty());

        e.reply(conn, b, &[0]);
        e.ctx.update_at(t0 + ms(40));
        assert_eq!(log.tags(), vec![2, 3]);
    }

    #[test]
    fn test_send_starts_immediately_when_connected() {
        let e = engine();
        let log = PostLog::default();
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Game, t0);
        e.ctx.update_at(t0 + ms(10));
        assert!(e.ctx.query_connected(Protocol::Game));
        assert_eq!(e.ctx.conn_id(Protocol::Game), Some(conn));

        let id = e
            .ctx
            .send(Probe::new(Protocol::Game, &log, 1).boxed())
            .unwrap();
        assert_eq!(e.ctx.state(id), Some(TransState::WaitServerResponse));
        let (sent_on, envelope) = e.driver.requests().pop().unwrap();
        assert_eq!(sent_on, conn);
        assert_eq!(envelope.trans_id, id.get());

        e.reply(conn, id, &[0]);
        e.ctx.update_at(t0 + ms(20));
        assert_eq!(log.results(), vec![(1, Ok(()))]);
    }

    #[test]
    fn test_disconnect_cancels_bound_transactions() {
        let e = engine();
        let log = PostLog::default();
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Game, t0);
        e.ctx.update_at(t0 + ms(10));
        e.ctx
            .submit(Probe::new(Protocol::Game, &log, 1).boxed(), ms(60_000), t0 + ms(10))
            .unwrap();

        e.events.send(SocketEvent::Disconnected { conn }).unwrap();
        e.ctx.update_at(t0 + ms(20));
        assert_eq!(log.results(), vec![(1, Err(NetError::Disconnected))]);
        assert!(!e.ctx.query_connected(Protocol::Game));
        assert_eq!(e.ctx.live_connections(Protocol::Game), 0);
    }

    #[test]
    fn test_malformed_reply_drops_connection() {
        let e = engine();
        let log = PostLog::default();
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Csr, t0);
        e.ctx.update_at(t0 + ms(10));
        let bad = e
            .ctx
            .submit(Probe::new(Protocol::Csr, &log, 1).boxed(), ms(60_000), t0 + ms(10))
            .unwrap();
        e.ctx
            .submit(Probe::new(Protocol::Csr, &log, 2).boxed(), ms(60_000), t0 + ms(10))
            .unwrap();

        e.reply(conn, bad, &[]);
        e.ctx.update_at(t0 + ms(20));

        let results = log.results();
        assert!(results.contains(&(1, Err(NetError::ProtocolViolation))));
        assert!(results.contains(&(2, Err(NetError::Disconnected))));
        assert!(e.driver.disconnects().contains(&conn));
        assert!(!e.ctx.query_connected(Protocol::Csr));
    }

    #[test]
    fn test_unknown_reply_ignored() {
        let e = engine();
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Game, t0);
        e.ctx.update_at(t0 + ms(10));
        let stale = TransId::from_raw(0x0030_0009).unwrap();
        assert!(e.ctx.recv(conn, stale, 1, &[0]));
        e.reply(conn, stale, &[0]);
        e.ctx.update_at(t0 + ms(20));
        assert!(e.ctx.query_connected(Protocol::Game));
    }

    #[test]
    fn test_destroy_cancels_with_remote_shutdown() {
        let e = engine();
        let log = PostLog::default();
        let t0 = Instant::now();
        e.connect(Protocol::File, t0);
        e.ctx.update_at(t0 + ms(10));
        e.ctx
            .submit(Probe::new(Protocol::File, &log, 1).boxed(), ms(60_000), t0 + ms(10))
            .unwrap();
        e.ctx
            .submit(Probe::new(Protocol::Game, &log, 2).boxed(), ms(60_000), t0 + ms(10))
            .unwrap();

        e.ctx.destroy(Protocol::File, true);
        assert_eq!(log.results(), vec![(1, Err(NetError::RemoteShutdown))]);
        assert_eq!(e.ctx.pending_count_for(Protocol::File), 0);
        assert_eq!(e.ctx.pending_count_for(Protocol::Game), 1);
        assert_eq!(e.ctx.live_connections(Protocol::File), 0);
        assert!(!e.ctx.query_connected(Protocol::File));
    }

    #[test]
    fn test_give_up_reports_once_and_cancels_waiting() {
        let mut config = EngineConfig::from_config(&Config::default()).unwrap();
        config.policy.ping_enabled = false;
        config.policy.reconnect_jitter = 0.0;
        config.policy.max_failed_connects = 2;
        let e = engine_with(config);
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        e.ctx
            .set_error_hook(move |protocol, error| sink.lock().push((protocol, error.clone())));
        let log = PostLog::default();
        let t0 = Instant::now();

        e.ctx.initialize(Protocol::GateKeeper, &["10.0.0.9".to_string()]);
        e.ctx
            .submit(Probe::new(Protocol::GateKeeper, &log, 1).boxed(), ms(60_000), t0)
            .unwrap();
        e.ctx.update_at(t0);
        let first = e.driver.connects()[0].0;
        e.events.send(SocketEvent::ConnectFailed { conn: first }).unwrap();
        e.ctx.update_at(t0 + ms(10));
        e.ctx.update_at(t0 + ms(510));
        let second = e.driver.connects()[1].0;
        e.events.send(SocketEvent::ConnectFailed { conn: second }).unwrap();
        e.ctx.update_at(t0 + ms(520));
        e.ctx.update_at(t0 + ms(10_000));

        assert_eq!(e.driver.connects().len(), 2);
        assert_eq!(
            *reports.lock(),
            vec![(Protocol::GateKeeper, NetError::ConnectFailed)]
        );
        assert_eq!(log.results(), vec![(1, Err(NetError::ConnectFailed))]);

        e.ctx.reset_connectivity(Protocol::GateKeeper);
        e.ctx.update_at(Instant::now());
        assert_eq!(e.driver.connects().len(), 3);
    }

    #[test]
    fn test_notifications_follow_responses() {
        let e = engine();
        let log = PostLog::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let order = log.clone();
        e.ctx.set_notify_handler(Protocol::Game, move |msg_id, body| {
            sink.lock().push((msg_id, body.to_vec(), order.tags().len()));
        });
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Game, t0);
        e.ctx.update_at(t0 + ms(10));
        let id = e
            .ctx
            .submit(Probe::new(Protocol::Game, &log, 1).boxed(), ms(60_000), t0 + ms(10))
            .unwrap();

        e.events
            .send(SocketEvent::Read {
                conn,
                envelope: Envelope::new(40, 0, b"propagated".to_vec()),
            })
            .unwrap();
        e.reply(conn, id, &[0]);
        e.ctx.update_at(t0 + ms(20));

        assert_eq!(*seen.lock(), vec![(40, b"propagated".to_vec(), 1)]);
    }

    #[test]
    fn test_hostnames_go_through_lookup() {
        let e = engine();
        let t0 = Instant::now();
        e.ctx.initialize(
            Protocol::GateKeeper,
            &["gk.example.net".to_string(), "10.0.0.2".to_string()],
        );
        assert_eq!(
            e.driver.lookups(),
            vec![(Protocol::GateKeeper, "gk.example.net".to_string(), 14617)]
        );
        e.ctx.update_at(t0);
        assert_eq!(
            e.driver.connects()[0].1,
            "10.0.0.2:14617".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_lookup_failure_reported() {
        let e = engine();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        e.ctx
            .set_error_hook(move |_, error| sink.lock().push(error.clone()));
        e.ctx
            .initialize(Protocol::GateKeeper, &["nowhere.invalid".to_string()]);
        e.events
            .send(SocketEvent::LookupFailed {
                protocol: Protocol::GateKeeper,
                host: "nowhere.invalid".to_string(),
            })
            .unwrap();
        e.ctx.update_at(Instant::now());
        assert_eq!(*reports.lock(), vec![NetError::NameLookupFailed]);
    }

    #[test]
    fn test_completion_hook_can_submit_follow_up() {
        use crate::transactions::RequestTrans;

        let e = Arc::new(engine());
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Auth, t0);
        e.ctx.update_at(t0 + ms(10));

        let inner = Arc::clone(&e);
        let follow_up = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&follow_up);
        let first = e
            .ctx
            .send(Box::new(
                RequestTrans::new(Protocol::Auth, 3, Vec::new(), move |result, _| {
                    assert_eq!(result, Ok(()));
                    let next = RequestTrans::new(Protocol::Auth, 4, Vec::new(), |_, _| {});
                    *slot.lock() = inner.ctx.send(Box::new(next)).ok();
                })
                .with_sub_trans(),
            ))
            .unwrap();

        e.reply(conn, first, &0u32.to_le_bytes());
        e.ctx.update_at(t0 + ms(20));
        let next = follow_up.lock().expect("follow-up submitted");
        assert_eq!(e.ctx.state(next), Some(TransState::WaitServerResponse));
    }

    #[test]
    fn test_completion_hook_can_destroy_and_wait() {
        use crate::transactions::RequestTrans;

        let e = Arc::new(engine());
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Game, t0);
        e.ctx.update_at(t0 + ms(10));

        let inner = Arc::downgrade(&e);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let first = e
            .ctx
            .send(Box::new(RequestTrans::new(
                Protocol::Game,
                3,
                Vec::new(),
                move |result, _| {
                    if let Some(e) = inner.upgrade() {
                        e.ctx.destroy(Protocol::Game, true);
                        *sink.lock() = Some((result, e.ctx.live_connections(Protocol::Game)));
                    }
                },
            )))
            .unwrap();
        let log = PostLog::default();
        let second = e
            .ctx
            .send(Probe::new(Protocol::Game, &log, 2).boxed())
            .unwrap();
        e.reply(conn, first, &0u32.to_le_bytes());
        e.reply(conn, second, &[0]);

        let ticker = {
            let e = Arc::clone(&e);
            std::thread::spawn(move || e.ctx.update_at(t0 + ms(20)))
        };
        let start = Instant::now();
        while !ticker.is_finished() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(ms(5));
        }
        assert!(ticker.is_finished(), "tick blocked inside completion hook");
        ticker.join().unwrap();

        assert_eq!(*seen.lock(), Some((Ok(()), 0)));
        assert_eq!(log.results(), vec![(2, Ok(()))]);
        assert!(!e.ctx.query_connected(Protocol::Game));
    }

    #[test]
    fn test_concurrent_callers_post_exactly_once() {
        use std::collections::HashSet;
        use std::thread;

        use crate::dispatcher::Dispatcher;

        const THREADS: u32 = 4;
        const PER_THREAD: u32 = 50;

        let driver = Arc::new(RecordingDriver::default());
        let mut config = EngineConfig::from_config(&Config::default()).unwrap();
        config.policy.ping_enabled = false;
        config.tick_interval = ms(1);
        let ctx = Arc::new(NetworkContext::new(config, driver.clone()));
        ctx.initialize(Protocol::Game, &["10.0.0.1:14617".to_string()]);
        ctx.update();
        let conn = driver.connects()[0].0;
        ctx.event_sender()
            .send(SocketEvent::Connected { conn })
            .unwrap();
        ctx.update();
        assert!(ctx.query_connected(Protocol::Game));

        let dispatcher = Dispatcher::spawn(Arc::clone(&ctx)).unwrap();
        let log = PostLog::default();
        let submitters: Vec<_> = (0..THREADS)
            .map(|t| {
                let ctx = Arc::clone(&ctx);
                let log = log.clone();
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    for i in 0..PER_THREAD {
                        let protocol = if i % 3 == 0 { Protocol::Csr } else { Protocol::Game };
                        let trans = Probe::new(protocol, &log, t * 1000 + i).boxed();
                        let id = ctx.send_with_timeout(trans, ms(20)).unwrap();
                        if i % 2 == 0 {
                            ctx.cancel(id, NetError::Cancelled);
                        }
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();
        let sweeper = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                for _ in 0..20 {
                    ctx.cancel_by_protocol(Protocol::Csr, NetError::RemoteShutdown);
                    thread::sleep(ms(1));
                }
            })
        };

        let ids: Vec<TransId> = submitters
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        sweeper.join().unwrap();
        let unique: HashSet<TransId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());

        let total = (THREADS * PER_THREAD) as usize;
        let start = Instant::now();
        while log.tags().len() < total && start.elapsed() < Duration::from_secs(10) {
            thread::sleep(ms(5));
        }
        thread::sleep(ms(20));
        drop(dispatcher);

        let mut tags = log.tags();
        tags.sort_unstable();
        let expected: Vec<u32> = (0..THREADS)
            .flat_map(|t| (0..PER_THREAD).map(move |i| t * 1000 + i))
            .collect();
        assert_eq!(tags, expected);
        assert_eq!(ctx.pending_count(), 0);
    }

    #[test]
    fn test_ping_enable_toggles_keepalive() {
        let mut config = EngineConfig::from_config(&Config::default()).unwrap();
        config.policy.reconnect_jitter = 0.0;
        config.policy.ping_enabled = true;
        let e = engine_with(config);
        let pings = || {
            e.driver
                .sent()
                .iter()
                .filter(|(_, envelope)| envelope.is_keepalive())
                .count()
        };

        let t0 = Instant::now();
        e.connect(Protocol::Csr, t0);
        e.ctx.update_at(t0 + ms(10));
        assert_eq!(pings(), 1);

        e.ctx.ping_enable_at(Protocol::Csr, false, t0 + ms(20));
        let quiet = t0 + Duration::from_secs(400);
        e.ctx.update_at(quiet);
        assert_eq!(pings(), 1);
        assert!(e.ctx.query_connected(Protocol::Csr));

        e.ctx.ping_enable_at(Protocol::Csr, true, quiet);
        e.ctx.update_at(quiet);
        assert_eq!(pings(), 2);
        e.ctx.update_at(quiet + Duration::from_secs(10));
        assert!(e.ctx.query_connected(Protocol::Csr));
        assert_eq!(
            e.ctx.keepalive_stats(Protocol::Csr).map(|stats| stats.pings_sent),
            Some(1)
        );
    }

    #[test]
    fn test_keepalive_stats_track_echoes() {
        let mut config = EngineConfig::from_config(&Config::default()).unwrap();
        config.policy.ping_enabled = true;
        let e = engine_with(config);
        let t0 = Instant::now();
        let conn = e.connect(Protocol::Game, t0);
        assert_eq!(e.ctx.keepalive_stats(Protocol::Game), None);
        e.ctx.update_at(t0 + ms(10));

        let (_, ping) = e.driver.sent().pop().unwrap();
        assert!(ping.is_keepalive());
        e.events
            .send(SocketEvent::Read {
                conn,
                envelope: ping,
            })
            .unwrap();
        e.ctx.update_at(t0 + ms(50));

        let stats = e.ctx.keepalive_stats(Protocol::Game).unwrap();
        assert_eq!(stats.pings_sent, 1);
        assert_eq!(stats.pongs_received, 1);
        assert_eq!(stats.average_rtt, Some(ms(40)));
    }

    #[test]
    fn test_cancel_by_conn_id_only_touches_bound() {
        let e = engine();
        let log = PostLog::default();
        let t0 = Instant::now();
        let game = e.connect(Protocol::Game, t0);
        let auth = e.connect(Protocol::Auth, t0);
        e.ctx.update_at(t0 + ms(10));
        assert_ne!(game, auth);

        let batch = [
            (1, Protocol::Game),
            (2, Protocol::Auth),
            (3, Protocol::Game),
            (4, Protocol::File),
        ];
        for (tag, protocol) in batch {
            e.ctx
                .submit(Probe::new(protocol, &log, tag).boxed(), ms(60_000), t0 + ms(10))
                .unwrap();
        }

        e.ctx.cancel_by_conn_id(game, NetError::Cancelled);
        assert_eq!(
            log.results(),
            vec![(1, Err(NetError::Cancelled)), (3, Err(NetError::Cancelled))]
        );
        assert_eq!(e.ctx.pending_count(), 2);

        e.ctx.cancel_by_conn_id(game, NetError::Cancelled);
        assert_eq!(log.tags(), vec![1, 3]);
        assert!(e.ctx.query_connected(Protocol::Game));
    }

    #[test]
    fn test_cancel_single() {
        let e = engine();
        let log = PostLog::default();
        let id = e
            .ctx
            .send(Probe::new(Protocol::Game, &log, 5).boxed())
            .unwrap();
        assert!(e.ctx.cancel(id, NetError::Cancelled));
        assert!(!e.ctx.cancel(id, NetError::Cancelled));
        assert_eq!(log.results(), vec![(5, Err(NetError::Cancelled))]);
    }

    #[test]
    fn test_cancel_all_empties_registry() {
        let e = engine();
        let log = PostLog::default();
        for (tag, protocol) in Protocol::ALL.into_iter().enumerate() {
            e.ctx
                .send(Probe::new(protocol, &log, tag as u32).boxed())
                .unwrap();
        }
        assert_eq!(e.ctx.pending_count(), 5);
        e.ctx.cancel_all(NetError::Cancelled);
        assert_eq!(e.ctx.pending_count(), 0);
        assert_eq!(log.tags(), vec![0, 1, 2, 3, 4]);
    }
}
