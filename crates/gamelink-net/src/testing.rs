//! Deterministic doubles shared by the unit tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use parking_lot::Mutex;

use gamelink_config::ProductConfig;

use crate::conn::{Conn, ConnId};
use crate::error::{NetError, TransResult};
use crate::framing::Envelope;
use crate::protocol::{ProductInfo, Protocol};
use crate::socket::{EventSender, SocketDriver};
use crate::trans::{RecvOutcome, SendContext, Transaction};

pub(crate) fn product() -> ProductInfo {
    ProductInfo::from_config(&ProductConfig::default()).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DriverCall {
    Connect(ConnId, SocketAddr, Vec<u8>),
    Send(ConnId, Envelope),
    Disconnect(ConnId),
    Lookup(Protocol, String, u16),
}

/// Socket driver that records every command and never emits events on its
/// own; tests inject events through the context's sender.
#[derive(Default)]
pub(crate) struct RecordingDriver {
    calls: Mutex<Vec<DriverCall>>,
}

impl RecordingDriver {
    pub(crate) fn connects(&self) -> Vec<(ConnId, SocketAddr, Vec<u8>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Connect(id, addr, preamble) => Some((*id, *addr, preamble.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn sent(&self) -> Vec<(ConnId, Envelope)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Send(id, envelope) => Some((*id, envelope.clone())),
                _ => None,
            })
            .collect()
    }

    /// Sent messages that belong to transactions (keep-alive filtered out).
    pub(crate) fn requests(&self) -> Vec<(ConnId, Envelope)> {
        self.sent()
            .into_iter()
            .filter(|(_, envelope)| !envelope.is_keepalive())
            .collect()
    }

    pub(crate) fn disconnects(&self) -> Vec<ConnId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Disconnect(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn lookups(&self) -> Vec<(Protocol, String, u16)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                DriverCall::Lookup(protocol, host, port) => Some((*protocol, host.clone(), *port)),
                _ => None,
            })
            .collect()
    }
}

impl SocketDriver for RecordingDriver {
    fn connect(&self, conn: ConnId, addr: SocketAddr, preamble: Vec<u8>, _events: &EventSender) {
        self.calls.lock().push(DriverCall::Connect(conn, addr, preamble));
    }

    fn send(&self, conn: ConnId, envelope: Envelope) -> bool {
        self.calls.lock().push(DriverCall::Send(conn, envelope));
        true
    }

    fn disconnect(&self, conn: ConnId) {
        self.calls.lock().push(DriverCall::Disconnect(conn));
    }

    fn lookup(&self, protocol: Protocol, host: String, port: u16, _events: &EventSender) {
        self.calls.lock().push(DriverCall::Lookup(protocol, host, port));
    }
}

/// A standalone connection over a recording driver.
pub(crate) fn open_conn(driver: &Arc<RecordingDriver>, protocol: Protocol, id: u32) -> Arc<Conn> {
    let driver: Arc<dyn SocketDriver> = driver.clone();
    Conn::open(
        ConnId(id),
        protocol,
        "127.0.0.1:14617".parse().unwrap(),
        driver,
        Arc::new(AtomicUsize::new(0)),
    )
}

/// Shared record of completion hook invocations, in call order.
#[derive(Clone, Default)]
pub(crate) struct PostLog {
    entries: Arc<Mutex<Vec<(u32, TransResult)>>>,
}

impl PostLog {
    pub(crate) fn push(&self, tag: u32, result: TransResult) {
        self.entries.lock().push((tag, result));
    }

    pub(crate) fn results(&self) -> Vec<(u32, TransResult)> {
        self.entries.lock().clone()
    }

    pub(crate) fn tags(&self) -> Vec<u32> {
        self.entries.lock().iter().map(|(tag, _)| *tag).collect()
    }
}

/// Minimal transaction for registry and context tests.
///
/// Sends its tag as the body of message 1. Replies are interpreted as:
/// empty body is malformed, message id 2 is a partial reply, otherwise the
/// first byte is a result code.
pub(crate) struct Probe {
    protocol: Protocol,
    tag: u32,
    log: PostLog,
    deferred: bool,
    refusals: u32,
}

impl Probe {
    pub(crate) fn new(protocol: Protocol, log: &PostLog, tag: u32) -> Self {
        Self {
            protocol,
            tag,
            log: log.clone(),
            deferred: false,
            refusals: 0,
        }
    }

    pub(crate) fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }

    /// Decline the first `n` timeouts.
    pub(crate) fn refuse_timeouts(mut self, n: u32) -> Self {
        self.refusals = n;
        self
    }

    pub(crate) fn boxed(self) -> Box<dyn Transaction> {
        Box::new(self)
    }
}

impl Transaction for Probe {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn kind(&self) -> &'static str {
        "probe"
    }

    fn send(&mut self, ctx: &SendContext<'_>) -> bool {
        ctx.send(1, self.tag.to_le_bytes().to_vec())
    }

    fn recv(&mut self, msg_id: u16, body: &[u8]) -> RecvOutcome {
        match body.first() {
            None => RecvOutcome::Malformed,
            Some(_) if msg_id == 2 => RecvOutcome::Pending,
            Some(code) => RecvOutcome::Complete(NetError::from_result_code(u32::from(*code))),
        }
    }

    fn post(self: Box<Self>, result: TransResult) {
        self.log.push(self.tag, result);
    }

    fn timed_out(&mut self) -> bool {
        if self.refusals > 0 {
            self.refusals -= 1;
            false
        } else {
            true
        }
    }

    fn has_sub_trans(&self) -> bool {
        self.deferred
    }
}
