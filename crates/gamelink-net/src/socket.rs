//! Seam between the engine and whatever actually moves bytes.
//!
//! A [`SocketDriver`] performs name lookups, connects, writes and closes.
//! It never calls back into the engine. It reports everything as
//! [`SocketEvent`]s on a channel that the engine drains once per update,
//! so socket callbacks and engine state never touch on the same thread.

use std::net::SocketAddr;

use crossbeam_channel::{Receiver, Sender};

use crate::conn::ConnId;
use crate::framing::Envelope;
use crate::protocol::Protocol;

/// Something a socket driver observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The TCP handshake completed and the preamble was written.
    Connected { conn: ConnId },
    /// The connect attempt failed or was cancelled.
    ConnectFailed { conn: ConnId },
    /// An established connection closed.
    Disconnected { conn: ConnId },
    /// One decoded message arrived.
    Read { conn: ConnId, envelope: Envelope },
    /// A host name resolved to one or more addresses.
    Resolved {
        protocol: Protocol,
        addrs: Vec<SocketAddr>,
    },
    /// A host name could not be resolved.
    LookupFailed { protocol: Protocol, host: String },
}

pub type EventSender = Sender<SocketEvent>;
pub type EventReceiver = Receiver<SocketEvent>;

/// Create the event channel shared by a driver and a network context.
pub fn event_channel() -> (EventSender, EventReceiver) {
    crossbeam_channel::unbounded()
}

/// Platform socket operations used by the connection managers.
///
/// All methods return immediately; outcomes arrive as [`SocketEvent`]s.
pub trait SocketDriver: Send + Sync {
    /// Open a connection to `addr` and write `preamble` once connected.
    /// Exactly one of `Connected` or `ConnectFailed` follows. After
    /// `Connected`, a `Disconnected` follows when the link closes.
    fn connect(&self, conn: ConnId, addr: SocketAddr, preamble: Vec<u8>, events: &EventSender);

    /// Queue a message for writing. Returns `false` if `conn` is not open.
    fn send(&self, conn: ConnId, envelope: Envelope) -> bool;

    /// Close `conn`, or cancel it if still connecting. Idempotent.
    fn disconnect(&self, conn: ConnId);

    /// Resolve `host` for `protocol`.
    fn lookup(&self, protocol: Protocol, host: String, port: u16, events: &EventSender);
}
