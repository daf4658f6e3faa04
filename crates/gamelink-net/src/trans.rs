//! The transaction abstraction: one request and its reply (or replies).
//!
//! A transaction is created by the caller, handed to the network context,
//! and from then on driven only by the dispatcher:
//!
//! ```text
//! WaitServerConnect --send--> WaitServerResponse --recv/timeout/cancel--> Complete --post
//! ```
//!
//! `post` consumes the transaction, so the completion hook runs exactly once.

use std::fmt;

use crate::conn::{Conn, ConnId};
use crate::error::TransResult;
use crate::framing::Envelope;
use crate::protocol::Protocol;

/// Handle to a pending transaction.
///
/// The low bits select a registry slot and the high bits carry that slot's
/// generation, so a stale id never matches a later transaction in the same
/// slot. The raw value is what goes on the wire and is never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransId(u32);

impl TransId {
    const INDEX_BITS: u32 = 20;
    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;
    pub(crate) const MAX_SLOTS: usize = 1 << Self::INDEX_BITS;
    pub(crate) const MAX_GENERATION: u32 = (1 << (32 - Self::INDEX_BITS)) - 1;

    pub(crate) fn new(index: usize, generation: u32) -> Self {
        debug_assert!(index < Self::MAX_SLOTS);
        debug_assert!((1..=Self::MAX_GENERATION).contains(&generation));
        TransId((generation << Self::INDEX_BITS) | index as u32)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.0 >> Self::INDEX_BITS
    }

    /// Wire representation.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Parse a wire value. 0 means "no transaction".
    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw != 0).then_some(TransId(raw))
    }
}

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trans#{:x}", self.0)
    }
}

/// Lifecycle position of a pending transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransState {
    /// Waiting for its protocol to have a connected link.
    WaitServerConnect,
    /// Request sent; waiting for the reply.
    WaitServerResponse,
    /// Finished; waiting to be posted.
    Complete,
}

/// What a transaction made of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Accepted; more messages are expected.
    Pending,
    /// Accepted; the transaction is done.
    Complete(TransResult),
    /// The message could not be parsed. The connection is dropped.
    Malformed,
}

/// Handed to [`Transaction::send`] so the request goes out on the bound
/// connection tagged with the transaction's id.
pub struct SendContext<'a> {
    trans_id: TransId,
    conn: &'a Conn,
}

impl<'a> SendContext<'a> {
    pub(crate) fn new(trans_id: TransId, conn: &'a Conn) -> Self {
        Self { trans_id, conn }
    }

    pub fn trans_id(&self) -> TransId {
        self.trans_id
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn.id()
    }

    /// Queue one message. Returns `false` if the link is already gone.
    pub fn send(&self, msg_id: u16, body: Vec<u8>) -> bool {
        self.conn
            .send(Envelope::new(msg_id, self.trans_id.get(), body))
    }
}

/// A request/response exchange with one backend protocol.
pub trait Transaction: Send {
    fn protocol(&self) -> Protocol;

    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    /// Extra gate checked before sending, on top of the link being up.
    fn can_start(&self) -> bool {
        true
    }

    /// Write the request. Returning `false` leaves the transaction waiting
    /// and it is offered the link again on the next update.
    fn send(&mut self, ctx: &SendContext<'_>) -> bool;

    /// Consume one reply message addressed to this transaction.
    fn recv(&mut self, msg_id: u16, body: &[u8]) -> RecvOutcome;

    /// Deliver the final result to the caller.
    fn post(self: Box<Self>, result: TransResult);

    /// Called when the deadline passes. Return `false` to keep waiting for
    /// another full timeout period, for example while a transfer is still
    /// making progress.
    fn timed_out(&mut self) -> bool {
        true
    }

    /// Transactions that spawn follow-up work are posted only after every
    /// ordinary transaction submitted in the same update tick has posted.
    fn has_sub_trans(&self) -> bool {
        false
    }
}
