//! Ping transaction: an echoed request that measures round-trip time.
//!
//! Sent as message id 0 with a transaction id, so the reply is routed to
//! the transaction instead of the connection's keep-alive tracker. Body is
//! a `u32` LE stamp followed by an optional payload, echoed verbatim.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::TransResult;
use crate::framing::PING_MSG_ID;
use crate::protocol::Protocol;
use crate::trans::{RecvOutcome, SendContext, Transaction};

/// What came back from a ping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingReply {
    pub rtt: Duration,
    pub payload: Vec<u8>,
}

pub type PingCallback = Box<dyn FnOnce(TransResult, PingReply) + Send>;

pub struct PingRequestTrans {
    protocol: Protocol,
    payload: Vec<u8>,
    stamp: u32,
    sent_at: Option<Instant>,
    reply: PingReply,
    callback: PingCallback,
}

impl PingRequestTrans {
    pub fn new(
        protocol: Protocol,
        payload: Vec<u8>,
        callback: impl FnOnce(TransResult, PingReply) + Send + 'static,
    ) -> Self {
        Self {
            protocol,
            payload,
            stamp: 0,
            sent_at: None,
            reply: PingReply::default(),
            callback: Box::new(callback),
        }
    }
}

fn wall_clock_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or_default()
}

impl Transaction for PingRequestTrans {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn kind(&self) -> &'static str {
        "ping"
    }

    fn send(&mut self, ctx: &SendContext<'_>) -> bool {
        self.stamp = wall_clock_ms();
        self.sent_at = Some(Instant::now());
        let mut body = Vec::with_capacity(4 + self.payload.len());
        body.extend_from_slice(&self.stamp.to_le_bytes());
        body.extend_from_slice(&self.payload);
        ctx.send(PING_MSG_ID, body)
    }

    fn recv(&mut self, msg_id: u16, body: &[u8]) -> RecvOutcome {
        let Some((stamp, payload)) = body.split_first_chunk::<4>() else {
            return RecvOutcome::Malformed;
        };
        if msg_id != PING_MSG_ID || u32::from_le_bytes(*stamp) != self.stamp {
            return RecvOutcome::Malformed;
        }
        self.reply = PingReply {
            rtt: self.sent_at.map(|at| at.elapsed()).unwrap_or_default(),
            payload: payload.to_vec(),
        };
        RecvOutcome::Complete(Ok(()))
    }

    fn post(self: Box<Self>, result: TransResult) {
        (self.callback)(result, self.reply);
    }
}
