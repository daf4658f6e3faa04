//! Generic request/response transaction.
//!
//! The request is one message with a caller-supplied id and body. The
//! reply body starts with a `u32` LE result code (0 = success) followed by
//! the payload handed to the callback.

use crate::error::{NetError, TransResult};
use crate::protocol::Protocol;
use crate::trans::{RecvOutcome, SendContext, Transaction};

pub type ReplyCallback = Box<dyn FnOnce(TransResult, Vec<u8>) + Send>;

pub struct RequestTrans {
    protocol: Protocol,
    kind: &'static str,
    msg_id: u16,
    body: Vec<u8>,
    reply: Vec<u8>,
    sub_trans: bool,
    callback: ReplyCallback,
}

impl RequestTrans {
    pub fn new(
        protocol: Protocol,
        msg_id: u16,
        body: Vec<u8>,
        callback: impl FnOnce(TransResult, Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            protocol,
            kind: "request",
            msg_id,
            body,
            reply: Vec::new(),
            sub_trans: false,
            callback: Box::new(callback),
        }
    }

    /// Name used in logs.
    pub fn named(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    /// Mark the callback as one that submits follow-up transactions, so it
    /// runs after its tick-mates have posted.
    pub fn with_sub_trans(mut self) -> Self {
        self.sub_trans = true;
        self
    }
}

impl Transaction for RequestTrans {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn send(&mut self, ctx: &SendContext<'_>) -> bool {
        ctx.send(self.msg_id, self.body.clone())
    }

    fn recv(&mut self, _msg_id: u16, body: &[u8]) -> RecvOutcome {
        let Some((code, payload)) = body.split_first_chunk::<4>() else {
            return RecvOutcome::Malformed;
        };
        self.reply = payload.to_vec();
        RecvOutcome::Complete(NetError::from_result_code(u32::from_le_bytes(*code)))
    }

    fn post(self: Box<Self>, result: TransResult) {
        (self.callback)(result, self.reply);
    }

    fn has_sub_trans(&self) -> bool {
        self.sub_trans
    }
}
