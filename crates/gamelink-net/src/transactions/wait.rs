//! Wrapper that lets a caller block until a transaction has posted.

use tokio::sync::oneshot;

use crate::error::TransResult;
use crate::protocol::Protocol;
use crate::trans::{RecvOutcome, SendContext, Transaction};

/// Forwards everything to the inner transaction, then signals the result
/// after the inner completion hook has run.
pub(crate) struct WaitTrans {
    inner: Box<dyn Transaction>,
    done: oneshot::Sender<TransResult>,
}

impl WaitTrans {
    pub(crate) fn new(inner: Box<dyn Transaction>) -> (Self, oneshot::Receiver<TransResult>) {
        let (done, rx) = oneshot::channel();
        (Self { inner, done }, rx)
    }
}

impl Transaction for WaitTrans {
    fn protocol(&self) -> Protocol {
        self.inner.protocol()
    }

    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    fn can_start(&self) -> bool {
        self.inner.can_start()
    }

    fn send(&mut self, ctx: &SendContext<'_>) -> bool {
        self.inner.send(ctx)
    }

    fn recv(&mut self, msg_id: u16, body: &[u8]) -> RecvOutcome {
        self.inner.recv(msg_id, body)
    }

    fn post(self: Box<Self>, result: TransResult) {
        let WaitTrans { inner, done } = *self;
        inner.post(result.clone());
        let _ = done.send(result);
    }

    fn timed_out(&mut self) -> bool {
        self.inner.timed_out()
    }

    fn has_sub_trans(&self) -> bool {
        self.inner.has_sub_trans()
    }
}
