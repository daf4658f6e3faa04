//! Streamed file download over the File protocol.
//!
//! The request names the file: `u32` LE byte length then UTF-8. The server
//! replies with one or more chunks, each `u32` LE result code, `u32` LE
//! total size, then chunk bytes. The transaction completes once the total
//! has arrived. While chunks keep arriving, deadlines are extended rather
//! than failing the transfer.

use crate::error::{NetError, TransResult};
use crate::protocol::Protocol;
use crate::trans::{RecvOutcome, SendContext, Transaction};

/// Message id of a file download request.
pub const DOWNLOAD_REQUEST_MSG_ID: u16 = 20;

pub type ProgressCallback = Box<dyn FnMut(u64, u64) + Send>;
pub type DownloadCallback = Box<dyn FnOnce(TransResult, Vec<u8>) + Send>;

pub struct DownloadTrans {
    name: String,
    total: Option<u64>,
    data: Vec<u8>,
    progressed: bool,
    on_progress: Option<ProgressCallback>,
    callback: DownloadCallback,
}

impl DownloadTrans {
    pub fn new(
        name: impl Into<String>,
        callback: impl FnOnce(TransResult, Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            total: None,
            data: Vec::new(),
            progressed: false,
            on_progress: None,
            callback: Box::new(callback),
        }
    }

    /// Called with (bytes received, total bytes) after every chunk.
    pub fn on_progress(mut self, progress: impl FnMut(u64, u64) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(progress));
        self
    }

    pub fn received(&self) -> u64 {
        self.data.len() as u64
    }
}

impl Transaction for DownloadTrans {
    fn protocol(&self) -> Protocol {
        Protocol::File
    }

    fn kind(&self) -> &'static str {
        "download"
    }

    fn send(&mut self, ctx: &SendContext<'_>) -> bool {
        let name = self.name.as_bytes();
        let mut body = Vec::with_capacity(4 + name.len());
        body.extend_from_slice(&(name.len() as u32).to_le_bytes());
        body.extend_from_slice(name);
        ctx.send(DOWNLOAD_REQUEST_MSG_ID, body)
    }

    fn recv(&mut self, _msg_id: u16, body: &[u8]) -> RecvOutcome {
        let Some((code, rest)) = body.split_first_chunk::<4>() else {
            return RecvOutcome::Malformed;
        };
        let code = u32::from_le_bytes(*code);
        if code != 0 {
            return RecvOutcome::Complete(Err(NetError::Server(code)));
        }
        let Some((total, chunk)) = rest.split_first_chunk::<4>() else {
            return RecvOutcome::Malformed;
        };
        let total = u64::from(u32::from_le_bytes(*total));
        if self.total.is_some_and(|known| known != total) {
            return RecvOutcome::Malformed;
        }
        self.total = Some(total);

        if self.received() + chunk.len() as u64 > total {
            return RecvOutcome::Malformed;
        }
        self.data.extend_from_slice(chunk);
        self.progressed = true;
        let received = self.received();
        if let Some(progress) = self.on_progress.as_mut() {
            progress(received, total);
        }

        if received == total {
            RecvOutcome::Complete(Ok(()))
        } else {
            RecvOutcome::Pending
        }
    }

    fn post(self: Box<Self>, result: TransResult) {
        tracing::debug!("download of {} finished: {result:?}", self.name);
        (self.callback)(result, self.data);
    }

    fn timed_out(&mut self) -> bool {
        !std::mem::take(&mut self.progressed)
    }
}
