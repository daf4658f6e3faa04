//! Background thread that ticks a [`NetworkContext`].
//!
//! Completion hooks run on this thread. Callers that never spawn a
//! dispatcher can tick the context themselves with
//! [`NetworkContext::update`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::RecvTimeoutError;

use crate::context::NetworkContext;

pub struct Dispatcher {
    context: Arc<NetworkContext>,
    /// Dropping the sender stops the thread.
    stop: Option<crossbeam_channel::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start ticking `context` every `tick_interval`.
    pub fn spawn(context: Arc<NetworkContext>) -> io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let tick = context.config().tick_interval;
        let ctx = Arc::clone(&context);
        let handle = thread::Builder::new()
            .name("gamelink-dispatch".to_string())
            .spawn(move || {
                tracing::debug!("dispatcher started, tick {tick:?}");
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => ctx.update(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("dispatcher stopped");
            })?;

        Ok(Self {
            context,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn context(&self) -> &Arc<NetworkContext> {
        &self.context
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for the current tick to finish.
    pub fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
