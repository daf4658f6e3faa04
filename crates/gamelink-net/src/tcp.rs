//! Tokio-backed [`SocketDriver`].
//!
//! Every connection runs as one task on the driver's runtime: connect,
//! write the preamble, then read frames until the peer closes or the engine
//! asks for a disconnect. Writes go through a per-connection queue drained
//! by a writer task, so [`SocketDriver::send`] never blocks the caller.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};

use crate::conn::ConnId;
use crate::framing::{Envelope, FrameConfig, read_envelope, write_envelope};
use crate::platform::{SocketConfig, connect_stream};
use crate::protocol::Protocol;
use crate::socket::{EventSender, SocketDriver, SocketEvent};

struct LinkHandle {
    outbound: mpsc::UnboundedSender<Envelope>,
    /// Sending `true` makes the connection task exit.
    shutdown: watch::Sender<bool>,
}

type LinkMap = Arc<Mutex<HashMap<ConnId, LinkHandle>>>;

pub struct TcpDriver {
    handle: Handle,
    runtime: Option<Runtime>,
    socket: SocketConfig,
    frame: FrameConfig,
    links: LinkMap,
}

impl TcpDriver {
    /// Create a driver with its own I/O runtime.
    pub fn new(socket: SocketConfig) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("gamelink-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            handle,
            runtime: Some(runtime),
            socket,
            frame: FrameConfig::default(),
            links: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create a driver that spawns onto an existing runtime.
    pub fn from_handle(handle: Handle, socket: SocketConfig) -> Self {
        Self {
            handle,
            runtime: None,
            socket,
            frame: FrameConfig::default(),
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connections with a running task.
    pub fn open_links(&self) -> usize {
        self.links.lock().len()
    }
}

impl Drop for TcpDriver {
    fn drop(&mut self) {
        for (_, link) in self.links.lock().drain() {
            let _ = link.shutdown.send(true);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl SocketDriver for TcpDriver {
    fn connect(&self, conn: ConnId, addr: SocketAddr, preamble: Vec<u8>, events: &EventSender) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.links
            .lock()
            .insert(conn, LinkHandle { outbound, shutdown });

        let task = LinkTask {
            conn,
            addr,
            socket: self.socket.clone(),
            frame: self.frame.clone(),
            events: events.clone(),
            links: Arc::clone(&self.links),
        };
        self.handle
            .spawn(task.run(preamble, outbound_rx, shutdown_rx));
    }

    fn send(&self, conn: ConnId, envelope: Envelope) -> bool {
        self.links
            .lock()
            .get(&conn)
            .is_some_and(|link| link.outbound.send(envelope).is_ok())
    }

    fn disconnect(&self, conn: ConnId) {
        if let Some(link) = self.links.lock().remove(&conn) {
            let _ = link.shutdown.send(true);
        }
    }

    fn lookup(&self, protocol: Protocol, host: String, port: u16, events: &EventSender) {
        let events = events.clone();
        self.handle.spawn(async move {
            let resolved = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map(|addrs| addrs.collect::<Vec<SocketAddr>>());
            let event = match resolved {
                Ok(addrs) => {
                    if addrs.is_empty() {
                        SocketEvent::LookupFailed { protocol, host }
                    } else {
                        SocketEvent::Resolved { protocol, addrs }
                    }
                }
                Err(e) => {
                    tracing::warn!("{protocol} lookup of {host} failed: {e}");
                    SocketEvent::LookupFailed { protocol, host }
                }
            };
            let _ = events.send(event);
        });
    }
}

struct LinkTask {
    conn: ConnId,
    addr: SocketAddr,
    socket: SocketConfig,
    frame: FrameConfig,
    events: EventSender,
    links: LinkMap,
}

impl LinkTask {
    async fn run(
        self,
        preamble: Vec<u8>,
        mut outbound: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let conn = self.conn;
        let connected = tokio::select! {
            result = self.handshake(&preamble) => result,
            _ = shutdown.wait_for(|stop| *stop) => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "connect cancelled"))
            }
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!("{conn} connect to {} failed: {e}", self.addr);
                self.links.lock().remove(&conn);
                let _ = self.events.send(SocketEvent::ConnectFailed { conn });
                return;
            }
        };
        let _ = self.events.send(SocketEvent::Connected { conn });

        let (mut reader, mut writer) = stream.into_split();
        let frame = self.frame.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound.recv().await {
                if let Err(e) = write_envelope(&mut writer, &envelope, &frame).await {
                    tracing::debug!("{conn} write failed: {e}");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        loop {
            tokio::select! {
                read = read_envelope(&mut reader, &self.frame) => match read {
                    Ok(envelope) => {
                        if self.events.send(SocketEvent::Read { conn, envelope }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("{conn} read ended: {e}");
                        break;
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        writer_task.abort();
        self.links.lock().remove(&conn);
        let _ = self.events.send(SocketEvent::Disconnected { conn });
    }

    async fn handshake(&self, preamble: &[u8]) -> io::Result<tokio::net::TcpStream> {
        let mut stream = connect_stream(self.addr, &self.socket).await?;
        stream.write_all(preamble).await?;
        stream.flush().await?;
        Ok(stream)
    }
}
