//! Connect, ping, report.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gamelink_config::ServerConfig;
use gamelink_net::transactions::PingRequestTrans;
use gamelink_net::{NetError, NetworkContext, Protocol};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Payload echoed back by the server in each probe ping.
const PROBE_PAYLOAD: &[u8] = b"gamelink-probe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No connection came up before the connect wait ran out.
    Unreachable,
    Replied { rtt: Duration },
    Failed(NetError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub protocol: Protocol,
    pub outcome: ProbeOutcome,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            ProbeOutcome::Unreachable => write!(f, "{:<10} unreachable", self.protocol),
            ProbeOutcome::Replied { rtt } => write!(f, "{:<10} ok, rtt {rtt:?}", self.protocol),
            ProbeOutcome::Failed(e) => write!(f, "{:<10} failed: {e}", self.protocol),
        }
    }
}

/// Protocols with at least one configured address, in protocol order.
pub fn configured(servers: &ServerConfig) -> Vec<(Protocol, Vec<String>)> {
    Protocol::ALL
        .into_iter()
        .filter_map(|protocol| {
            let addrs = match protocol {
                Protocol::Auth => &servers.auth,
                Protocol::Game => &servers.game,
                Protocol::File => &servers.file,
                Protocol::Csr => &servers.csr,
                Protocol::GateKeeper => &servers.gatekeeper,
            };
            (!addrs.is_empty()).then(|| (protocol, addrs.clone()))
        })
        .collect()
}

/// Initialize every configured protocol, wait up to `connect_wait` for the
/// connections, then ping each one. Needs a dispatcher ticking `ctx`.
pub fn run(ctx: &NetworkContext, servers: &ServerConfig, connect_wait: Duration) -> Vec<ProbeReport> {
    let targets = configured(servers);
    for (protocol, addrs) in &targets {
        ctx.initialize(*protocol, addrs);
    }

    let deadline = Instant::now() + connect_wait;
    while Instant::now() < deadline
        && !targets
            .iter()
            .all(|(protocol, _)| ctx.query_connected(*protocol))
    {
        thread::sleep(POLL_INTERVAL);
    }

    targets
        .iter()
        .map(|(protocol, _)| ProbeReport {
            protocol: *protocol,
            outcome: ping(ctx, *protocol),
        })
        .collect()
}

fn ping(ctx: &NetworkContext, protocol: Protocol) -> ProbeOutcome {
    if !ctx.query_connected(protocol) {
        return ProbeOutcome::Unreachable;
    }

    let rtt = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&rtt);
    let trans = PingRequestTrans::new(protocol, PROBE_PAYLOAD.to_vec(), move |_, reply| {
        *sink.lock() = Some(reply.rtt);
    });
    match ctx.send_and_wait(Box::new(trans)) {
        Ok(()) => ProbeOutcome::Replied {
            rtt: rtt.lock().take().unwrap_or_default(),
        },
        Err(e) => {
            tracing::warn!("{protocol} probe failed: {e}");
            ProbeOutcome::Failed(e)
        }
    }
}

/// Tear down every configured protocol and wait for its sockets to close.
pub fn shutdown(ctx: &NetworkContext, servers: &ServerConfig) {
    for (protocol, _) in configured(servers) {
        ctx.destroy(protocol, true);
    }
}
