//! Client-side transaction engine for the game backend protocols.
//!
//! A [`NetworkContext`] keeps one connection per protocol alive and matches
//! every server reply to the [`Transaction`] that asked for it. Transactions
//! complete exactly once, with success or a [`NetError`], and their
//! completion hooks run on whichever thread ticks the context (usually a
//! [`Dispatcher`]).

pub mod backoff;
pub mod conn;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod keepalive;
pub mod platform;
pub mod protocol;
pub mod registry;
pub mod socket;
pub mod tcp;
pub mod trans;
pub mod transactions;

#[cfg(test)]
mod testing;

pub use conn::{ConnId, ConnPolicy};
pub use context::{EngineConfig, ErrorHook, NetworkContext, NotifyHandler};
pub use dispatcher::Dispatcher;
pub use error::{ErrorKind, NetError, TransResult};
pub use framing::{Envelope, FrameConfig, FrameError};
pub use keepalive::KeepAliveStats;
pub use platform::SocketConfig;
pub use protocol::{ProductInfo, Protocol};
pub use socket::{SocketDriver, SocketEvent};
pub use tcp::TcpDriver;
pub use trans::{RecvOutcome, SendContext, TransId, TransState, Transaction};
