//! Configuration for the gamelink client networking stack.
//!
//! Settings persist to disk as `config.ron`. Supports CLI overrides via clap,
//! hot-reload detection, validation of the reconnect/keep-alive policy, and
//! forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, ConnectionConfig, DebugConfig, ProductConfig, ServerConfig, TransactionConfig,
};
pub use error::ConfigError;
