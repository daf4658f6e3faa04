//! Command-line probe for the gamelink backend services.
//!
//! Connects every configured protocol, pings each one through the
//! transaction engine and reports round-trip times.

pub mod platform;
pub mod probe;
