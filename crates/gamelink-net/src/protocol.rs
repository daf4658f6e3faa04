//! Backend protocols and the connect preamble sent on every new socket.
//!
//! Each connection opens with a fixed 31-byte header identifying the
//! protocol and the client build:
//!
//! ```text
//! +-----------+-------------+----------+------------+-----------+--------------+
//! | conn type | header len  | build id | build type | branch id | product uuid |
//! | u8        | u16 LE (31) | u32 LE   | u32 LE     | u32 LE    | 16 bytes     |
//! +-----------+-------------+----------+------------+-----------+--------------+
//! ```

use std::fmt;

use gamelink_config::{ConfigError, ProductConfig};
use uuid::Uuid;

/// Size of the connect preamble in bytes.
pub const CONNECT_HEADER_LEN: usize = 31;

/// A backend service the client talks to. Each has its own connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Auth,
    Game,
    File,
    Csr,
    GateKeeper,
}

impl Protocol {
    /// Every protocol, in manager-table order.
    pub const ALL: [Protocol; 5] = [
        Protocol::Auth,
        Protocol::Game,
        Protocol::File,
        Protocol::Csr,
        Protocol::GateKeeper,
    ];

    /// Connection type byte written first in the preamble.
    pub fn conn_type(self) -> u8 {
        match self {
            Protocol::Auth => 10,
            Protocol::Game => 11,
            Protocol::File => 16,
            Protocol::Csr => 20,
            Protocol::GateKeeper => 22,
        }
    }

    /// Reverse of [`Protocol::conn_type`].
    pub fn from_conn_type(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.conn_type() == byte)
    }

    /// Stable index into per-protocol tables.
    pub fn index(self) -> usize {
        match self {
            Protocol::Auth => 0,
            Protocol::Game => 1,
            Protocol::File => 2,
            Protocol::Csr => 3,
            Protocol::GateKeeper => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Protocol::Auth => "auth",
            Protocol::Game => "game",
            Protocol::File => "file",
            Protocol::Csr => "csr",
            Protocol::GateKeeper => "gatekeeper",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Client build identity carried in every preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfo {
    pub build_id: u32,
    pub build_type: u32,
    pub branch_id: u32,
    pub product_id: Uuid,
}

impl ProductInfo {
    /// Build from configuration, parsing the product UUID.
    pub fn from_config(config: &ProductConfig) -> Result<Self, ConfigError> {
        let product_id =
            Uuid::parse_str(&config.product_uuid).map_err(|e| ConfigError::InvalidValue {
                field: "product.product_uuid",
                reason: e.to_string(),
            })?;
        Ok(Self {
            build_id: config.build_id,
            build_type: config.build_type,
            branch_id: config.branch_id,
            product_id,
        })
    }
}

/// The preamble for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectHeader {
    pub protocol: Protocol,
    pub product: ProductInfo,
}

impl ConnectHeader {
    pub fn new(protocol: Protocol, product: ProductInfo) -> Self {
        Self { protocol, product }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONNECT_HEADER_LEN);
        buf.push(self.protocol.conn_type());
        buf.extend_from_slice(&(CONNECT_HEADER_LEN as u16).to_le_bytes());
        buf.extend_from_slice(&self.product.build_id.to_le_bytes());
        buf.extend_from_slice(&self.product.build_type.to_le_bytes());
        buf.extend_from_slice(&self.product.branch_id.to_le_bytes());
        buf.extend_from_slice(self.product.product_id.as_bytes());
        buf
    }

    /// Parse a preamble. Returns `None` for a short buffer, a wrong header
    /// length, or an unknown connection type.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CONNECT_HEADER_LEN {
            return None;
        }
        let protocol = Protocol::from_conn_type(bytes[0])?;
        let header_len = u16::from_le_bytes([bytes[1], bytes[2]]);
        if header_len as usize != CONNECT_HEADER_LEN {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let product_id = Uuid::from_slice(&bytes[15..31]).ok()?;
        Some(Self {
            protocol,
            product: ProductInfo {
                build_id: word(3),
                build_type: word(7),
                branch_id: word(11),
                product_id,
            },
        })
    }
}
