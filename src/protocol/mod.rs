//! Protocol module - Defines the wire protocol shared by clients and servers
//!
//! Every connection starts with a handshake [`HandshakeOption`] written as a
//! single JSON line. After it, traffic is a sequence of header/body pairs
//! encoded by the negotiated codec:
//! - header frame: `Header { service_method, seq, error }`
//! - body frame: the call argument or the reply value

mod header;
mod option;

pub use header::*;
pub use option::*;

/// Magic number identifying a corerpc connection
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default port for corerpc servers
pub const DEFAULT_PORT: u16 = 9999;
