//! corerpc - asynchronous RPC over a single multiplexed connection
//!
//! A client issues many concurrent calls over one connection, correlated by
//! sequence number. A server resolves `"Service.Method"` names against its
//! registry and answers every request from its own task.

pub mod arith;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use codec::CodecType;
pub use error::{RpcError, RpcResult};
pub use network::{Call, Client, NetworkConfig, RpcService, Server, ServiceBuilder};
pub use protocol::{HandshakeOption, Header};
