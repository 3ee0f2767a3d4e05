//! Network module - RPC clients and servers
//!
//! Provides:
//! - Server for accepting connections and dispatching requests
//! - Client for issuing calls over a single connection
//! - Service registry resolving `"Service.Method"` names

mod call;
mod client;
mod connection;
mod registry;
mod server;

pub use call::{
    completion_queue, completion_queue_with_capacity, Call, DEFAULT_COMPLETION_QUEUE_SIZE,
};
pub use client::*;
pub use connection::*;
pub use registry::*;
pub use server::*;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Upper bound on requests executing at once per connection
    pub max_inflight_requests: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            max_inflight_requests: None,
        }
    }
}

impl NetworkConfig {
    pub fn with_max_inflight_requests(mut self, limit: usize) -> Self {
        self.max_inflight_requests = Some(limit);
        self
    }
}
