//! Per-message header

use serde::{Deserialize, Serialize};

/// Header preceding every request and response body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target of the call, formatted as `"Service.Method"`
    pub service_method: String,
    /// Sequence number chosen by the client; echoed in the response
    pub seq: u64,
    /// Empty on success
    pub error: String,
}

impl Header {
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Whether the header reports a failed call
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header() {
        let header = Header::request("Arith.Sum", 7);
        assert_eq!(header.service_method, "Arith.Sum");
        assert_eq!(header.seq, 7);
        assert!(!header.is_error());
    }
}
