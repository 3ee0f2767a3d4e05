//! Body codecs
//!
//! A codec turns headers and bodies into bytes and back. Which codec a
//! connection uses is decided by the handshake; the framing around the
//! encoded bytes is the same for all of them (see [`CodecReader`] and
//! [`CodecWriter`]).

mod frame;

pub use frame::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Encode(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Identifier of a body encoding, carried in the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecType {
    /// Compact binary encoding
    #[default]
    #[serde(rename = "application/bincode")]
    Bincode,
    /// Self-describing text encoding
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    /// Serialize one value
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        match self {
            CodecType::Bincode => {
                bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
            }
            CodecType::Json => {
                serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }

    /// Deserialize one value
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        match self {
            CodecType::Bincode => {
                bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
            CodecType::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bincode" | "application/bincode" => Ok(CodecType::Bincode),
            "json" | "application/json" => Ok(CodecType::Json),
            other => Err(format!("invalid codec type {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;

    #[test]
    fn test_codec_type_parse() {
        assert_eq!("json".parse::<CodecType>().unwrap(), CodecType::Json);
        assert_eq!(
            "application/bincode".parse::<CodecType>().unwrap(),
            CodecType::Bincode
        );
        assert!("application/gob".parse::<CodecType>().is_err());
    }

    #[test]
    fn test_header_through_each_codec() {
        let header = Header::request("Arith.Sum", 42);
        for codec in [CodecType::Bincode, CodecType::Json] {
            let bytes = codec.encode(&header).unwrap();
            let decoded: Header = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, header, "codec {}", codec);
        }
    }

    #[test]
    fn test_decode_type_mismatch() {
        let bytes = CodecType::Json.encode("not a number").unwrap();
        let err = CodecType::Json.decode::<u64>(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
