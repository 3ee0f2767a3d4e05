//! Connection handshake
//!
//! The option is the first thing written on every connection. It is encoded
//! as one line of JSON so the server can read it before it knows which body
//! codec the client picked.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MAGIC_NUMBER;
use crate::codec::CodecType;

/// Upper bound on the encoded option, newline included
const MAX_OPTION_SIZE: u64 = 1024;

/// Handshake errors
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid option: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("Invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Option exceeds {0} bytes")]
    TooLarge(u64),
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Negotiated protocol identity and body encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeOption {
    pub magic_number: u32,
    pub codec_type: CodecType,
}

impl Default for HandshakeOption {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
        }
    }
}

impl HandshakeOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_magic_number(mut self, magic_number: u32) -> Self {
        self.magic_number = magic_number;
        self
    }

    pub fn with_codec_type(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    /// Write the option as a single JSON line
    pub async fn write_to<W>(&self, writer: &mut W) -> HandshakeResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one option line, leaving any bytes after it in `reader`.
    ///
    /// Fails with [`HandshakeError::InvalidMagic`] if the peer does not speak
    /// this protocol.
    pub async fn read_from<R>(reader: &mut R) -> HandshakeResult<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = Vec::new();
        let n = reader
            .take(MAX_OPTION_SIZE)
            .read_until(b'\n', &mut line)
            .await?;

        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        if line.last() != Some(&b'\n') {
            return if n as u64 >= MAX_OPTION_SIZE {
                Err(HandshakeError::TooLarge(MAX_OPTION_SIZE))
            } else {
                Err(HandshakeError::Closed)
            };
        }

        let option: HandshakeOption = serde_json::from_slice(&line)?;
        if option.magic_number != MAGIC_NUMBER {
            return Err(HandshakeError::InvalidMagic(option.magic_number));
        }
        Ok(option)
    }
}
