//! Framing of headers and bodies on a byte stream
//!
//! Wire format of a single frame:
//! - 4 bytes payload length (big-endian)
//! - payload encoded with the connection's [`CodecType`]
//!
//! A message is a header frame immediately followed by a body frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecError, CodecResult, CodecType, MAX_FRAME_SIZE};
use crate::protocol::Header;

/// Length prefix size
const LENGTH_SIZE: usize = 4;

/// Reads header and body frames from the inbound half of a connection
pub struct CodecReader<R> {
    reader: R,
    codec: CodecType,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(reader: R, codec: CodecType) -> Self {
        Self { reader, codec }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// Read the next header.
    ///
    /// An error here means the stream can no longer be trusted.
    pub async fn read_header(&mut self) -> CodecResult<Header> {
        let frame = self.read_frame().await?;
        self.codec.decode(&frame)
    }

    /// Read the raw bytes of the next body frame
    pub async fn read_body(&mut self) -> CodecResult<Bytes> {
        self.read_frame().await
    }

    /// Read the next body frame and decode it.
    ///
    /// The frame is consumed even when decoding fails, so the stream stays
    /// aligned on the following header.
    pub async fn read_body_into<T: DeserializeOwned>(&mut self) -> CodecResult<T> {
        let frame = self.read_frame().await?;
        self.codec.decode(&frame)
    }

    /// Drain the next body frame without decoding it
    pub async fn discard_body(&mut self) -> CodecResult<()> {
        self.read_frame().await.map(|_| ())
    }

    async fn read_frame(&mut self) -> CodecResult<Bytes> {
        let length = self.reader.read_u32().await? as usize;
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length, MAX_FRAME_SIZE));
        }

        let mut buf = BytesMut::zeroed(length);
        self.reader.read_exact(&mut buf).await?;
        tracing::trace!("Read frame of {} bytes", length);
        Ok(buf.freeze())
    }
}

/// Writes header and body frames to the outbound half of a connection.
///
/// `write_header` and `write_body` only buffer; nothing reaches the stream
/// until [`CodecWriter::flush`], so a message goes out as one contiguous
/// write.
pub struct CodecWriter<W> {
    writer: W,
    codec: CodecType,
    write_buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(writer: W, codec: CodecType) -> Self {
        Self {
            writer,
            codec,
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    pub fn write_header(&mut self, header: &Header) -> CodecResult<()> {
        let payload = self.codec.encode(header)?;
        self.put_frame(&payload)
    }

    /// Buffer an already encoded body
    pub fn write_body(&mut self, body: &[u8]) -> CodecResult<()> {
        self.put_frame(body)
    }

    /// Write everything buffered so far to the stream
    pub async fn flush(&mut self) -> CodecResult<()> {
        let result = async {
            self.writer.write_all(&self.write_buf).await?;
            self.writer.flush().await
        }
        .await;
        self.write_buf.clear();
        result.map_err(CodecError::from)
    }

    /// Write one complete message whose body is already encoded
    pub async fn write(&mut self, header: &Header, body: &[u8]) -> CodecResult<()> {
        self.write_buf.clear();
        self.write_header(header)?;
        self.write_body(body)?;
        self.flush().await
    }

    /// Encode `body` and write it together with `header`
    pub async fn write_value<T: Serialize + ?Sized>(
        &mut self,
        header: &Header,
        body: &T,
    ) -> CodecResult<()> {
        let body = self.codec.encode(body)?;
        self.write(header, &body).await
    }

    /// Shut down the outbound half
    pub async fn close(&mut self) -> CodecResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    fn put_frame(&mut self, payload: &[u8]) -> CodecResult<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len(), MAX_FRAME_SIZE));
        }
        self.write_buf.reserve(LENGTH_SIZE + payload.len());
        self.write_buf.put_u32(payload.len() as u32);
        self.write_buf.put_slice(payload);
        Ok(())
    }
}
