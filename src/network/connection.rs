//! Connection setup shared by clients and servers
//!
//! Performs the handshake on a raw byte stream and splits it into a framed
//! reader and writer bound to the negotiated codec.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use crate::codec::{CodecReader, CodecWriter};
use crate::protocol::{HandshakeOption, HandshakeResult};

/// Any bidirectional byte stream a connection can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Framed inbound half of a connection
pub type ConnectionReader = CodecReader<BufReader<ReadHalf<BoxedStream>>>;

/// Framed outbound half of a connection
pub type ConnectionWriter = CodecWriter<WriteHalf<BoxedStream>>;

/// A connection that has completed its handshake
pub struct Connection {
    option: HandshakeOption,
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl Connection {
    /// Perform the client-side handshake.
    ///
    /// The stream is shut down if the option cannot be written.
    pub async fn handshake_client(
        stream: BoxedStream,
        option: HandshakeOption,
    ) -> HandshakeResult<Self> {
        let (read_half, mut write_half) = tokio::io::split(stream);

        if let Err(e) = option.write_to(&mut write_half).await {
            tracing::warn!("rpc client: options error: {}", e);
            let _ = write_half.shutdown().await;
            return Err(e);
        }

        Ok(Self::from_halves(option, BufReader::new(read_half), write_half))
    }

    /// Perform the server-side handshake
    pub async fn handshake_server(stream: BoxedStream) -> HandshakeResult<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut read_half = BufReader::new(read_half);

        let option = HandshakeOption::read_from(&mut read_half).await?;
        tracing::debug!("Handshake complete, codec {}", option.codec_type);

        Ok(Self::from_halves(option, read_half, write_half))
    }

    fn from_halves(
        option: HandshakeOption,
        read_half: BufReader<ReadHalf<BoxedStream>>,
        write_half: WriteHalf<BoxedStream>,
    ) -> Self {
        Self {
            option,
            reader: CodecReader::new(read_half, option.codec_type),
            writer: CodecWriter::new(write_half, option.codec_type),
        }
    }

    /// Get the negotiated option
    pub fn option(&self) -> &HandshakeOption {
        &self.option
    }

    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecType;
    use crate::protocol::Header;

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let (client, server) = tokio::io::duplex(4096);
        let option = HandshakeOption::new().with_codec_type(CodecType::Json);

        let (client_conn, server_conn) = tokio::join!(
            Connection::handshake_client(Box::new(client), option),
            Connection::handshake_server(Box::new(server)),
        );
        let client_conn = client_conn.unwrap();
        let server_conn = server_conn.unwrap();
        assert_eq!(server_conn.option(), &option);

        let (_, mut writer) = client_conn.into_split();
        let (mut reader, _) = server_conn.into_split();
        assert_eq!(reader.codec(), CodecType::Json);

        writer
            .write_value(&Header::request("Arith.Sum", 1), &5u32)
            .await
            .unwrap();
        assert_eq!(reader.read_header().await.unwrap().seq, 1);
        assert_eq!(reader.read_body_into::<u32>().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_server_handshake_on_closed_stream() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        assert!(Connection::handshake_server(Box::new(server)).await.is_err());
    }
}
