//! RPC client
//!
//! A [`Client`] owns one connection. Calls are written under a send lock and
//! parked in a pending table keyed by sequence number; a background task reads
//! responses and completes the matching calls in whatever order they arrive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex};

use super::call::{Call, Pending, PendingCall};
use super::connection::{Connection, ConnectionReader, ConnectionWriter};
use super::{ByteStream, NetworkConfig};
use crate::codec::CodecType;
use crate::error::{RpcError, RpcResult};
use crate::protocol::{HandshakeOption, Header};

/// Mutable client state, guarded by a lock that is never held across I/O
struct ClientState {
    /// Next sequence number to hand out
    seq: u64,
    pending: HashMap<u64, Box<dyn PendingCall>>,
    /// `close` was called
    closing: bool,
    /// The connection failed
    shutdown: bool,
}

struct ClientInner {
    option: HandshakeOption,
    /// Send lock; every request is written while holding it
    sending: Mutex<ConnectionWriter>,
    state: StdMutex<ClientState>,
    /// Set once the client is closed or its connection has failed; wakes the
    /// response reader and any writer blocked on the stream
    closed: watch::Sender<bool>,
}

/// Handle to one client connection; cheap to clone
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Run the handshake on `stream` and start reading responses
    pub async fn new<S: ByteStream>(stream: S, option: HandshakeOption) -> RpcResult<Self> {
        let conn = Connection::handshake_client(Box::new(stream), option).await?;
        let (reader, writer) = conn.into_split();

        let inner = Arc::new(ClientInner {
            option,
            sending: Mutex::new(writer),
            state: StdMutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            closed: watch::Sender::new(false),
        });

        tokio::spawn(receive(inner.clone(), reader));

        Ok(Self { inner })
    }

    /// Connect over TCP with the default connect timeout
    pub async fn dial<A: ToSocketAddrs>(addr: A, option: HandshakeOption) -> RpcResult<Self> {
        let timeout = Duration::from_millis(NetworkConfig::default().connect_timeout_ms);
        Self::dial_timeout(addr, option, timeout).await
    }

    /// Connect over TCP, giving up after `timeout`
    pub async fn dial_timeout<A: ToSocketAddrs>(
        addr: A,
        option: HandshakeOption,
        timeout: Duration,
    ) -> RpcResult<Self> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(RpcError::Connection(format!(
                    "connect timeout after {:?}",
                    timeout
                )))
            }
        };
        let _ = stream.set_nodelay(true);

        Self::new(stream, option).await
    }

    /// Codec negotiated for this connection
    pub fn codec(&self) -> CodecType {
        self.inner.option.codec_type
    }

    /// Whether new calls can still be sent
    pub fn is_available(&self) -> bool {
        let state = self.inner.lock_state();
        !state.closing && !state.shutdown
    }

    /// Send a call without waiting for its response.
    ///
    /// Returns the call's sequence number. The finished [`Call`] is pushed to
    /// `done` exactly once, including when the connection fails before a
    /// response arrives. Fails immediately with [`RpcError::Shutdown`] once
    /// the client is closed or its connection is gone.
    pub async fn go<A, R>(
        &self,
        service_method: &str,
        args: A,
        reply: R,
        done: mpsc::Sender<Call<A, R>>,
    ) -> RpcResult<u64>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let codec = self.codec();
        let body = codec.encode(&args)?;

        let mut sending = self.inner.sending.lock().await;

        let seq = {
            let mut state = self.inner.lock_state();
            if state.closing || state.shutdown {
                return Err(RpcError::Shutdown);
            }
            let seq = state.seq;
            state.seq += 1;
            let call = Call {
                seq,
                service_method: service_method.to_string(),
                args,
                reply,
                error: None,
            };
            state.pending.insert(seq, Box::new(Pending { call, done }));
            seq
        };

        let header = Header::request(service_method, seq);
        let written = tokio::select! {
            result = sending.write(&header, &body) => result.map_err(RpcError::from),
            _ = self.inner.wait_closed() => Err(RpcError::Shutdown),
        };
        drop(sending);

        if let Err(e) = written {
            tracing::debug!("rpc client: write of call {} failed: {}", seq, e);
            if let Some(call) = self.inner.remove_call(seq) {
                call.complete(Err(e), codec).await;
            }
        }

        Ok(seq)
    }

    /// Send a call and wait for its reply
    pub async fn call<A, R>(&self, service_method: &str, args: A) -> RpcResult<R>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Default + Send + 'static,
    {
        let (done, mut completed) = mpsc::channel(1);
        self.go(service_method, args, R::default(), done).await?;

        match completed.recv().await {
            Some(call) => call.into_result(),
            None => Err(RpcError::Shutdown),
        }
    }

    /// Close the connection.
    ///
    /// Calls still pending are failed by the response reader, and a write
    /// blocked on the stream is abandoned. Closing twice returns
    /// [`RpcError::Shutdown`].
    pub async fn close(&self) -> RpcResult<()> {
        {
            let mut state = self.inner.lock_state();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }

        self.inner.closed.send_replace(true);
        let mut sending = self.inner.sending.lock().await;
        sending.close().await?;
        Ok(())
    }
}

impl ClientInner {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_call(&self, seq: u64) -> Option<Box<dyn PendingCall>> {
        self.lock_state().pending.remove(&seq)
    }

    /// Resolves once the client is closed or its connection has failed
    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        loop {
            let done = *closed.borrow_and_update();
            if done || closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fail every pending call with `err` and refuse new ones
    async fn terminate_calls(&self, err: RpcError) {
        let pending: Vec<_> = {
            // `go` registers under the same lock, so nothing slips in
            // between the drain and the shutdown flag.
            let mut state = self.lock_state();
            state.shutdown = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };
        self.closed.send_replace(true);

        if !pending.is_empty() {
            tracing::debug!("rpc client: failing {} pending calls: {}", pending.len(), err);
        }
        for call in pending {
            call.complete(Err(err.clone()), self.option.codec_type).await;
        }
    }
}

/// Response reader; runs until the connection fails or the client is closed
async fn receive(inner: Arc<ClientInner>, mut reader: ConnectionReader) {
    let codec = reader.codec();

    let err = loop {
        let header = tokio::select! {
            result = reader.read_header() => match result {
                Ok(header) => header,
                Err(e) => break RpcError::from(e),
            },
            _ = inner.wait_closed() => break RpcError::Shutdown,
        };

        let result = match inner.remove_call(header.seq) {
            None => {
                tracing::debug!("rpc client: discarding response for unknown call {}", header.seq);
                reader.discard_body().await
            }
            Some(call) if header.is_error() => {
                let result = reader.discard_body().await;
                call.complete(Err(RpcError::Remote(header.error)), codec).await;
                result
            }
            Some(call) => match reader.read_body().await {
                Ok(body) => {
                    call.complete(Ok(body), codec).await;
                    Ok(())
                }
                Err(e) => {
                    let err = RpcError::from(e);
                    call.complete(Err(err.clone()), codec).await;
                    break err;
                }
            },
        };

        if let Err(e) = result {
            break RpcError::from(e);
        }
    };

    tracing::debug!("rpc client: response reader stopped: {}", err);
    inner.terminate_calls(err).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecReader, CodecWriter};
    use crate::network::call::completion_queue;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Hand-driven server side of a client connection
    struct FakeServer {
        reader: CodecReader<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: CodecWriter<tokio::io::WriteHalf<DuplexStream>>,
    }

    impl FakeServer {
        async fn read_request(&mut self) -> (Header, u32) {
            let header = self.reader.read_header().await.unwrap();
            let arg = self.reader.read_body_into().await.unwrap();
            (header, arg)
        }

        async fn reply(&mut self, seq: u64, value: u32) {
            let header = Header {
                service_method: "Echo.Echo".to_string(),
                seq,
                error: String::new(),
            };
            self.writer.write_value(&header, &value).await.unwrap();
        }
    }

    async fn connect(codec: CodecType) -> (Client, FakeServer) {
        connect_with_buffer(codec, 64 * 1024).await
    }

    async fn connect_with_buffer(codec: CodecType, max_buf_size: usize) -> (Client, FakeServer) {
        let (client_end, server_end) = tokio::io::duplex(max_buf_size);
        let option = HandshakeOption::new().with_codec_type(codec);
        let client = Client::new(client_end, option).await.unwrap();

        let (read_half, write_half) = tokio::io::split(server_end);
        let mut read_half = BufReader::new(read_half);
        let mut line = String::new();
        read_half.read_line(&mut line).await.unwrap();
        assert!(line.contains("MagicNumber"));

        let server = FakeServer {
            reader: CodecReader::new(read_half, codec),
            writer: CodecWriter::new(write_half, codec),
        };
        (client, server)
    }

    #[tokio::test]
    async fn test_sequence_numbers_strictly_increase() {
        let (client, mut server) = connect(CodecType::Bincode).await;
        let (done, _completed) = completion_queue::<u32, u32>();

        let mut issued = Vec::new();
        for i in 0..5 {
            issued.push(client.go("Echo.Echo", i, 0, done.clone()).await.unwrap());
        }
        assert_eq!(issued, [1, 2, 3, 4, 5]);

        for expected in issued {
            let (header, _) = server.read_request().await;
            assert_eq!(header.seq, expected);
            assert!(header.error.is_empty());
        }
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlated_by_seq() {
        let (client, mut server) = connect(CodecType::Json).await;
        let (done, mut completed) = completion_queue::<u32, u32>();

        for i in 0..3 {
            client.go("Echo.Echo", i * 10, 0, done.clone()).await.unwrap();
        }

        let mut requests = Vec::new();
        for _ in 0..3 {
            requests.push(server.read_request().await);
        }
        for (header, arg) in requests.into_iter().rev() {
            server.reply(header.seq, arg + 1).await;
        }

        for _ in 0..3 {
            let call = completed.recv().await.unwrap();
            assert!(call.error.is_none());
            assert_eq!(call.reply, call.args + 1);
        }
    }

    #[tokio::test]
    async fn test_unknown_seq_is_discarded() {
        let (client, mut server) = connect(CodecType::Bincode).await;

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.call::<u32, u32>("Echo.Echo", 4).await }
        });

        let (header, arg) = server.read_request().await;
        server.reply(999, 0).await;
        server.reply(header.seq, arg * 2).await;

        assert_eq!(pending.await.unwrap().unwrap(), 8);
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (client, mut server) = connect(CodecType::Bincode).await;

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.call::<u32, u32>("Echo.Echo", 1).await }
        });

        let (mut header, _) = server.read_request().await;
        header.error = "division by zero".to_string();
        server.writer.write_value(&header, &()).await.unwrap();

        assert_eq!(
            pending.await.unwrap().unwrap_err(),
            RpcError::Remote("division by zero".to_string())
        );
        // The connection is still usable afterwards
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_broken_stream_fails_every_pending_call() {
        let (client, mut server) = connect(CodecType::Bincode).await;
        let (done, mut completed) = completion_queue::<u32, u32>();

        const K: u32 = 4;
        for i in 0..K {
            client.go("Echo.Echo", i, 0, done.clone()).await.unwrap();
        }
        for _ in 0..K {
            server.read_request().await;
        }
        drop(server);

        let mut failed = 0;
        while failed < K {
            let call = tokio::time::timeout(Duration::from_secs(5), completed.recv())
                .await
                .expect("pending call never completed")
                .unwrap();
            assert!(matches!(call.error, Some(RpcError::Connection(_))));
            failed += 1;
        }

        assert!(!client.is_available());
        assert_eq!(
            client.go("Echo.Echo", 0, 0, done).await.unwrap_err(),
            RpcError::Shutdown
        );
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_rejects_new_calls() {
        let (client, mut server) = connect(CodecType::Bincode).await;
        let (done, mut completed) = completion_queue::<u32, u32>();

        client.go("Echo.Echo", 1, 0, done.clone()).await.unwrap();
        server.read_request().await;

        client.close().await.unwrap();
        assert!(!client.is_available());

        let call = tokio::time::timeout(Duration::from_secs(5), completed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(call.error.is_some());

        assert_eq!(
            client.go("Echo.Echo", 2, 0, done).await.unwrap_err(),
            RpcError::Shutdown
        );
        assert_eq!(client.close().await.unwrap_err(), RpcError::Shutdown);
    }

    #[tokio::test]
    async fn test_close_while_write_is_blocked() {
        // The peer stays connected but never reads, so the write stalls
        let (client, _server) = connect_with_buffer(CodecType::Bincode, 256).await;
        let (done, mut completed) = completion_queue::<Vec<u8>, u32>();

        let writer = tokio::spawn({
            let client = client.clone();
            async move { client.go("Echo.Echo", vec![7u8; 100_000], 0, done).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(2), client.close())
            .await
            .expect("close blocked behind a stalled write")
            .unwrap();

        let call = tokio::time::timeout(Duration::from_secs(2), completed.recv())
            .await
            .expect("pending call never completed")
            .unwrap();
        assert_eq!(call.error, Some(RpcError::Shutdown));
        assert_eq!(call.reply, 0);
        assert!(writer.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_argument_keeps_connection() {
        let (client, mut server) = connect(CodecType::Bincode).await;
        let (done, mut completed) = completion_queue::<Vec<u8>, u32>();

        let huge = vec![0u8; crate::codec::MAX_FRAME_SIZE + 1];
        client.go("Echo.Echo", huge, 0, done).await.unwrap();
        let call = completed.recv().await.unwrap();
        assert!(matches!(call.error, Some(RpcError::Encode(_))));
        assert!(client.is_available());

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.call::<u32, u32>("Echo.Echo", 5).await }
        });
        let (header, arg) = server.read_request().await;
        server.reply(header.seq, arg + 1).await;
        assert_eq!(pending.await.unwrap().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_handshake_write_failure() {
        let (client_end, server_end) = tokio::io::duplex(64);
        drop(server_end);

        let err = Client::new(client_end, HandshakeOption::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::Connection(_)));
    }
}
