//! RPC server
//!
//! The server accepts connections, runs the handshake on each one and then
//! reads requests in a loop. Every decoded request is dispatched to its own
//! task; responses from all tasks share one send lock so header and body
//! bytes of different responses never interleave.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex, Notify, OwnedSemaphorePermit, Semaphore};

use super::connection::{Connection, ConnectionWriter};
use super::registry::{Argv, MethodType, Registry, RpcService, Service, ServiceBuilder};
use super::{ByteStream, NetworkConfig};
use crate::codec::{CodecError, CodecReader, CodecResult, CodecType, MAX_FRAME_SIZE};
use crate::error::{RpcError, RpcResult};
use crate::protocol::Header;

/// A decoded request ready to be dispatched
struct Request {
    header: Header,
    argv: Argv,
    method: Arc<MethodType>,
}

/// Result of reading one message from the request stream
enum Inbound {
    Request(Request),
    /// The message could not be resolved or decoded; its body has been
    /// drained and the error goes back to the caller
    Invalid { header: Header, error: RpcError },
}

/// State shared by the request loop and the request tasks of one connection
struct ConnectionContext {
    codec: CodecType,
    /// Send lock; every response is written while holding it
    sending: Mutex<ConnectionWriter>,
    /// Signalled when a response could not be written
    broken: Notify,
}

/// RPC server; cheap to clone, clones share the same registry
#[derive(Clone, Default)]
pub struct Server {
    registry: Arc<Registry>,
    config: NetworkConfig,
}

impl Server {
    /// Create a new server
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    /// Register a receiver under its type name
    pub fn register<S: RpcService>(&self, receiver: S) -> RpcResult<()> {
        self.register_service(S::register_methods(ServiceBuilder::new(receiver)).build())
    }

    /// Register a service built by hand
    pub fn register_service(&self, service: Service) -> RpcResult<()> {
        self.registry.register(service)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind to `addr` and serve until the listener fails
    pub async fn serve<A: ToSocketAddrs>(&self, addr: A) -> RpcResult<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("rpc server: listening on {}", listener.local_addr()?);
        self.accept(listener).await;
        Ok(())
    }

    /// Accept connections until the listener returns an error
    pub async fn accept(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::info!("rpc server: new connection from {}", addr);
                    let _ = stream.set_nodelay(true);
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream).await;
                        tracing::info!("rpc server: connection from {} closed", addr);
                    });
                }
                Err(e) => {
                    tracing::error!("rpc server: accept error: {}", e);
                    return;
                }
            }
        }
    }

    /// Serve a single connection until the peer goes away
    pub async fn serve_conn<S: ByteStream>(&self, stream: S) {
        let conn = match Connection::handshake_server(Box::new(stream)).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("rpc server: handshake error: {}", e);
                return;
            }
        };
        self.serve_codec(conn).await;
    }

    async fn serve_codec(&self, conn: Connection) {
        let (mut reader, writer) = conn.into_split();
        let ctx = Arc::new(ConnectionContext {
            codec: reader.codec(),
            sending: Mutex::new(writer),
            broken: Notify::new(),
        });
        let limiter = self
            .config
            .max_inflight_requests
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        // Each request task holds a clone of the sender; `recv` returns
        // `None` once all of them are gone.
        let (inflight_tx, mut inflight_rx) = mpsc::channel::<()>(1);

        loop {
            let inbound = tokio::select! {
                result = read_request(&self.registry, &mut reader) => result,
                _ = ctx.broken.notified() => {
                    tracing::debug!("rpc server: closing connection after failed write");
                    break;
                }
            };

            match inbound {
                Err(e) => {
                    tracing::debug!("rpc server: request loop ended: {}", e);
                    break;
                }
                Ok(Inbound::Invalid { header, error }) => {
                    tracing::debug!("rpc server: bad request {}: {}", header.seq, error);
                    if !send_error(&ctx, header, &error).await {
                        break;
                    }
                }
                Ok(Inbound::Request(request)) => {
                    let permit = acquire(limiter.as_ref()).await;
                    let ctx = ctx.clone();
                    let inflight = inflight_tx.clone();
                    tokio::spawn(async move {
                        handle_request(&ctx, request).await;
                        drop(permit);
                        drop(inflight);
                    });
                }
            }
        }

        drop(inflight_tx);
        let _ = inflight_rx.recv().await;

        let mut sending = ctx.sending.lock().await;
        let _ = sending.close().await;
    }
}

async fn acquire(limiter: Option<&Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match limiter {
        Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        None => None,
    }
}

/// Read the next request.
///
/// Only a failure to read a header, or a body that cannot be read off the
/// stream, is returned as an error; everything else becomes
/// [`Inbound::Invalid`].
async fn read_request<R: AsyncRead + Unpin>(
    registry: &Registry,
    reader: &mut CodecReader<R>,
) -> CodecResult<Inbound> {
    let header = reader.read_header().await?;

    let method = match registry.resolve(&header.service_method) {
        Ok(method) => method,
        Err(error) => {
            reader.discard_body().await?;
            return Ok(Inbound::Invalid { header, error });
        }
    };

    let body = reader.read_body().await?;
    match method.decode_argv(reader.codec(), &body) {
        Ok(argv) => Ok(Inbound::Request(Request {
            header,
            argv,
            method,
        })),
        Err(error) => Ok(Inbound::Invalid { header, error }),
    }
}

/// Invoke the method and send its response.
///
/// A panic inside the method is caught here and reported to the caller; the
/// connection keeps running.
async fn handle_request(ctx: &ConnectionContext, request: Request) {
    let Request {
        header,
        argv,
        method,
    } = request;

    let outcome = AssertUnwindSafe(method.invoke(argv, ctx.codec))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let reason = panic_message(payload.as_ref());
            tracing::error!(
                "rpc server: {} panicked: {}",
                header.service_method,
                reason
            );
            Err(RpcError::MalformedRequest(format!(
                "{} panicked: {}",
                header.service_method, reason
            )))
        })
        .and_then(|body| {
            if body.len() > MAX_FRAME_SIZE {
                return Err(RpcError::Encode(format!(
                    "reply of {} bytes exceeds the {} byte frame limit",
                    body.len(),
                    MAX_FRAME_SIZE
                )));
            }
            Ok(body)
        });

    match outcome {
        Ok(body) => {
            send_response(ctx, &header, &body).await;
        }
        Err(error) => {
            send_error(ctx, header, &error).await;
        }
    }
}

async fn send_error(ctx: &ConnectionContext, mut header: Header, error: &RpcError) -> bool {
    header.error = error.to_string();
    match ctx.codec.encode(&()) {
        Ok(body) => send_response(ctx, &header, &body).await,
        Err(e) => {
            tracing::error!("rpc server: encoding error body: {}", e);
            false
        }
    }
}

/// Write one response under the send lock.
///
/// A failed write leaves the stream in an unknown state, so it closes the
/// connection. An oversized frame is rejected before anything is written and
/// leaves the stream intact.
async fn send_response(ctx: &ConnectionContext, header: &Header, body: &[u8]) -> bool {
    let mut sending = ctx.sending.lock().await;
    match sending.write(header, body).await {
        Ok(()) => true,
        Err(e @ CodecError::FrameTooLarge(..)) => {
            tracing::error!("rpc server: dropping response {}: {}", header.seq, e);
            true
        }
        Err(e) => {
            tracing::error!("rpc server: write response error: {}", e);
            ctx.broken.notify_one();
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
