//! Client-side record of one invocation

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::codec::CodecType;
use crate::error::{RpcError, RpcResult};

/// Capacity of a queue created by [`completion_queue`]
pub const DEFAULT_COMPLETION_QUEUE_SIZE: usize = 10;

/// One RPC, delivered on its completion queue once it has finished
#[derive(Debug)]
pub struct Call<A, R> {
    /// Sequence number assigned when the call was sent
    pub seq: u64,
    /// `"Service.Method"`
    pub service_method: String,
    pub args: A,
    /// Reply slot, overwritten with the decoded response on success
    pub reply: R,
    pub error: Option<RpcError>,
}

impl<A, R> Call<A, R> {
    /// Turn the finished call into its reply or its error
    pub fn into_result(self) -> RpcResult<R> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.reply),
        }
    }
}

/// Queue on which finished calls of one type are delivered
pub fn completion_queue<A, R>() -> (mpsc::Sender<Call<A, R>>, mpsc::Receiver<Call<A, R>>) {
    completion_queue_with_capacity(DEFAULT_COMPLETION_QUEUE_SIZE)
}

/// Completion queue holding up to `capacity` finished calls.
///
/// # Panics
///
/// Panics if `capacity` is 0; a queue that cannot buffer a single call would
/// stall the response reader.
pub fn completion_queue_with_capacity<A, R>(
    capacity: usize,
) -> (mpsc::Sender<Call<A, R>>, mpsc::Receiver<Call<A, R>>) {
    mpsc::channel(capacity)
}

/// A call waiting in the pending table, with its reply type erased
#[async_trait]
pub(crate) trait PendingCall: Send {
    /// Finish the call with a response body or an error.
    ///
    /// Consumes the entry, so a call cannot be completed twice.
    async fn complete(self: Box<Self>, outcome: RpcResult<Bytes>, codec: CodecType);
}

pub(crate) struct Pending<A, R> {
    pub(crate) call: Call<A, R>,
    pub(crate) done: mpsc::Sender<Call<A, R>>,
}

#[async_trait]
impl<A, R> PendingCall for Pending<A, R>
where
    A: Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    async fn complete(self: Box<Self>, outcome: RpcResult<Bytes>, codec: CodecType) {
        let Pending { mut call, done } = *self;

        match outcome.and_then(|body| Ok(codec.decode::<R>(&body)?)) {
            Ok(reply) => call.reply = reply,
            Err(err) => call.error = Some(err),
        }

        let seq = call.seq;
        if done.send(call).await.is_err() {
            tracing::debug!("rpc client: completion queue for call {} was dropped", seq);
        }
    }
}
