//! Chunked batch writes.
//!
//! The API accepts at most [`MAX_ENTITIES_PER_BATCH`] entities per create or
//! update call. [`send_batches`] splits the input into consecutive chunks and
//! sends them one at a time, in input order.

use crate::context::AccessContext;
use crate::rest::{until_cancelled, Error};
use crate::transport::{Request, Transport};
use crate::MAX_ENTITIES_PER_BATCH;
use futures_util::{stream, Stream};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Kind of batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    /// Create entities (`POST`).
    Create,
    /// Update entities (`PATCH`).
    Update,
}

impl BatchOperation {
    /// HTTP verb used by the operation.
    pub fn method(&self) -> Method {
        match self {
            BatchOperation::Create => Method::POST,
            BatchOperation::Update => Method::PATCH,
        }
    }
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOperation::Create => f.write_str("create"),
            BatchOperation::Update => f.write_str("update"),
        }
    }
}

/// Lazily sends `items` to `url` in chunks of [`MAX_ENTITIES_PER_BATCH`].
///
/// Each pulled item costs exactly one request whose body is the chunk as a
/// JSON array; the decoded response is yielded unchanged. An empty `items`
/// slice produces an empty stream without touching the network. Cancellation
/// is observed before each chunk and ends the stream without an error.
///
/// # Errors
///
/// Yields [`Error::Encode`] if a chunk cannot be serialized,
/// [`Error::Transport`] for a failed request, [`Error::EmptyResponse`] if a
/// chunk gets no content back and [`Error::Decode`] for a malformed response.
/// The stream ends after the first error; chunks already sent stay applied.
pub fn send_batches<'a, T, Req, Res>(
    transport: &'a T,
    context: &'a AccessContext,
    url: Url,
    items: &'a [Req],
    operation: BatchOperation,
    cancel: &CancellationToken,
) -> impl Stream<Item = Result<Res, Error>> + Send + 'a
where
    T: Transport + ?Sized,
    Req: Serialize + Sync,
    Res: DeserializeOwned + Send + 'a,
{
    until_cancelled(send_chunks(
        transport,
        context,
        url,
        items,
        MAX_ENTITIES_PER_BATCH,
        operation,
        cancel,
    ))
}

/// Chunked sender behind [`send_batches`]. Stopping on cancellation yields a
/// final [`Error::Cancelled`]; once every chunk has been sent the stream ends
/// normally even if `cancel` fired meanwhile.
pub(crate) fn send_chunks<'a, T, Req, Res>(
    transport: &'a T,
    context: &'a AccessContext,
    url: Url,
    items: &'a [Req],
    chunk_size: usize,
    operation: BatchOperation,
    cancel: &CancellationToken,
) -> impl Stream<Item = Result<Res, Error>> + Send + 'a
where
    T: Transport + ?Sized,
    Req: Serialize + Sync,
    Res: DeserializeOwned + Send + 'a,
{
    let chunk_size = chunk_size.max(1);
    let total = items.len().div_ceil(chunk_size);
    let cancel = cancel.clone();

    stream::try_unfold((items.chunks(chunk_size), 0usize), move |(mut chunks, sent)| {
        let cancel = cancel.clone();
        let url = url.clone();
        async move {
            let Some(chunk) = chunks.next() else {
                return Ok(None);
            };
            if cancel.is_cancelled() {
                debug!(
                    %operation,
                    url = %url,
                    sent,
                    remaining = total - sent,
                    "Batch write cancelled"
                );
                return Err(Error::Cancelled);
            }

            let body = serde_json::to_value(chunk).map_err(|source| Error::Encode { source })?;
            debug!(
                %operation,
                url = %url,
                chunk = sent + 1,
                chunks = total,
                size = chunk.len(),
                "Sending batch"
            );
            let response = transport
                .send(Request::with_body(
                    operation.method(),
                    url.clone(),
                    context,
                    body,
                ))
                .await
                .map_err(|source| Error::Transport { source })?;
            if response.is_null() {
                return Err(Error::EmptyResponse {
                    url: url.to_string(),
                });
            }

            let decoded: Res = serde_json::from_value(response).map_err(|source| Error::Decode {
                url: url.to_string(),
                source,
            })?;
            Ok(Some((decoded, (chunks, sent + 1))))
        }
    })
}
