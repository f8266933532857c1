//! Segment download with chunk coalescing
//!
//! Response bodies arrive in arbitrarily small network reads. The fetcher
//! regroups them so that every chunk handed to the sink carries at least
//! [`DEFAULT_MIN_CHUNK_SIZE`] bytes, except the final remainder.

use crate::{
    error::Error,
    net::{fetch_with_retry, ByteStream, RetryPolicy, Transport},
    Result,
};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

/// Minimum bytes per yielded chunk (128 KiB)
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 128 * 1024;

/// Fetches segments with retry and exposes their bodies as coalesced chunks
pub struct SegmentFetcher {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    min_chunk_size: usize,
}

impl SegmentFetcher {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
        }
    }

    pub fn with_min_chunk_size(mut self, min_chunk_size: usize) -> Self {
        self.min_chunk_size = min_chunk_size.max(1);
        self
    }

    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size
    }

    /// Request `url` and return its body as a chunk stream.
    ///
    /// Retries happen before the first byte; a failure while the body is
    /// streaming surfaces as an error item.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch_chunks(&self, url: &Url, cancel: &CancellationToken) -> Result<ChunkedStream> {
        let response = fetch_with_retry(self.transport.as_ref(), url, &self.retry, cancel)
            .await
            .map_err(|e| segment_error(url, e))?;
        debug!(status = response.status, "Segment response started");
        Ok(ChunkedStream::new(response.body, self.min_chunk_size, cancel.clone()))
    }
}

fn segment_error(url: &Url, error: Error) -> Error {
    match error {
        Error::Aborted => Error::Aborted,
        e @ Error::HttpStatus { .. } => e,
        other => Error::SegmentFetch {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Body stream regrouped into chunks of at least `min_chunk_size` bytes.
///
/// The final chunk holds whatever remains and may be smaller. After an error
/// item the stream ends and buffered bytes are discarded.
pub struct ChunkedStream {
    inner: ByteStream,
    pending: BytesMut,
    min_chunk_size: usize,
    cancel: CancellationToken,
    done: bool,
}

impl ChunkedStream {
    pub fn new(inner: ByteStream, min_chunk_size: usize, cancel: CancellationToken) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            min_chunk_size: min_chunk_size.max(1),
            cancel,
            done: false,
        }
    }

    fn take_pending(&mut self) -> Bytes {
        self.pending.split().freeze()
    }
}

impl Stream for ChunkedStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancel.is_cancelled() {
            this.done = true;
            this.pending.clear();
            return Poll::Ready(Some(Err(Error::Aborted)));
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    if this.pending.is_empty() && bytes.len() >= this.min_chunk_size {
                        return Poll::Ready(Some(Ok(bytes)));
                    }
                    this.pending.extend_from_slice(&bytes);
                    if this.pending.len() >= this.min_chunk_size {
                        return Poll::Ready(Some(Ok(this.take_pending())));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    this.pending.clear();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if this.pending.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(this.take_pending())));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
