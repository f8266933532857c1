//! HTTP transport and retry

mod retry;

pub use retry::{fetch_with_retry, should_retry_status, RetryPolicy};

use crate::{error::Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Response body as a stream of byte chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Status and streaming body of a GET request
pub struct TransportResponse {
    pub url: Url,
    pub status: u16,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn new(url: Url, status: u16, body: ByteStream) -> Self {
        Self { url, status, body }
    }

    /// Response carrying a fully buffered body
    pub fn from_bytes(url: Url, status: u16, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::new(url, status, Box::pin(futures::stream::once(async move { Ok::<_, Error>(data) })))
    }

    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collect the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        let collected = self
            .body
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok::<_, Error>(acc)
            })
            .await?;
        Ok(collected.freeze())
    }

    /// Collect the body as text, replacing invalid UTF-8
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues GET requests for playlists and segments
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a GET request. Non-2xx statuses are returned, not raised.
    async fn get(&self, url: &Url) -> Result<TransportResponse>;
}

/// [`Transport`] backed by reqwest
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a client with the given connect timeout. No overall timeout is
    /// set since segment bodies are streamed.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("kino-stream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<TransportResponse> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status().as_u16();
        debug!(url = %url, status, "Response received");
        let body = response.bytes_stream().map(|chunk| chunk.map_err(Error::from));
        Ok(TransportResponse::new(url.clone(), status, Box::pin(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn url() -> Url {
        Url::parse("https://cdn.example.com/a.m3u8").unwrap()
    }

    #[tokio::test]
    async fn test_response_text_collects_chunks() {
        let body = stream::iter(vec![
            Ok::<_, Error>(Bytes::from_static(b"#EXT")),
            Ok(Bytes::from_static(b"M3U")),
        ]);
        let response = TransportResponse::new(url(), 200, Box::pin(body));
        assert!(response.is_success());
        assert_eq!(response.text().await.unwrap(), "#EXTM3U");
    }

    #[tokio::test]
    async fn test_response_text_is_lossy() {
        let response = TransportResponse::from_bytes(url(), 200, vec![b'o', b'k', 0xff]);
        assert_eq!(response.text().await.unwrap(), "ok\u{fffd}");
    }

    #[tokio::test]
    async fn test_response_body_error_propagates() {
        let body = stream::iter(vec![
            Ok::<_, Error>(Bytes::from_static(b"partial")),
            Err(Error::transient("connection reset")),
        ]);
        let response = TransportResponse::new(url(), 200, Box::pin(body));
        assert!(response.bytes().await.is_err());
    }

    #[test]
    fn test_non_success_status() {
        let response = TransportResponse::from_bytes(url(), 404, "");
        assert!(!response.is_success());
        assert!(format!("{:?}", response).contains("404"));
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(Duration::from_secs(5)).is_ok());
    }
}
