//! Pluggable HTTP transport.
//!
//! The engine never talks to a socket directly — every send goes through an
//! [`HttpSink`], so tests can swap in a mock and production code can swap in
//! whatever client fits its runtime. [`ReqwestSink`] is the bundled,
//! production-grade implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tracing::instrument;

use crate::error::TransportError;

/// A predicate polled between I/O slices; returning `true` cancels the
/// in-flight request with [`TransportError::Cancelled`].
pub type CancelPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// An HTTP response: status code plus raw body bytes. Callers are
/// responsible for parsing the body as JSON via `Context`'s extraction
/// methods.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl Response {
    /// Whether `status` is in the `200..300` range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pluggable HTTP transport used by the chat facade.
///
/// Implementors own their own timeout, TLS, and redirect policy. `post`
/// blocks the calling thread; `post_async` and `post_stream` are async.
/// Every method accepts a [`CancelPredicate`] polled between I/O slices so a
/// caller can abort a request already in flight.
#[async_trait]
pub trait HttpSink: Send + Sync {
    /// Send `body` with `headers` to `url`, blocking the calling thread.
    fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        cancel: CancelPredicate,
    ) -> Result<Response, TransportError>;

    /// Send `body` with `headers` to `url`, without blocking the executor.
    async fn post_async(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        cancel: CancelPredicate,
    ) -> Result<Response, TransportError>;

    /// Send `body` with `headers` to `url`, returning a stream of raw body
    /// chunks as they arrive (before any SSE framing is applied).
    async fn post_stream(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        cancel: CancelPredicate,
    ) -> Result<BoxStream<'static, Result<Bytes, TransportError>>, TransportError>;
}

/// [`HttpSink`] backed by `reqwest`, with TLS verification and HTTP/2 on by
/// default and a generous floor on the request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestSink {
    client: reqwest::Client,
}

impl ReqwestSink {
    /// Minimum timeout this sink will accept; shorter values are clamped up
    /// to this floor so a misconfigured caller can't starve slow providers.
    pub const MIN_TIMEOUT: Duration = Duration::from_secs(60);

    /// Build a sink with the given request timeout (clamped to at least
    /// [`Self::MIN_TIMEOUT`]), TLS verification on, redirects followed, and
    /// HTTP/2 negotiated where the server supports it.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let timeout = timeout.max(Self::MIN_TIMEOUT);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Sink(e.to_string()))?;
        Ok(Self { client })
    }

    fn header_map(headers: &HashMap<String, String>) -> Result<reqwest::header::HeaderMap, TransportError> {
        let mut map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| TransportError::Sink(format!("invalid header name {k}: {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(v)
                .map_err(|e| TransportError::Sink(format!("invalid header value for {k}: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

impl Default for ReqwestSink {
    fn default() -> Self {
        Self::new(Self::MIN_TIMEOUT).expect("default reqwest client builds")
    }
}

#[async_trait]
impl HttpSink for ReqwestSink {
    #[instrument(skip(self, headers, body, cancel), fields(url = %url))]
    fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        cancel: CancelPredicate,
    ) -> Result<Response, TransportError> {
        let handle = tokio::runtime::Handle::try_current();
        match handle {
            Ok(handle) => tokio::task::block_in_place(|| {
                handle.block_on(self.post_async(url, headers, body, cancel))
            }),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| TransportError::Sink(e.to_string()))?;
                runtime.block_on(self.post_async(url, headers, body, cancel))
            }
        }
    }

    #[instrument(skip(self, headers, body, cancel), fields(url = %url))]
    async fn post_async(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        cancel: CancelPredicate,
    ) -> Result<Response, TransportError> {
        let header_map = Self::header_map(headers)?;
        let request = self
            .client
            .post(url)
            .headers(header_map)
            .body(body.to_vec())
            .send();

        let response = race_with_cancellation(request, &cancel).await?;
        let status = response.status().as_u16();
        let bytes = race_with_cancellation(response.bytes(), &cancel)
            .await
            .map_err(|e| TransportError::Sink(e.to_string()))?;

        Ok(Response {
            status,
            body: bytes.to_vec(),
        })
    }

    async fn post_stream(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
        cancel: CancelPredicate,
    ) -> Result<BoxStream<'static, Result<Bytes, TransportError>>, TransportError> {
        use futures::StreamExt;

        let header_map = Self::header_map(headers)?;
        let request = self
            .client
            .post(url)
            .headers(header_map)
            .body(body.to_vec())
            .send();

        let response = race_with_cancellation(request, &cancel).await?;
        let byte_stream = response.bytes_stream();

        let cancel = Arc::clone(&cancel);
        let stream = byte_stream.map(move |chunk| {
            if cancel() {
                return Err(TransportError::Cancelled);
            }
            chunk.map_err(|e| TransportError::Sink(e.to_string()))
        });

        Ok(Box::pin(stream))
    }
}

/// Race a future against a poll of `cancel`, checked on a short interval.
/// `reqwest` has no native mid-flight cancellation hook, so this adapts the
/// `HttpSink` contract's cooperative-cancellation requirement on top of it.
async fn race_with_cancellation<F, T>(future: F, cancel: &CancelPredicate) -> Result<T, TransportError>
where
    F: std::future::Future<Output = reqwest::Result<T>>,
{
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    tokio::pin!(future);
    loop {
        tokio::select! {
            result = &mut future => {
                return result.map_err(|e| TransportError::Sink(e.to_string()));
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if cancel() {
                    return Err(TransportError::Cancelled);
                }
            }
        }
    }
}
