//! The request seam between a worker and the write endpoint.
//!
//! A [`Transport`] performs one POST and reports the response status. It does
//! not judge that status; deciding what counts as success is the worker's job.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{HeaderMap, Method, Request, StatusCode, Uri, header::CONTENT_LENGTH};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Transport`] implementations.
pub enum Error {
    /// Wrapper around [`hyper::http::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
    /// Error making HTTP request
    #[error("Failed to send HTTP request to {uri}: {source}")]
    RequestFailed {
        /// Target URI
        uri: String,
        /// Underlying client error
        #[source]
        source: Box<hyper_util::client::legacy::Error>,
    },
    /// Error reading the response body
    #[error("Failed to read response body from {uri}: {source}")]
    Body {
        /// Target URI
        uri: String,
        /// Underlying hyper error
        #[source]
        source: Box<hyper::Error>,
    },
}

#[async_trait]
/// Issue a single POST against the write endpoint.
pub trait Transport: Send + Sync {
    /// POST `body` and return the response status.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not complete: connection
    /// refused, DNS failure, a broken response and the like.
    async fn post(&self, body: Bytes) -> Result<StatusCode, Error>;
}

/// A [`Transport`] backed by a pooled hyper client.
///
/// Clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    uri: Uri,
    headers: HeaderMap,
}

impl HyperTransport {
    /// Create a new [`HyperTransport`] targeting `uri`.
    ///
    /// `headers` are appended to every request. The connection pool keeps at
    /// most `max_idle` idle connections to the target.
    #[must_use]
    pub fn new(uri: Uri, headers: HeaderMap, max_idle: usize) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle)
            .retry_canceled_requests(false)
            .build_http();
        Self {
            client,
            uri,
            headers,
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn post(&self, body: Bytes) -> Result<StatusCode, Error> {
        let block_length = body.len();
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(&self.uri)
            .header(CONTENT_LENGTH, block_length)
            .body(crate::full(body))?;
        let headers = request.headers_mut();
        for (k, v) in &self.headers {
            headers.append(k.clone(), v.clone());
        }

        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| Error::RequestFailed {
                uri: self.uri.to_string(),
                source: Box::new(source),
            })?;
        let status = response.status();
        // Drain the body so the connection returns to the pool.
        response
            .into_body()
            .collect()
            .await
            .map_err(|source| Error::Body {
                uri: self.uri.to_string(),
                source: Box::new(source),
            })?;
        Ok(status)
    }
}
