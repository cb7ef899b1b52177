//! The write endpoint sink.
//!
//! A minimal stand-in for a time-series database's HTTP surface. `/write`
//! accepts any body, counts it and answers with the configured status, 204
//! by default. `/ping` always answers 204. Every other path answers 404.
//!
//! ## Metrics
//!
//! `requests_received`: Total write requests received
//! `bytes_received`: Total write body bytes received
//! `lines_received`: Total non-empty line protocol lines received
//!
//! The `Authorization` header of each write, when present, is recorded in
//! [`Stats`] but never checked.
//!

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{AUTHORIZATION, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

fn default_concurrent_requests_max() -> usize {
    1_000
}

fn default_status_code() -> u16 {
    StatusCode::NO_CONTENT.as_u16()
}

/// Errors produced by [`Sink`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The configured status code was not valid.
    #[error("The configured status code was not valid: {0}")]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Sink`]
pub struct Config {
    /// address -- IP plus port -- to bind to
    pub binding_addr: SocketAddr,
    /// the status code to answer `/write` with, defaults to 204
    #[serde(default = "default_status_code")]
    pub status: u16,
    /// number of concurrent HTTP connections to allow
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
}

impl Config {
    /// Construct a [`Config`] answering 204 on `binding_addr`.
    #[must_use]
    pub fn new(binding_addr: SocketAddr) -> Self {
        Self {
            binding_addr,
            status: default_status_code(),
            concurrent_requests_max: default_concurrent_requests_max(),
        }
    }
}

/// Counters of what a [`Sink`] has received over `/write`.
#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    bytes: AtomicU64,
    lines: AtomicU64,
    authorized: AtomicU64,
    last_authorization: Mutex<Option<HeaderValue>>,
}

impl Stats {
    /// Write requests received
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Write body bytes received
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Non-empty lines received
    #[must_use]
    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    /// Write requests that carried an `Authorization` header
    #[must_use]
    pub fn authorized(&self) -> u64 {
        self.authorized.load(Ordering::Relaxed)
    }

    /// The most recent `Authorization` header received, if any
    #[must_use]
    pub fn last_authorization(&self) -> Option<HeaderValue> {
        self.last_authorization
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_authorization(&self, value: &HeaderValue) {
        self.authorized.fetch_add(1, Ordering::Relaxed);
        *self
            .last_authorization
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
    }
}

#[derive(Debug)]
/// The write endpoint sink.
pub struct Sink {
    listener: TcpListener,
    status: StatusCode,
    concurrency_limit: usize,
    stats: Arc<Stats>,
    metric_labels: Vec<(String, String)>,
}

impl Sink {
    /// Bind a new [`Sink`] to `config.binding_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status code is invalid or the address cannot be
    /// bound.
    pub async fn bind(config: &Config) -> Result<Self, Error> {
        let status = StatusCode::from_u16(config.status)?;
        let listener = TcpListener::bind(config.binding_addr).await?;
        Ok(Self {
            listener,
            status,
            concurrency_limit: config.concurrent_requests_max,
            stats: Arc::new(Stats::default()),
            metric_labels: vec![("component".to_string(), "sink".to_string())],
        })
    }

    /// The address this sink is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle on this sink's counters, live while the sink runs.
    #[must_use]
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run [`Sink`] until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// None known. Connection level failures are logged and do not stop the
    /// sink.
    pub async fn run<S>(self, shutdown: S) -> Result<(), Error>
    where
        S: Future<Output = ()>,
    {
        let sem = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut join_set = JoinSet::new();
        let labels = self.metric_labels;

        gauge!("connection.limit", &labels).set(self.concurrency_limit as f64);

        pin!(shutdown);
        loop {
            let claimed_permits = self.concurrency_limit - sem.available_permits();
            gauge!("connection.current", &labels).set(claimed_permits as f64);

            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }

                incoming = self.listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {addr}");

                    let permit = match Arc::clone(&sem).try_acquire_owned() {
                        Ok(p) => p,
                        Err(TryAcquireError::Closed) => {
                            error!("Semaphore closed");
                            continue;
                        }
                        Err(TryAcquireError::NoPermits) => {
                            warn!("sink over connection capacity, load shedding");
                            drop(stream);
                            continue;
                        }
                    };

                    let status = self.status;
                    let stats = Arc::clone(&self.stats);
                    let labels = labels.clone();
                    join_set.spawn(async move {
                        let service = service_fn(move |req| {
                            srv(status, Arc::clone(&stats), labels.clone(), req)
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!("Error serving {addr}: {e}");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(self.listener);
        join_set.shutdown().await;
        Ok(())
    }
}

async fn srv(
    status: StatusCode,
    stats: Arc<Stats>,
    labels: Vec<(String, String)>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/ping" => Ok(respond(StatusCode::NO_CONTENT)),
        "/write" => {
            if let Some(authorization) = req.headers().get(AUTHORIZATION) {
                stats.record_authorization(authorization);
            }
            let body = req.into_body().collect().await?.to_bytes();
            let lines = body
                .split(|b| *b == b'\n')
                .filter(|line| !line.is_empty())
                .count() as u64;

            stats.requests.fetch_add(1, Ordering::Relaxed);
            stats.bytes.fetch_add(body.len() as u64, Ordering::Relaxed);
            stats.lines.fetch_add(lines, Ordering::Relaxed);
            counter!("requests_received", &labels).increment(1);
            counter!("bytes_received", &labels).increment(body.len() as u64);
            counter!("lines_received", &labels).increment(lines);

            Ok(respond(status))
        }
        _ => Ok(respond(StatusCode::NOT_FOUND)),
    }
}

fn respond(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(crate::full(Bytes::new()));
    *response.status_mut() = status;
    response
}
