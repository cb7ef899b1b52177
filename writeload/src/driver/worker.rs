//! A single load driver worker.
//!
//! The worker loops a fixed number of iterations. Each iteration builds one
//! batch and POSTs it. The first failed request ends the worker.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use bytes::Bytes;
use hyper::StatusCode;
use metrics::{counter, gauge};
use rand::rngs::StdRng;
use tokio::time;
use tracing::{debug, warn};
use writeload_payload::Payload;

use super::{Outcome, transport};

#[derive(thiserror::Error, Debug)]
enum Failure {
    #[error("failed to build batch: {0}")]
    Payload(#[from] writeload_payload::Error),
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected response status {0}")]
    Status(StatusCode),
}

impl Failure {
    fn kind(&self) -> &'static str {
        match self {
            Failure::Payload(_) => "payload",
            Failure::Transport(_) => "transport",
            Failure::Timeout(_) => "timeout",
            Failure::Status(_) => "status",
        }
    }
}

/// What a worker leaves behind when it terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tally {
    pub(crate) outcome: Outcome,
    pub(crate) requests: u64,
}

#[derive(Debug)]
pub(crate) struct Worker<T> {
    pub(crate) index: usize,
    pub(crate) transport: T,
    pub(crate) payload: Arc<Payload>,
    pub(crate) rng: StdRng,
    pub(crate) iterations: u64,
    pub(crate) points_per_batch: NonZeroU32,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) labels: Vec<(String, String)>,
}

impl<T> Worker<T>
where
    T: transport::Transport,
{
    /// Run this worker to completion or first failure.
    pub(crate) async fn spin(mut self) -> Tally {
        gauge!("workers_running", &self.labels).increment(1.0);
        let mut requests = 0;
        let mut outcome = Outcome::Success;

        for iteration in 0..self.iterations {
            let body = match self.payload.batch(&mut self.rng, self.points_per_batch) {
                Ok(body) => body,
                Err(err) => {
                    self.record_failure(iteration, &Failure::from(err));
                    outcome = Outcome::Failure;
                    break;
                }
            };
            let block_length = body.len();

            requests += 1;
            counter!("requests_sent", &self.labels).increment(1);
            match self.send(body).await {
                Ok(()) => {
                    counter!("request_ok", &self.labels).increment(1);
                    counter!("bytes_written", &self.labels).increment(block_length as u64);
                    debug!(
                        worker = self.index,
                        iteration, block_length, "batch accepted"
                    );
                }
                Err(failure) => {
                    self.record_failure(iteration, &failure);
                    outcome = Outcome::Failure;
                    break;
                }
            }
        }

        gauge!("workers_running", &self.labels).decrement(1.0);
        Tally { outcome, requests }
    }

    async fn send(&self, body: Bytes) -> Result<(), Failure> {
        let status = match self.request_timeout {
            Some(timeout) => time::timeout(timeout, self.transport.post(body))
                .await
                .map_err(|_| Failure::Timeout(timeout))??,
            None => self.transport.post(body).await?,
        };
        if status == StatusCode::NO_CONTENT {
            Ok(())
        } else {
            Err(Failure::Status(status))
        }
    }

    fn record_failure(&self, iteration: u64, failure: &Failure) {
        warn!(
            worker = self.index,
            iteration, "worker stopping on failed request: {failure}"
        );
        let mut error_labels = self.labels.clone();
        error_labels.push(("error".to_string(), failure.kind().to_string()));
        counter!("request_failure", &error_labels).increment(1);
    }
}
