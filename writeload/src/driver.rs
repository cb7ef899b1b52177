//! The load driver.
//!
//! The driver fans out `worker_count` workers, each a lightweight tokio task.
//! Every worker repeatedly builds a batch of line protocol points and POSTs it
//! to the target. A worker stops at its first failed request; other workers
//! are unaffected. Once every worker has terminated the driver inspects their
//! outcomes in index order. The run passes only if none failed.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of requests sent
//! `request_ok`: Requests answered with 204 No Content
//! `request_failure`: Failed requests, labeled by `error` kind
//! `bytes_written`: Total bytes written in accepted requests
//! `workers_running`: Workers currently inside their request loop
//!

use std::{
    num::{NonZeroU32, NonZeroU64},
    sync::Arc,
    time::Duration,
};

use hyper::{HeaderMap, Uri};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info};
use writeload_payload::Payload;

pub mod transport;
mod worker;

pub use transport::{HyperTransport, Transport};
use worker::{Tally, Worker};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Configuration of the load driver.
pub struct Config {
    /// The seed for random operations. Each worker derives its own RNG from
    /// this seed.
    pub seed: [u8; 32],
    /// The URI for the write endpoint, e.g.
    /// `http://localhost:6086/write?db=test`
    #[serde(with = "http_serde::uri")]
    pub target_uri: Uri,
    /// The total number of workers
    pub worker_count: NonZeroU32,
    /// The number of requests each worker issues if none fail
    pub iterations_per_worker: u64,
    /// The number of line protocol points in each request body
    pub points_per_batch: NonZeroU32,
    /// The payload generator to use for this target
    pub variant: writeload_payload::Config,
    /// Headers to include in every request
    #[serde(with = "http_serde::header_map", default)]
    pub headers: HeaderMap,
    /// The maximum number of workers inside their request loop at once.
    /// Defaults to `worker_count`.
    #[serde(default)]
    pub parallel_workers: Option<NonZeroU32>,
    /// Per-request timeout in milliseconds, never zero. When unset a stalled
    /// request stalls its worker, and so the run, indefinitely.
    #[serde(default)]
    pub request_timeout_millis: Option<NonZeroU64>,
}

impl Config {
    /// Determine whether this configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload configuration is invalid or if
    /// `parallel_workers` exceeds `worker_count`.
    pub fn validate(&self) -> Result<(), Error> {
        self.variant.valid()?;
        if let Some(parallel) = self.parallel_workers {
            if parallel > self.worker_count {
                return Err(Error::ParallelWorkers {
                    parallel: parallel.get(),
                    workers: self.worker_count.get(),
                });
            }
        }
        Ok(())
    }

    fn parallel_workers(&self) -> NonZeroU32 {
        self.parallel_workers.unwrap_or(self.worker_count)
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Driver`].
pub enum Error {
    /// Payload configuration was rejected.
    #[error("Payload error: {0}")]
    Payload(#[from] writeload_payload::Error),
    /// More parallel workers than workers were requested.
    #[error("parallel_workers ({parallel}) must not exceed worker_count ({workers})")]
    ParallelWorkers {
        /// Configured parallel workers
        parallel: u32,
        /// Configured worker count
        workers: u32,
    },
    /// A worker task could not be joined, typically because it panicked.
    #[error("Could not join worker task: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// A worker terminated without recording its outcome.
    #[error("Worker {0} terminated without recording an outcome")]
    MissingOutcome(usize),
}

/// The terminal state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every iteration completed with a 204 response.
    Success,
    /// Some request failed and the worker stopped early.
    Failure,
}

/// The result of a [`Driver`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    outcomes: Vec<Outcome>,
    requests: Vec<u64>,
}

impl Report {
    /// Whether the run passed: no worker reported [`Outcome::Failure`].
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.outcomes.contains(&Outcome::Failure)
    }

    /// Outcome of each worker, indexed by worker.
    #[must_use]
    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    /// Requests issued by each worker, indexed by worker.
    #[must_use]
    pub fn requests(&self) -> &[u64] {
        &self.requests
    }

    /// Indices of the workers that failed, ascending.
    pub fn failed_workers(&self) -> impl Iterator<Item = usize> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, outcome)| **outcome == Outcome::Failure)
            .map(|(idx, _)| idx)
    }

    /// Total requests issued across all workers.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.requests.iter().sum()
    }
}

type TransportFactory<T> = Box<dyn Fn(usize) -> T + Send + Sync>;

/// The load driver.
pub struct Driver<T> {
    config: Config,
    payload: Arc<Payload>,
    make_transport: TransportFactory<T>,
    metric_labels: Vec<(String, String)>,
}

impl<T> std::fmt::Debug for Driver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("payload", &self.payload)
            .field("metric_labels", &self.metric_labels)
            .finish_non_exhaustive()
    }
}

impl Driver<HyperTransport> {
    /// Create a new [`Driver`] that speaks HTTP to `config.target_uri`.
    ///
    /// All workers share one connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not pass validation.
    pub fn new(config: Config) -> Result<Self, Error> {
        let transport = HyperTransport::new(
            config.target_uri.clone(),
            config.headers.clone(),
            config.parallel_workers().get() as usize,
        );
        Self::with_transport(config, move |_| transport.clone())
    }
}

impl<T> Driver<T>
where
    T: Transport + 'static,
{
    /// Create a new [`Driver`] with a caller-supplied transport factory.
    ///
    /// `make_transport` is called once per worker with that worker's index.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not pass validation.
    pub fn with_transport<F>(config: Config, make_transport: F) -> Result<Self, Error>
    where
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        config.validate()?;
        let payload = Payload::new(&config.variant)?;
        Ok(Self {
            config,
            payload: Arc::new(payload),
            make_transport: Box::new(make_transport),
            metric_labels: vec![("component".to_string(), "driver".to_string())],
        })
    }

    /// Run every worker to termination and report their outcomes.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker task cannot be joined or terminates
    /// without an outcome. Failed requests are not errors; they are reported
    /// through [`Report`].
    pub async fn run(self) -> Result<Report, Error> {
        let worker_count = self.config.worker_count.get() as usize;
        let parallel_workers = self.config.parallel_workers().get() as usize;
        let request_timeout = self
            .config
            .request_timeout_millis
            .map(|millis| Duration::from_millis(millis.get()));
        let semaphore = Arc::new(Semaphore::new(parallel_workers));
        let mut rng = StdRng::from_seed(self.config.seed);

        info!(
            target_uri = %self.config.target_uri,
            worker_count,
            parallel_workers,
            iterations_per_worker = self.config.iterations_per_worker,
            points_per_batch = self.config.points_per_batch.get(),
            "starting load driver"
        );

        let mut join_set = JoinSet::new();
        for index in 0..worker_count {
            let worker = Worker {
                index,
                transport: (self.make_transport)(index),
                payload: Arc::clone(&self.payload),
                rng: StdRng::from_rng(&mut rng),
                iterations: self.config.iterations_per_worker,
                points_per_batch: self.config.points_per_batch,
                request_timeout,
                labels: self.metric_labels.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                // The semaphore is never closed, the `None` arm is a defect.
                let tally = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let tally = worker.spin().await;
                        drop(permit);
                        Some(tally)
                    }
                    Err(_) => None,
                };
                (index, tally)
            });
        }

        // Slots are written once each during the join and read only after
        // every worker has terminated.
        let mut slots: Vec<Option<Tally>> = vec![None; worker_count];
        while let Some(res) = join_set.join_next().await {
            let (index, tally) = res.map_err(|err| {
                error!("Could not join the spawned worker task: {err}");
                Error::Join(err)
            })?;
            debug_assert!(slots[index].is_none(), "worker {index} reported twice");
            slots[index] = tally;
        }

        let mut outcomes = Vec::with_capacity(worker_count);
        let mut requests = Vec::with_capacity(worker_count);
        for (index, slot) in slots.into_iter().enumerate() {
            let tally = slot.ok_or(Error::MissingOutcome(index))?;
            outcomes.push(tally.outcome);
            requests.push(tally.requests);
        }
        let report = Report { outcomes, requests };

        info!(
            passed = report.passed(),
            failed_workers = report.failed_workers().count(),
            total_requests = report.total_requests(),
            "load driver finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::{NonZeroU32, NonZeroU64},
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::{HeaderMap, StatusCode, Uri, header::HeaderValue};
    use proptest::prelude::*;
    use tokio::{sync::oneshot, task::JoinHandle};

    use super::{Config, Driver, Error, Outcome, transport};
    use crate::sink::{self, Sink, Stats};

    /// Answers 204 to every request except the configured one.
    #[derive(Debug)]
    struct Scripted {
        sent: Arc<AtomicU64>,
        fail_on: Option<(u64, Response)>,
    }

    #[derive(Debug, Clone, Copy)]
    enum Response {
        Status(StatusCode),
        TransportError,
        Stall,
    }

    #[async_trait]
    impl transport::Transport for Scripted {
        async fn post(&self, body: Bytes) -> Result<StatusCode, transport::Error> {
            assert!(!body.is_empty());
            let nth = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_on {
                Some((k, Response::Status(status))) if k == nth => Ok(status),
                Some((k, Response::TransportError)) if k == nth => {
                    let err = hyper::Response::builder()
                        .status(1000u16)
                        .body(())
                        .expect_err("status 1000 is invalid");
                    Err(transport::Error::Http(err))
                }
                Some((k, Response::Stall)) if k == nth => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                _ => Ok(StatusCode::NO_CONTENT),
            }
        }
    }

    fn config(worker_count: u32, iterations_per_worker: u64) -> Config {
        Config {
            seed: [7; 32],
            target_uri: "http://localhost:6086/write?db=test"
                .parse()
                .expect("valid uri"),
            worker_count: NonZeroU32::new(worker_count).expect("non-zero worker count"),
            iterations_per_worker,
            points_per_batch: NonZeroU32::MIN,
            variant: writeload_payload::Config::CpuLoadShort(
                writeload_payload::cpu_load_short::Config::default(),
            ),
            headers: HeaderMap::new(),
            parallel_workers: None,
            request_timeout_millis: None,
        }
    }

    /// Build a driver whose worker `failing` misbehaves on request `k`.
    fn scripted(
        config: Config,
        failing: Option<(usize, u64, Response)>,
    ) -> (Driver<Scripted>, Vec<Arc<AtomicU64>>) {
        let counters: Vec<Arc<AtomicU64>> = (0..config.worker_count.get())
            .map(|_| Arc::new(AtomicU64::new(0)))
            .collect();
        let handles = counters.clone();
        let driver = Driver::with_transport(config, move |index| Scripted {
            sent: Arc::clone(&handles[index]),
            fail_on: failing
                .filter(|(worker, _, _)| *worker == index)
                .map(|(_, k, response)| (k, response)),
        })
        .expect("valid driver config");
        (driver, counters)
    }

    fn sent(counters: &[Arc<AtomicU64>]) -> Vec<u64> {
        counters.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }

    #[tokio::test]
    async fn all_accepted_passes() {
        let (driver, counters) = scripted(config(3, 2), None);
        let report = driver.run().await.expect("run errored");

        assert!(report.passed());
        assert_eq!(report.outcomes(), &[Outcome::Success; 3]);
        assert_eq!(report.total_requests(), 6);
        assert_eq!(sent(&counters), vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn failing_status_stops_only_that_worker() {
        let failing = Some((1, 3, Response::Status(StatusCode::INTERNAL_SERVER_ERROR)));
        let (driver, counters) = scripted(config(3, 5), failing);
        let report = driver.run().await.expect("run errored");

        assert!(!report.passed());
        assert_eq!(
            report.outcomes(),
            &[Outcome::Success, Outcome::Failure, Outcome::Success]
        );
        assert_eq!(report.requests(), &[5, 3, 5]);
        assert_eq!(sent(&counters), vec![5, 3, 5]);
        assert_eq!(report.failed_workers().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn non_204_success_status_is_failure() {
        let failing = Some((0, 1, Response::Status(StatusCode::OK)));
        let (driver, counters) = scripted(config(2, 4), failing);
        let report = driver.run().await.expect("run errored");

        assert!(!report.passed());
        assert_eq!(report.requests(), &[1, 4]);
        assert_eq!(sent(&counters), vec![1, 4]);
    }

    #[tokio::test]
    async fn transport_error_is_failure() {
        let failing = Some((2, 2, Response::TransportError));
        let (driver, _counters) = scripted(config(3, 3), failing);
        let report = driver.run().await.expect("run errored");

        assert!(!report.passed());
        assert_eq!(
            report.outcomes(),
            &[Outcome::Success, Outcome::Success, Outcome::Failure]
        );
        assert_eq!(report.requests(), &[3, 3, 2]);
    }

    #[tokio::test]
    async fn stalled_request_times_out() {
        let mut config = config(2, 3);
        config.request_timeout_millis = NonZeroU64::new(20);
        let failing = Some((0, 1, Response::Stall));
        let (driver, _counters) = scripted(config, failing);
        let report = driver.run().await.expect("run errored");

        assert_eq!(report.outcomes(), &[Outcome::Failure, Outcome::Success]);
        assert_eq!(report.requests(), &[1, 3]);
    }

    #[tokio::test]
    async fn bounded_parallelism_completes() {
        let mut config = config(8, 4);
        config.parallel_workers = NonZeroU32::new(2);
        let (driver, counters) = scripted(config, None);
        let report = driver.run().await.expect("run errored");

        assert!(report.passed());
        assert_eq!(report.total_requests(), 32);
        assert_eq!(sent(&counters), vec![4; 8]);
    }

    #[tokio::test]
    async fn zero_iterations_passes_without_requests() {
        let (driver, counters) = scripted(config(4, 0), None);
        let report = driver.run().await.expect("run errored");

        assert!(report.passed());
        assert_eq!(report.total_requests(), 0);
        assert_eq!(sent(&counters), vec![0; 4]);
    }

    #[test]
    fn excess_parallel_workers_rejected() {
        let mut config = config(2, 1);
        config.parallel_workers = NonZeroU32::new(3);
        assert!(matches!(
            config.validate(),
            Err(Error::ParallelWorkers {
                parallel: 3,
                workers: 2
            })
        ));
    }

    // A worker failing on its k-th request issues exactly k requests and is
    // the only failed worker.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn failing_worker_issues_k_requests(
            workers in 1..8u32,
            iterations in 1..16u64,
            failing_seed: usize,
            k_seed: u64,
        ) {
            let failing = failing_seed % workers as usize;
            let k = 1 + k_seed % iterations;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime");

            let response = Response::Status(StatusCode::SERVICE_UNAVAILABLE);
            let (driver, counters) = scripted(config(workers, iterations), Some((failing, k, response)));
            let report = runtime.block_on(driver.run())?;

            prop_assert!(!report.passed());
            for (idx, requests) in report.requests().iter().enumerate() {
                if idx == failing {
                    prop_assert_eq!(*requests, k);
                    prop_assert_eq!(report.outcomes()[idx], Outcome::Failure);
                } else {
                    prop_assert_eq!(*requests, iterations);
                    prop_assert_eq!(report.outcomes()[idx], Outcome::Success);
                }
            }
            prop_assert_eq!(sent(&counters), report.requests().to_vec());
        }
    }

    /// A [`Sink`] serving on an ephemeral local port.
    struct LiveSink {
        addr: std::net::SocketAddr,
        stats: Arc<Stats>,
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<Result<(), sink::Error>>,
    }

    impl LiveSink {
        async fn start(status: u16) -> Self {
            let mut config = sink::Config::new("127.0.0.1:0".parse().expect("valid address"));
            config.status = status;
            let sink = Sink::bind(&config).await.expect("bind failed");
            let addr = sink.local_addr().expect("no local address");
            let stats = sink.stats();
            let (shutdown, shutdown_rx) = oneshot::channel::<()>();
            let handle = tokio::spawn(sink.run(async {
                let _ = shutdown_rx.await;
            }));
            Self {
                addr,
                stats,
                shutdown,
                handle,
            }
        }

        fn uri(&self, path: &str) -> Uri {
            format!("http://{addr}{path}", addr = self.addr)
                .parse()
                .expect("valid uri")
        }

        async fn stop(self) {
            self.shutdown.send(()).expect("sink stopped early");
            self.handle
                .await
                .expect("sink task panicked")
                .expect("sink errored");
        }
    }

    fn live_config(target_uri: Uri, worker_count: u32, iterations: u64, points: u32) -> Config {
        let mut config = config(worker_count, iterations);
        config.target_uri = target_uri;
        config.points_per_batch = NonZeroU32::new(points).expect("non-zero points");
        config.request_timeout_millis = NonZeroU64::new(5_000);
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_all_writes_accepted() {
        let sink = LiveSink::start(204).await;

        let config = live_config(sink.uri("/write?db=test"), 3, 2, 1);
        let report = Driver::new(config)
            .expect("valid driver config")
            .run()
            .await
            .expect("run errored");

        assert!(report.passed());
        assert_eq!(report.total_requests(), 6);
        assert_eq!(sink.stats.requests(), 6);
        assert_eq!(sink.stats.lines(), 6);
        assert_eq!(sink.stats.authorized(), 0);
        sink.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_configured_headers_reach_endpoint() {
        let sink = LiveSink::start(204).await;

        let mut config = live_config(sink.uri("/write?db=test"), 2, 3, 4);
        config.headers.insert(
            hyper::header::AUTHORIZATION,
            HeaderValue::from_static("Token abc"),
        );
        let report = Driver::new(config)
            .expect("valid driver config")
            .run()
            .await
            .expect("run errored");

        assert!(report.passed());
        assert_eq!(sink.stats.requests(), 6);
        assert_eq!(sink.stats.authorized(), 6);
        assert_eq!(
            sink.stats.last_authorization(),
            Some(HeaderValue::from_static("Token abc"))
        );
        sink.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_wide_batches_arrive_whole() {
        let sink = LiveSink::start(204).await;

        let mut config = live_config(sink.uri("/write?db=test"), 4, 3, 200);
        config.variant = writeload_payload::Config::CpuLoadShortWide(
            writeload_payload::cpu_load_short_wide::Config::default(),
        );
        config.parallel_workers = NonZeroU32::new(2);
        let report = Driver::new(config)
            .expect("valid driver config")
            .run()
            .await
            .expect("run errored");

        assert!(report.passed());
        assert_eq!(sink.stats.requests(), 12);
        assert_eq!(sink.stats.lines(), 12 * 200);
        sink.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_rejected_writes_stop_every_worker() {
        let sink = LiveSink::start(500).await;

        let config = live_config(sink.uri("/write?db=test"), 3, 5, 1);
        let report = Driver::new(config)
            .expect("valid driver config")
            .run()
            .await
            .expect("run errored");

        assert!(!report.passed());
        assert_eq!(report.outcomes(), &[Outcome::Failure; 3]);
        assert_eq!(report.requests(), &[1, 1, 1]);
        assert_eq!(sink.stats.requests(), 3);
        sink.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_unknown_path_is_failure() {
        let sink = LiveSink::start(204).await;

        let config = live_config(sink.uri("/query?db=test"), 2, 3, 1);
        let report = Driver::new(config)
            .expect("valid driver config")
            .run()
            .await
            .expect("run errored");

        assert!(!report.passed());
        assert_eq!(report.requests(), &[1, 1]);
        assert_eq!(sink.stats.requests(), 0);
        sink.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_refused_connection_is_failure() {
        // Bind then release a port so nothing is listening on it.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
            listener.local_addr().expect("no local address")
        };
        let uri: Uri = format!("http://{addr}/write?db=test")
            .parse()
            .expect("valid uri");

        let report = Driver::new(live_config(uri, 2, 3, 1))
            .expect("valid driver config")
            .run()
            .await
            .expect("run errored");

        assert!(!report.passed());
        assert_eq!(report.outcomes(), &[Outcome::Failure; 2]);
        assert_eq!(report.requests(), &[1, 1]);
    }
}
