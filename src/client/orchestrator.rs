//! Experiment orchestration.
//!
//! Waits for the configured start instant, launches every worker at once,
//! and folds their event streams into a single [`ExperimentResult`].

use super::session::{run_session, Target};
use super::worker::{run_worker, split_repetitions, Budget, WorkerEvent};
use crate::config::{ClientConfig, Mode};
use crate::shutdown::Shutdown;
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("experiment interrupted")]
    Interrupted,

    #[error("worker task failed: {0}")]
    Worker(#[from] JoinError),
}

/// Everything an experiment measured.
#[derive(Debug, Clone)]
pub struct ExperimentResult {
    /// All worker events in arrival order.
    pub events: Vec<WorkerEvent>,
    /// Wall time from worker launch until the last worker finished.
    pub elapsed: Duration,
    pub payload_size: u64,
}

/// Latency distribution over the successful samples, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub min: f64,
    pub mean: f64,
    pub p50: f64,
    pub p99: f64,
    pub max: f64,
}

impl ExperimentResult {
    /// Elapsed times of successful round trips.
    pub fn samples(&self) -> impl Iterator<Item = Duration> + '_ {
        self.events.iter().filter_map(|event| match event {
            WorkerEvent::Sample { elapsed, .. } => Some(*elapsed),
            _ => None,
        })
    }

    pub fn sample_count(&self) -> u64 {
        self.samples().count() as u64
    }

    pub fn failure_count(&self) -> u64 {
        self.events
            .iter()
            .filter(|event| matches!(event, WorkerEvent::Failed { .. }))
            .count() as u64
    }

    /// Payload bytes per second over the whole experiment.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.sample_count() * self.payload_size) as f64 / secs
    }

    pub fn latency_summary(&self) -> Option<LatencySummary> {
        let mut micros: Vec<f64> = self.samples().map(|d| d.as_secs_f64() * 1e6).collect();
        if micros.is_empty() {
            return None;
        }
        micros.sort_by(|a, b| a.total_cmp(b));

        Some(LatencySummary {
            min: micros[0],
            mean: micros.iter().sum::<f64>() / micros.len() as f64,
            p50: percentile(&micros, 50.0),
            p99: percentile(&micros, 99.0),
            max: micros[micros.len() - 1],
        })
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// A configured load-generation run.
pub struct Experiment {
    config: ClientConfig,
}

impl Experiment {
    pub fn new(config: ClientConfig) -> Self {
        Experiment { config }
    }

    /// Per-worker budgets, one per configured worker.
    pub fn budgets(&self) -> Vec<Budget> {
        match self.config.mode {
            Mode::Timed { duration, warmup } => {
                vec![Budget::Timed { duration, warmup }; self.config.concurrency]
            }
            Mode::Counted { repetitions } => split_repetitions(repetitions, self.config.concurrency)
                .into_iter()
                .map(Budget::Count)
                .collect(),
        }
    }

    /// Run the experiment against the configured echo server.
    ///
    /// If `shutdown` fires at any point, every worker is aborted (dropping
    /// its in-flight connection) and [`ExperimentError::Interrupted`] is
    /// returned.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<ExperimentResult, ExperimentError> {
        if let Some(start) = self.config.start {
            wait_until(start, &mut shutdown).await?;
        }
        if shutdown.is_triggered() {
            return Err(ExperimentError::Interrupted);
        }

        let target = Arc::new(Target {
            host: self.config.host.clone(),
            port: self.config.port,
            connect_timeout: self.config.connect_timeout,
            nodelay: self.config.nodelay,
        });
        let size = self.config.payload_size;

        info!(
            host = %self.config.host,
            port = self.config.port,
            workers = self.config.concurrency,
            payload_size = size,
            mode = ?self.config.mode,
            "Starting experiment"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        let started = Instant::now();

        for (worker, budget) in self.budgets().into_iter().enumerate() {
            let target = Arc::clone(&target);
            let session = move || {
                let target = Arc::clone(&target);
                async move { run_session(&target, size).await }
            };
            workers.spawn(run_worker(worker, budget, session, tx.clone()));
        }
        drop(tx);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    warn!("Aborting workers");
                    workers.shutdown().await;
                    return Err(ExperimentError::Interrupted);
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        workers.shutdown().await;
                        return Err(e.into());
                    }
                    None => break,
                },
            }
        }
        let elapsed = started.elapsed();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        info!(elapsed_secs = elapsed.as_secs_f64(), "Experiment finished");

        Ok(ExperimentResult {
            events,
            elapsed,
            payload_size: size,
        })
    }
}

/// Suspend until the wall clock reaches `start`. A start in the past is
/// logged and ignored.
pub async fn wait_until(
    start: DateTime<Local>,
    shutdown: &mut Shutdown,
) -> Result<(), ExperimentError> {
    let delay = match (start - Local::now()).to_std() {
        Ok(delay) => delay,
        Err(_) => {
            warn!(start = %start, "Start time already passed, starting now");
            return Ok(());
        }
    };

    info!(start = %start, delay_secs = delay.as_secs_f64(), "Waiting for start time");
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = shutdown.recv() => Err(ExperimentError::Interrupted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use crate::shutdown;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn client_config(port: u16, concurrency: usize, mode: Mode) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            concurrency,
            payload_size: 32768,
            mode,
            start: None,
            connect_timeout: Duration::from_secs(1),
            nodelay: true,
            client_id: "test".to_string(),
        }
    }

    async fn start_server(concurrency: usize) -> (u16, shutdown::Trigger) {
        let server = Server::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            concurrency,
            backlog: 128,
            queue_depth: 128,
            shutdown_grace: Duration::from_secs(1),
        });
        let listener = server.bind().await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (trigger, shutdown) = shutdown::channel();
        tokio::spawn(async move { server.serve(listener, shutdown).await });
        (port, trigger)
    }

    fn result_with(
        samples: &[u64],
        failures: usize,
        elapsed: Duration,
        payload_size: u64,
    ) -> ExperimentResult {
        let mut events: Vec<WorkerEvent> = samples
            .iter()
            .map(|&us| WorkerEvent::Sample {
                worker: 0,
                elapsed: Duration::from_micros(us),
            })
            .collect();
        events.extend((0..failures).map(|_| WorkerEvent::Failed { worker: 0 }));
        ExperimentResult {
            events,
            elapsed,
            payload_size,
        }
    }

    #[test]
    fn test_throughput_counts_successful_samples_only() {
        let result = result_with(&[10, 20, 30, 40], 3, Duration::from_secs(2), 1000);
        assert_eq!(result.sample_count(), 4);
        assert_eq!(result.failure_count(), 3);
        assert!((result.throughput() - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_summary() {
        let samples: Vec<u64> = (1..=100).rev().collect();
        let summary = result_with(&samples, 0, Duration::from_secs(1), 1)
            .latency_summary()
            .unwrap();
        assert!((summary.min - 1.0).abs() < 1e-6);
        assert!((summary.max - 100.0).abs() < 1e-6);
        assert!((summary.mean - 50.5).abs() < 1e-6);
        assert!((summary.p50 - 50.0).abs() < 1e-6);
        assert!((summary.p99 - 99.0).abs() < 1e-6);

        assert!(result_with(&[], 2, Duration::from_secs(1), 1)
            .latency_summary()
            .is_none());
    }

    #[test]
    fn test_budgets() {
        let experiment = Experiment::new(client_config(1, 4, Mode::Counted { repetitions: 10 }));
        assert_eq!(
            experiment.budgets(),
            vec![Budget::Count(2), Budget::Count(2), Budget::Count(2), Budget::Count(4)]
        );

        let timed = Mode::Timed {
            duration: Duration::from_secs(1),
            warmup: Duration::ZERO,
        };
        let experiment = Experiment::new(client_config(1, 3, timed));
        assert_eq!(experiment.budgets().len(), 3);
    }

    #[tokio::test]
    async fn test_counted_experiment_against_server() {
        let (port, _server) = start_server(2).await;
        let (_trigger, shutdown) = shutdown::channel();

        let experiment = Experiment::new(client_config(port, 4, Mode::Counted { repetitions: 10 }));
        let result = experiment.run(shutdown).await.unwrap();

        assert_eq!(result.sample_count(), 10);
        assert_eq!(result.failure_count(), 0);
        assert!(result.samples().all(|d| d > Duration::ZERO));
        let ended = result
            .events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::Ended { .. }))
            .count();
        assert_eq!(ended, 4);
        let expected = (10 * 32768) as f64 / result.elapsed.as_secs_f64();
        assert!((result.throughput() - expected).abs() < 1e-6 * expected);
    }

    #[tokio::test]
    async fn test_counted_experiment_without_server_reports_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let (_trigger, shutdown) = shutdown::channel();

        let experiment = Experiment::new(client_config(port, 3, Mode::Counted { repetitions: 5 }));
        let result = experiment.run(shutdown).await.unwrap();

        assert_eq!(result.sample_count(), 0);
        assert_eq!(result.failure_count(), 5);
        assert_eq!(result.throughput(), 0.0);
    }

    #[tokio::test]
    async fn test_timed_experiment_against_server() {
        let (port, _server) = start_server(2).await;
        let (_trigger, shutdown) = shutdown::channel();

        let mode = Mode::Timed {
            duration: Duration::from_millis(300),
            warmup: Duration::from_millis(100),
        };
        let experiment = Experiment::new(client_config(port, 2, mode));
        let result = experiment.run(shutdown).await.unwrap();

        assert!(result.sample_count() > 0);
        assert!(result.elapsed >= Duration::from_millis(400));
        for worker in 0..2 {
            let first = result.events.iter().position(|e| match e {
                WorkerEvent::Started { worker: w, .. }
                | WorkerEvent::Sample { worker: w, .. }
                | WorkerEvent::Failed { worker: w }
                | WorkerEvent::Ended { worker: w, .. } => *w == worker,
            });
            assert!(matches!(
                first.map(|i| &result.events[i]),
                Some(WorkerEvent::Started { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_interrupt_aborts_workers_and_closes_connections() {
        // Accepts but never answers, so every session hangs.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (held_tx, mut held_rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if held_tx.send(stream).is_err() {
                    break;
                }
            }
        });

        let (trigger, shutdown) = shutdown::channel();
        let mode = Mode::Timed {
            duration: Duration::from_secs(3600),
            warmup: Duration::ZERO,
        };
        let experiment = Experiment::new(client_config(port, 2, mode));
        let run = tokio::spawn(async move { experiment.run(shutdown).await });

        let mut held = Vec::new();
        while held.len() < 2 {
            let stream = tokio::time::timeout(Duration::from_secs(5), held_rx.recv())
                .await
                .unwrap()
                .unwrap();
            held.push(stream);
        }
        trigger.fire();

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(ExperimentError::Interrupted)));

        // The aborted sessions must have dropped their sockets: reading the
        // server side runs into EOF (or a reset) instead of blocking.
        for mut stream in held {
            let mut sent = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut sent))
                .await
                .expect("client connection still open after interrupt")
                .ok();
        }
        sink.abort();
    }

    #[tokio::test]
    async fn test_wait_until_future_start() {
        let (_trigger, mut shutdown) = shutdown::channel();
        let start = Local::now() + chrono::Duration::milliseconds(100);

        wait_until(start, &mut shutdown).await.unwrap();
        // Timer wheel granularity is 1ms.
        assert!(Local::now() + chrono::Duration::milliseconds(2) >= start);
    }

    #[tokio::test]
    async fn test_wait_until_interrupted() {
        let (trigger, mut shutdown) = shutdown::channel();
        let start = Local::now() + chrono::Duration::hours(1);
        trigger.fire();

        assert!(matches!(
            wait_until(start, &mut shutdown).await,
            Err(ExperimentError::Interrupted)
        ));
    }
}
