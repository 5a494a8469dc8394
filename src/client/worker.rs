//! Load-generating worker.
//!
//! A worker drives back-to-back sessions and reports what it measured as a
//! stream of [`WorkerEvent`]s. Events from one worker arrive in the order
//! they were produced.

use super::session::SessionError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Per-worker share of the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// Keep going until `warmup + duration` has elapsed since the worker
    /// started; only iterations finishing inside `[warmup, warmup + duration]`
    /// are reported.
    Timed { duration: Duration, warmup: Duration },
    /// Run exactly this many iterations and report every one of them.
    Count(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// First reported sample of a timed worker.
    Started { worker: usize, at: DateTime<Utc> },
    /// A successful round trip.
    Sample { worker: usize, elapsed: Duration },
    /// A reported iteration that produced no sample.
    Failed { worker: usize },
    /// The worker has stopped issuing sessions.
    Ended { worker: usize, at: DateTime<Utc> },
}

/// Split `total` repetitions over `workers`, giving the remainder to the
/// last worker.
pub fn split_repetitions(total: u64, workers: usize) -> Vec<u64> {
    if workers == 0 {
        return Vec::new();
    }
    let base = total / workers as u64;
    let mut shares = vec![base; workers];
    shares[workers - 1] += total % workers as u64;
    shares
}

/// Run one worker to completion.
///
/// `session` is invoked once per iteration and must open, use, and close its
/// own connection. A failed session is logged and the loop moves on.
pub async fn run_worker<F, Fut>(
    worker: usize,
    budget: Budget,
    mut session: F,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Duration, SessionError>>,
{
    // A closed channel means nobody is collecting any more; keep the
    // schedule anyway so the worker exits on its own terms.
    let emit = |event| {
        let _ = events.send(event);
    };

    match budget {
        Budget::Timed { duration, warmup } => {
            let worker_start = Instant::now();
            let end = warmup + duration;
            let mut reporting = false;

            while worker_start.elapsed() < end {
                let result = session().await;
                let ts = worker_start.elapsed();
                let in_window = ts >= warmup && ts <= end;

                match result {
                    Ok(elapsed) if in_window => {
                        if !reporting {
                            reporting = true;
                            emit(WorkerEvent::Started {
                                worker,
                                at: Utc::now(),
                            });
                        }
                        emit(WorkerEvent::Sample { worker, elapsed });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(worker, error = %e, "Session failed");
                        if in_window {
                            emit(WorkerEvent::Failed { worker });
                        }
                    }
                }
            }
        }
        Budget::Count(repetitions) => {
            for _ in 0..repetitions {
                match session().await {
                    Ok(elapsed) => emit(WorkerEvent::Sample { worker, elapsed }),
                    Err(e) => {
                        warn!(worker, error = %e, "Session failed");
                        emit(WorkerEvent::Failed { worker });
                    }
                }
            }
        }
    }

    debug!(worker, "Worker finished");
    emit(WorkerEvent::Ended {
        worker,
        at: Utc::now(),
    });
}
