//! Plain-text rendering of an experiment result.
//!
//! One latency sample per line (microseconds), bracketed by per-worker
//! `Start:`/`End:` markers, then summary lines. Downstream plotting reads
//! this from stdout, so nothing else is written here.

use super::orchestrator::ExperimentResult;
use super::worker::WorkerEvent;
use chrono::{DateTime, Utc};
use std::io::{self, Write};

pub fn write_header<W: Write>(out: &mut W, payload_size: u64) -> io::Result<()> {
    writeln!(out, "Message Size: {payload_size}")
}

pub fn write_report<W: Write>(
    out: &mut W,
    client_id: &str,
    result: &ExperimentResult,
) -> io::Result<()> {
    for event in &result.events {
        match event {
            WorkerEvent::Started { worker, at } => {
                writeln!(out, "Start: {client_id}/{worker} {}", timestamp(at))?;
            }
            WorkerEvent::Sample { elapsed, .. } => {
                writeln!(out, "{:.3}", elapsed.as_secs_f64() * 1e6)?;
            }
            WorkerEvent::Failed { .. } => {}
            WorkerEvent::Ended { worker, at } => {
                writeln!(out, "End: {client_id}/{worker} {}", timestamp(at))?;
            }
        }
    }

    writeln!(out, "Elapsed: {:.9}", result.elapsed.as_secs_f64())?;
    writeln!(
        out,
        "Samples: {} Failures: {}",
        result.sample_count(),
        result.failure_count()
    )?;
    if let Some(summary) = result.latency_summary() {
        writeln!(
            out,
            "Latency (us): min {:.3} mean {:.3} p50 {:.3} p99 {:.3} max {:.3}",
            summary.min, summary.mean, summary.p50, summary.p99, summary.max
        )?;
    }
    writeln!(out, "Throughput: {:.3}", result.throughput())?;
    out.flush()
}

/// Seconds since the Unix epoch with nanosecond precision.
fn timestamp(at: &DateTime<Utc>) -> String {
    format!("{}.{:09}", at.timestamp(), at.timestamp_subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_report_format() {
        let at = Utc.timestamp_opt(1_700_000_000, 1_500).unwrap();
        let result = ExperimentResult {
            events: vec![
                WorkerEvent::Started { worker: 0, at },
                WorkerEvent::Sample {
                    worker: 0,
                    elapsed: Duration::from_nanos(12_345_678),
                },
                WorkerEvent::Failed { worker: 0 },
                WorkerEvent::Sample {
                    worker: 0,
                    elapsed: Duration::from_micros(20),
                },
                WorkerEvent::Ended { worker: 0, at },
            ],
            elapsed: Duration::from_secs(2),
            payload_size: 100,
        };

        let mut out = Vec::new();
        write_header(&mut out, 100).unwrap();
        write_report(&mut out, "host-1", &result).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines,
            vec![
                "Message Size: 100",
                "Start: host-1/0 1700000000.000001500",
                "12345.678",
                "20.000",
                "End: host-1/0 1700000000.000001500",
                "Elapsed: 2.000000000",
                "Samples: 2 Failures: 1",
                "Latency (us): min 20.000 mean 6182.839 p50 20.000 p99 12345.678 max 12345.678",
                "Throughput: 100.000",
            ]
        );
    }

    #[test]
    fn test_report_without_samples() {
        let result = ExperimentResult {
            events: vec![WorkerEvent::Failed { worker: 1 }],
            elapsed: Duration::from_secs(1),
            payload_size: 8,
        };

        let mut out = Vec::new();
        write_report(&mut out, "c", &result).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("Latency"));
        assert!(text.ends_with("Throughput: 0.000\n"));
    }
}
