#![forbid(unsafe_code)]

// One simulated client: a single connection that plays its assigned files in order

use crate::audio::{file_label, load_wav};
use crate::config::WorkerConfig;
use crate::connection::Connection;
use crate::metrics::MetricsAggregator;
use crate::streamer::{AudioStreamer, TestLabel, TestOutcome};
use rand::rngs::StdRng;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything one worker observed, folded into the aggregator once
#[derive(Debug, Clone)]
pub struct ConnectionOutcome {
    pub worker_id: usize,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    pub elapsed: Duration,
    pub connected: bool,
    pub tests: Vec<TestOutcome>,
    /// Connection-level errors (connect failure, unreadable audio)
    pub errors: Vec<String>,
}

pub struct ConnectionWorker {
    id: usize,
    url: String,
    files: Vec<PathBuf>,
    config: WorkerConfig,
    streamer: Arc<AudioStreamer>,
    rng: StdRng,
}

impl ConnectionWorker {
    pub fn new(
        id: usize,
        url: String,
        files: Vec<PathBuf>,
        config: WorkerConfig,
        streamer: Arc<AudioStreamer>,
        rng: StdRng,
    ) -> Self {
        Self {
            id,
            url,
            files,
            config,
            streamer,
            rng,
        }
    }

    /// Runs the worker to completion and records its outcome exactly once,
    /// whether it finished, failed to connect or was cancelled.
    pub async fn run(mut self, metrics: Arc<MetricsAggregator>, cancel: CancellationToken) -> ConnectionOutcome {
        let started = Instant::now();
        let mut outcome = ConnectionOutcome {
            worker_id: self.id,
            started_at: SystemTime::now(),
            finished_at: SystemTime::now(),
            elapsed: Duration::ZERO,
            connected: false,
            tests: Vec::with_capacity(self.files.len()),
            errors: Vec::new(),
        };

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            conn = Connection::open(&self.url, self.config.connect_timeout) => Some(conn),
        };

        match connected {
            None => outcome.errors.push("cancelled before connecting".to_string()),
            Some(Err(e)) => {
                warn!("conn-{}: {}", self.id, e);
                outcome.errors.push(e.to_string());
            }
            Some(Ok(mut conn)) => {
                outcome.connected = true;
                info!("conn-{}: connected to {}", self.id, conn.url());
                self.play_files(&mut conn, &mut outcome, &cancel).await;
                if let Err(e) = conn.close().await {
                    warn!("conn-{}: {}", self.id, e);
                }
            }
        }

        outcome.finished_at = SystemTime::now();
        outcome.elapsed = started.elapsed();
        let passed = outcome.tests.iter().filter(|t| t.success).count();
        info!(
            "conn-{}: finished {}/{} tests in {:.2}s",
            self.id,
            passed,
            outcome.tests.len(),
            outcome.elapsed.as_secs_f64()
        );

        metrics.record_connection(outcome.clone());
        outcome
    }

    async fn play_files(&mut self, conn: &mut Connection, outcome: &mut ConnectionOutcome, cancel: &CancellationToken) {
        let files = std::mem::take(&mut self.files);
        for (i, path) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 && !self.pause(cancel).await {
                break;
            }

            let audio = match load_wav(path).await {
                Ok(decoded) => decoded.record,
                Err(e) => {
                    warn!("conn-{}: cannot read audio file: {}", self.id, e);
                    outcome.errors.push(format!("cannot read audio file: {}", e));
                    continue;
                }
            };

            let label = TestLabel {
                connection_id: self.id,
                audio_index: i + 1,
                audio_file: file_label(path),
            };
            let test = self.streamer.stream(conn, &audio, &label, cancel).await;
            outcome.tests.push(test);

            if !conn.has_reader() {
                outcome
                    .errors
                    .push("listener did not return the connection reader".to_string());
                break;
            }
        }
    }

    /// Seeded uniform pause between files. Returns false if cancelled.
    async fn pause(&mut self, cancel: &CancellationToken) -> bool {
        let pause = self.next_pause();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(pause) => true,
        }
    }

    fn next_pause(&mut self) -> Duration {
        let (min, max) = (self.config.min_pause, self.config.max_pause);
        if min >= max {
            return min;
        }
        let nanos = self.rng.random_range(min.as_nanos() as u64..=max.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerConfig;
    use rand::SeedableRng;

    fn worker(id: usize, url: &str, files: Vec<PathBuf>, config: WorkerConfig, seed: u64) -> ConnectionWorker {
        let streamer = Arc::new(AudioStreamer::new(StreamerConfig::default(), Duration::from_secs(3)));
        ConnectionWorker::new(id, url.to_string(), files, config, streamer, StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_pause_is_seeded_and_in_range() {
        let config = WorkerConfig::default();
        let mut a = worker(0, "ws://x", Vec::new(), config.clone(), 7);
        let mut b = worker(0, "ws://x", Vec::new(), config, 7);
        for _ in 0..50 {
            let pause = a.next_pause();
            assert_eq!(pause, b.next_pause());
            assert!(pause >= Duration::from_secs(1) && pause <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_equal_pause_bounds() {
        let config = WorkerConfig {
            min_pause: Duration::from_millis(5),
            max_pause: Duration::from_millis(5),
            ..Default::default()
        };
        let mut w = worker(0, "ws://x", Vec::new(), config, 1);
        assert_eq!(w.next_pause(), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_connect_failure_records_once_with_no_tests() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let metrics = Arc::new(MetricsAggregator::new(10));
        let outcome = worker(
            4,
            &format!("ws://127.0.0.1:{}/ws", port),
            vec![PathBuf::from("a.wav"), PathBuf::from("b.wav")],
            WorkerConfig::default(),
            1,
        )
        .run(metrics.clone(), CancellationToken::new())
        .await;

        assert!(!outcome.connected);
        assert!(outcome.tests.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("connection error"));

        let summary = metrics.snapshot();
        assert_eq!(summary.total_connections, 1);
        assert_eq!(summary.successful_connections, 0);
        assert_eq!(summary.total_audio_files, 0);
        assert_eq!(summary.errors[0].connection_id, 4);
    }

    #[tokio::test]
    async fn test_cancelled_worker_still_records() {
        let metrics = Arc::new(MetricsAggregator::new(10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = worker(1, "ws://127.0.0.1:9/ws", vec![PathBuf::from("a.wav")], WorkerConfig::default(), 1)
            .run(metrics.clone(), cancel)
            .await;
        assert!(!outcome.connected);
        assert_eq!(metrics.connections_recorded(), 1);
    }
}
