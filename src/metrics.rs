#![forbid(unsafe_code)]

// Run-wide metrics aggregation.
// Workers fold whole connection outcomes under one short critical section; the
// resource sampler writes to a separate lock so it never contends with them.

use crate::sampler::ResourceSample;
use crate::worker::ConnectionOutcome;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Fixed-capacity buffer that evicts the oldest entry when full
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Latency statistics over a set of samples
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    /// Median
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

impl LatencyStats {
    /// All fields are zero for an empty sample set.
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        Self {
            count,
            min_ms: sorted[0],
            max_ms: sorted[count - 1],
            avg_ms: sorted.iter().sum::<u64>() / count as u64,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
        }
    }
}

/// A successful recognition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionRecord {
    pub connection_id: usize,
    pub audio_file: String,
    pub text: String,
    pub response_time_ms: u64,
}

/// A failed test or a connection-level error
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub connection_id: usize,
    /// `None` for connection-level errors
    pub audio_file: Option<String>,
    pub message: String,
    pub timeout: bool,
}

/// Number of errors sharing one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCount {
    pub message: String,
    pub count: usize,
}

/// Host resource usage over the run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub samples: u64,
    pub avg_cpu_percent: f64,
    pub peak_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub peak_memory_percent: f64,
    pub avg_network_delta_bytes: f64,
    pub total_network_bytes: u64,
    /// Most recent samples, oldest first
    pub recent_cpu_percent: Vec<f32>,
    pub recent_memory_percent: Vec<f32>,
    pub recent_network_delta_bytes: Vec<u64>,
}

/// Point-in-time summary of the whole run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Unix epoch milliseconds, 0 if the run never started
    pub started_at_ms: u64,
    pub finished: bool,
    pub total_time_ms: u64,
    pub total_connections: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub connection_success_rate: f64,
    pub total_audio_files: u64,
    pub successful_recognitions: u64,
    pub failed_recognitions: u64,
    pub timeouts: u64,
    pub recognition_rate: f64,
    pub audio_files_per_sec: f64,
    pub recognitions_per_sec: f64,
    pub response_times: LatencyStats,
    pub average_connection_duration_ms: u64,
    /// Mean over connections of each connection's own test success rate
    pub average_connection_success_rate: f64,
    pub resources: ResourceSummary,
    pub recognitions_by_file: BTreeMap<String, Vec<String>>,
    /// Sorted by count (descending), then message
    pub error_distribution: Vec<ErrorCount>,
    pub errors: Vec<ErrorRecord>,
}

#[derive(Default)]
struct RunLog {
    started: Option<Instant>,
    started_at: Option<SystemTime>,
    finished: Option<Instant>,
    total_connections: u64,
    successful_connections: u64,
    total_audio_files: u64,
    successful_recognitions: u64,
    timeouts: u64,
    response_times_ms: Vec<u64>,
    connection_durations_ms: Vec<u64>,
    connection_success_rates: Vec<f64>,
    recognitions: Vec<RecognitionRecord>,
    errors: Vec<ErrorRecord>,
}

struct ResourceHistory {
    cpu: RingBuffer<f32>,
    memory: RingBuffer<f32>,
    network: RingBuffer<u64>,
    count: u64,
    cpu_sum: f64,
    cpu_peak: f64,
    memory_sum: f64,
    memory_peak: f64,
    network_total: u64,
}

impl ResourceHistory {
    fn new(capacity: usize) -> Self {
        Self {
            cpu: RingBuffer::new(capacity),
            memory: RingBuffer::new(capacity),
            network: RingBuffer::new(capacity),
            count: 0,
            cpu_sum: 0.0,
            cpu_peak: 0.0,
            memory_sum: 0.0,
            memory_peak: 0.0,
            network_total: 0,
        }
    }

    fn summary(&self) -> ResourceSummary {
        let n = self.count as f64;
        let avg = |sum: f64| if self.count > 0 { sum / n } else { 0.0 };
        ResourceSummary {
            samples: self.count,
            avg_cpu_percent: avg(self.cpu_sum),
            peak_cpu_percent: self.cpu_peak,
            avg_memory_percent: avg(self.memory_sum),
            peak_memory_percent: self.memory_peak,
            avg_network_delta_bytes: avg(self.network_total as f64),
            total_network_bytes: self.network_total,
            recent_cpu_percent: self.cpu.to_vec(),
            recent_memory_percent: self.memory.to_vec(),
            recent_network_delta_bytes: self.network.to_vec(),
        }
    }
}

/// Process-wide accumulator shared by every worker and the resource sampler.
///
/// No method fails or blocks beyond one short lock hold. A poisoned lock is
/// recovered since the data behind it is append-only.
pub struct MetricsAggregator {
    run: Mutex<RunLog>,
    resources: Mutex<ResourceHistory>,
    connections_recorded: AtomicU64,
}

impl MetricsAggregator {
    /// `history` bounds the recent CPU/memory/network ring buffers
    pub fn new(history: usize) -> Self {
        Self {
            run: Mutex::new(RunLog::default()),
            resources: Mutex::new(ResourceHistory::new(history)),
            connections_recorded: AtomicU64::new(0),
        }
    }

    fn run_log(&self) -> MutexGuard<'_, RunLog> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resource_history(&self) -> MutexGuard<'_, ResourceHistory> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_started(&self) {
        let mut run = self.run_log();
        run.started = Some(Instant::now());
        run.started_at = Some(SystemTime::now());
        run.finished = None;
    }

    pub fn mark_finished(&self) {
        let mut run = self.run_log();
        if run.started.is_none() {
            run.started = Some(Instant::now());
            run.started_at = Some(SystemTime::now());
        }
        run.finished = Some(Instant::now());
    }

    /// Folds one worker's final outcome into the run totals.
    pub fn record_connection(&self, outcome: ConnectionOutcome) {
        let id = outcome.worker_id;
        let tested = outcome.tests.len();
        let passed = outcome.tests.iter().filter(|t| t.success).count();

        {
            let mut run = self.run_log();
            run.total_connections += 1;
            if outcome.connected {
                run.successful_connections += 1;
            }
            run.connection_durations_ms
                .push(outcome.elapsed.as_millis() as u64);
            run.connection_success_rates.push(if tested > 0 {
                passed as f64 / tested as f64
            } else {
                0.0
            });

            for test in outcome.tests {
                let response_time_ms = test.latency.as_millis() as u64;
                run.total_audio_files += 1;
                run.response_times_ms.push(response_time_ms);
                if test.timeout {
                    run.timeouts += 1;
                }
                match (test.success, test.text) {
                    (true, Some(text)) => {
                        run.successful_recognitions += 1;
                        run.recognitions.push(RecognitionRecord {
                            connection_id: id,
                            audio_file: test.audio_file,
                            text,
                            response_time_ms,
                        });
                    }
                    (true, None) => run.successful_recognitions += 1,
                    (false, _) => {
                        let message = test.error.unwrap_or_else(|| {
                            if test.timeout {
                                "receive timeout".to_string()
                            } else {
                                "unknown error".to_string()
                            }
                        });
                        run.errors.push(ErrorRecord {
                            connection_id: id,
                            audio_file: Some(test.audio_file),
                            message,
                            timeout: test.timeout,
                        });
                    }
                }
            }

            for message in outcome.errors {
                run.errors.push(ErrorRecord {
                    connection_id: id,
                    audio_file: None,
                    message,
                    timeout: false,
                });
            }
        }

        self.connections_recorded.fetch_add(1, Ordering::SeqCst);
    }

    /// Folds one host resource sample.
    pub fn record_sample(&self, sample: ResourceSample) {
        let mut history = self.resource_history();
        history.cpu.push(sample.cpu_percent);
        history.memory.push(sample.memory_percent);
        history.network.push(sample.network_delta);
        history.count += 1;
        history.cpu_sum += sample.cpu_percent as f64;
        history.cpu_peak = history.cpu_peak.max(sample.cpu_percent as f64);
        history.memory_sum += sample.memory_percent as f64;
        history.memory_peak = history.memory_peak.max(sample.memory_percent as f64);
        history.network_total = history.network_total.saturating_add(sample.network_delta);
    }

    /// Connections folded so far, for progress reporting
    pub fn connections_recorded(&self) -> u64 {
        self.connections_recorded.load(Ordering::SeqCst)
    }

    /// Consistent summary computed at call time. While the run is still going,
    /// the run window is measured up to now.
    pub fn snapshot(&self) -> RunSummary {
        let resources = self.resource_history().summary();
        let run = self.run_log();

        let total_time = match (run.started, run.finished) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => std::time::Duration::ZERO,
        };
        let secs = total_time.as_secs_f64();
        let per_sec = |n: u64| if secs > 0.0 { n as f64 / secs } else { 0.0 };
        let ratio = |n: u64, d: u64| if d > 0 { n as f64 / d as f64 } else { 0.0 };

        let mut recognitions_by_file: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for r in &run.recognitions {
            recognitions_by_file
                .entry(r.audio_file.clone())
                .or_default()
                .push(r.text.clone());
        }

        let average_connection_duration_ms = if run.connection_durations_ms.is_empty() {
            0
        } else {
            run.connection_durations_ms.iter().sum::<u64>() / run.connection_durations_ms.len() as u64
        };
        let average_connection_success_rate = if run.connection_success_rates.is_empty() {
            0.0
        } else {
            run.connection_success_rates.iter().sum::<f64>() / run.connection_success_rates.len() as f64
        };

        RunSummary {
            started_at_ms: run
                .started_at
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            finished: run.finished.is_some(),
            total_time_ms: total_time.as_millis() as u64,
            total_connections: run.total_connections,
            successful_connections: run.successful_connections,
            failed_connections: run.total_connections - run.successful_connections,
            connection_success_rate: ratio(run.successful_connections, run.total_connections),
            total_audio_files: run.total_audio_files,
            successful_recognitions: run.successful_recognitions,
            failed_recognitions: run.total_audio_files - run.successful_recognitions,
            timeouts: run.timeouts,
            recognition_rate: ratio(run.successful_recognitions, run.total_audio_files),
            audio_files_per_sec: per_sec(run.total_audio_files),
            recognitions_per_sec: per_sec(run.successful_recognitions),
            response_times: LatencyStats::from_samples(&run.response_times_ms),
            average_connection_duration_ms,
            average_connection_success_rate,
            resources,
            recognitions_by_file,
            error_distribution: error_distribution(&run.errors),
            errors: run.errors.clone(),
        }
    }
}

fn error_distribution(errors: &[ErrorRecord]) -> Vec<ErrorCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for e in errors {
        *counts.entry(e.message.as_str()).or_default() += 1;
    }
    let mut distribution: Vec<ErrorCount> = counts
        .into_iter()
        .map(|(message, count)| ErrorCount {
            message: message.to_string(),
            count,
        })
        .collect();
    distribution.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    distribution
}

/// Nearest-rank percentile over sorted data; 0 when empty
pub fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}
