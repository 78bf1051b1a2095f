#![forbid(unsafe_code)]

// Run lifecycle: readiness gate, corpus partitioning, worker and sampler tasks

use crate::audio::{discover_corpus, CorpusEntry};
use crate::config::RunConfig;
use crate::error::StressResult;
use crate::metrics::MetricsAggregator;
use crate::readiness::{wait_until_ready, ReadinessProbe};
use crate::report;
use crate::sampler::{HostProbe, ResourceSampler, SysinfoProbe};
use crate::streamer::AudioStreamer;
use crate::worker::ConnectionWorker;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    WaitingForService,
    Running,
    Draining,
    Done,
    /// Corpus or readiness failure; no worker was started
    Aborted,
}

pub struct Orchestrator {
    config: Arc<RunConfig>,
    metrics: Arc<MetricsAggregator>,
    host_probe: Option<Box<dyn HostProbe>>,
    show_progress: bool,
    phase: RunPhase,
}

impl Orchestrator {
    pub fn new(config: Arc<RunConfig>, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            config,
            metrics,
            host_probe: None,
            show_progress: true,
            phase: RunPhase::WaitingForService,
        }
    }

    /// Replaces the sysinfo probe used by the resource sampler
    pub fn with_host_probe(mut self, probe: Box<dyn HostProbe>) -> Self {
        self.host_probe = Some(probe);
        self
    }

    /// Toggles the per-worker progress line on stdout
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Runs the whole test. Only corpus, configuration and readiness failures
    /// are returned; everything that goes wrong inside a worker ends up in the
    /// aggregator instead.
    pub async fn run(&mut self, probe: &impl ReadinessProbe, cancel: CancellationToken) -> StressResult<()> {
        self.phase = RunPhase::WaitingForService;

        let corpus = match discover_corpus(&self.config.audio_dir).await {
            Ok(corpus) => corpus,
            Err(e) => {
                self.phase = RunPhase::Aborted;
                return Err(e);
            }
        };

        if let Err(e) = wait_until_ready(probe, &self.config.readiness, &cancel).await {
            self.phase = RunPhase::Aborted;
            return Err(e);
        }

        self.phase = RunPhase::Running;
        self.metrics.mark_started();

        let seed = self.config.seed.unwrap_or_else(rand::random);
        info!("Using seed {}", seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let assignments = partition(
            &corpus,
            self.config.connections,
            self.config.audio_per_connection,
            &mut rng,
        );

        let sampler_cancel = cancel.child_token();
        let host_probe = self
            .host_probe
            .take()
            .unwrap_or_else(|| Box::new(SysinfoProbe::new()) as Box<dyn HostProbe>);
        let sampler = tokio::spawn(
            ResourceSampler::new(host_probe, self.config.sampler.interval, self.metrics.clone())
                .run(sampler_cancel.clone()),
        );

        let streamer = Arc::new(AudioStreamer::new(
            self.config.streamer.clone(),
            self.config.post_send_wait,
        ));
        let total = assignments.len();
        info!(
            "Starting {} connections, {} files each, against {}",
            total,
            assignments.first().map(Vec::len).unwrap_or(0),
            self.config.server_url
        );

        let mut workers = JoinSet::new();
        for (i, files) in assignments.into_iter().enumerate() {
            let worker = ConnectionWorker::new(
                i + 1,
                self.config.server_url.clone(),
                files,
                self.config.worker.clone(),
                streamer.clone(),
                StdRng::seed_from_u64(rng.random()),
            );
            workers.spawn(worker.run(self.metrics.clone(), cancel.clone()));
        }

        let mut completed = 0;
        while let Some(joined) = workers.join_next().await {
            completed += 1;
            match joined {
                Ok(outcome) => debug!(
                    "conn-{} joined ({} tests, connected: {})",
                    outcome.worker_id,
                    outcome.tests.len(),
                    outcome.connected
                ),
                Err(e) => error!("Worker task failed: {}", e),
            }
            if self.show_progress {
                report::print_progress(completed, total);
            }
        }

        self.phase = RunPhase::Draining;
        sampler_cancel.cancel();
        if let Err(e) = sampler.await {
            warn!("Resource sampler task failed: {}", e);
        }

        self.metrics.mark_finished();
        self.phase = RunPhase::Done;
        if cancel.is_cancelled() {
            warn!("Run interrupted after {}/{} connections", completed, total);
        }
        Ok(())
    }
}

/// Gives each of `connections` workers `min(per_connection, corpus.len())`
/// distinct files, drawn independently per worker.
pub fn partition<R: Rng + ?Sized>(
    corpus: &[CorpusEntry],
    connections: usize,
    per_connection: usize,
    rng: &mut R,
) -> Vec<Vec<PathBuf>> {
    let take = per_connection.min(corpus.len());
    (0..connections)
        .map(|_| {
            corpus
                .choose_multiple(rng, take)
                .map(|entry| entry.path.clone())
                .collect()
        })
        .collect()
}
