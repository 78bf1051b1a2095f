#![forbid(unsafe_code)]

use anyhow::Result;
use asr_stress::cli::Args;
use asr_stress::metrics::MetricsAggregator;
use asr_stress::orchestrator::Orchestrator;
use asr_stress::readiness::HttpHealthProbe;
use asr_stress::report;
use asr_stress::sampler::{preflight, SysinfoProbe};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays clean for the summary
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_stress=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let json = args.json;
    let config = Arc::new(args.into_run_config()?);

    if !json {
        report::print_banner(&config);
    }

    // CPU usage needs two refreshes spaced apart
    let mut host = SysinfoProbe::new();
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    for warning in preflight(&mut host) {
        warn!("{}", warning);
    }

    let health = HttpHealthProbe::new(&config.server_url, config.readiness.request_timeout)?;
    info!("Health endpoint: {}", health.url());

    let metrics = Arc::new(MetricsAggregator::new(config.sampler.history));
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping workers");
            interrupt.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(config.clone(), metrics.clone())
        .with_host_probe(Box::new(host))
        .with_progress(!json);
    let result = orchestrator.run(&health, cancel).await;

    if result.is_ok() || metrics.connections_recorded() > 0 {
        let summary = metrics.snapshot();
        if json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            report::print_summary(&summary);
        }
    }

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!("Stress test aborted: {}", e);
            Err(e.into())
        }
        // Cancellation ends the run without a failing exit status
        Err(e) => {
            warn!("Run ended early: {}", e);
            Ok(())
        }
    }
}
