#![forbid(unsafe_code)]

// Host resource sampling (CPU, memory, network) during a run

use crate::metrics::MetricsAggregator;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use sysinfo::{Networks, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Usage above this percentage makes results suspect
pub const PREFLIGHT_THRESHOLD_PERCENT: f32 = 80.0;

/// Raw host counters at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostCounters {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Cumulative bytes sent + received across all interfaces
    pub network_bytes_total: u64,
}

/// Source of host counters
pub trait HostProbe: Send {
    fn read(&mut self) -> HostCounters;
}

/// `HostProbe` backed by sysinfo
pub struct SysinfoProbe {
    system: System,
    networks: Networks,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SysinfoProbe {
    fn read(&mut self) -> HostCounters {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.networks.refresh(true);

        let total_memory = self.system.total_memory();
        let memory_percent = if total_memory > 0 {
            (self.system.used_memory() as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };
        let network_bytes_total = self
            .networks
            .list()
            .values()
            .map(|data| data.total_received().saturating_add(data.total_transmitted()))
            .fold(0u64, u64::saturating_add);

        HostCounters {
            cpu_percent: self.system.global_cpu_usage(),
            memory_percent,
            network_bytes_total,
        }
    }
}

/// One resource observation
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: SystemTime,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Bytes since the previous sample; 0 for the first one
    pub network_delta: u64,
}

/// Periodically records host samples into the aggregator until cancelled.
pub struct ResourceSampler {
    probe: Box<dyn HostProbe>,
    interval: Duration,
    metrics: Arc<MetricsAggregator>,
}

impl ResourceSampler {
    pub fn new(probe: Box<dyn HostProbe>, interval: Duration, metrics: Arc<MetricsAggregator>) -> Self {
        Self {
            probe,
            interval,
            metrics,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut previous_total: Option<u64> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let counters = self.probe.read();
            // Counter resets (interface churn) clamp to zero
            let network_delta = previous_total
                .map(|prev| counters.network_bytes_total.saturating_sub(prev))
                .unwrap_or(0);
            previous_total = Some(counters.network_bytes_total);

            self.metrics.record_sample(ResourceSample {
                timestamp: SystemTime::now(),
                cpu_percent: counters.cpu_percent,
                memory_percent: counters.memory_percent,
                network_delta,
            });
        }

        debug!("Resource sampler stopped");
    }
}

/// One-off host check before the run. Returns a warning per saturated resource.
pub fn preflight(probe: &mut dyn HostProbe) -> Vec<String> {
    let counters = probe.read();
    let mut warnings = Vec::new();
    if counters.cpu_percent > PREFLIGHT_THRESHOLD_PERCENT {
        warnings.push(format!(
            "High CPU usage ({:.1}%), results may be unreliable",
            counters.cpu_percent
        ));
    }
    if counters.memory_percent > PREFLIGHT_THRESHOLD_PERCENT {
        warnings.push(format!(
            "High memory usage ({:.1}%), results may be unreliable",
            counters.memory_percent
        ));
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays scripted counters, repeating the last one
    struct FakeProbe {
        script: Vec<HostCounters>,
        next: usize,
    }

    impl FakeProbe {
        fn new(script: Vec<HostCounters>) -> Self {
            Self { script, next: 0 }
        }
    }

    impl HostProbe for FakeProbe {
        fn read(&mut self) -> HostCounters {
            let idx = self.next.min(self.script.len() - 1);
            self.next += 1;
            self.script[idx]
        }
    }

    fn counters(cpu: f32, mem: f32, net: u64) -> HostCounters {
        HostCounters {
            cpu_percent: cpu,
            memory_percent: mem,
            network_bytes_total: net,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_until_cancelled() {
        let metrics = Arc::new(MetricsAggregator::new(100));
        let probe = FakeProbe::new(vec![
            counters(10.0, 50.0, 1_000),
            counters(20.0, 50.0, 1_500),
            counters(30.0, 50.0, 1_200),
        ]);
        let cancel = CancellationToken::new();
        let sampler = ResourceSampler::new(Box::new(probe), Duration::from_secs(2), metrics.clone());
        let handle = tokio::spawn(sampler.run(cancel.clone()));

        // Ticks at 0s, 2s and 4s
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        handle.await.unwrap();

        let resources = metrics.snapshot().resources;
        assert_eq!(resources.samples, 3);
        // First delta is 0, the drop from 1500 to 1200 clamps to 0
        assert_eq!(resources.recent_network_delta_bytes, vec![0, 500, 0]);
        assert_eq!(resources.recent_cpu_percent, vec![10.0, 20.0, 30.0]);
        assert!((resources.peak_cpu_percent - 30.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_tick_records_nothing() {
        let metrics = Arc::new(MetricsAggregator::new(100));
        let cancel = CancellationToken::new();
        cancel.cancel();
        ResourceSampler::new(
            Box::new(FakeProbe::new(vec![counters(1.0, 1.0, 1)])),
            Duration::from_secs(2),
            metrics.clone(),
        )
        .run(cancel)
        .await;
        assert_eq!(metrics.snapshot().resources.samples, 0);
    }

    #[test]
    fn test_preflight_warns_above_threshold() {
        let mut probe = FakeProbe::new(vec![counters(95.0, 40.0, 0)]);
        let warnings = preflight(&mut probe);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("CPU"));

        let mut probe = FakeProbe::new(vec![counters(81.0, 90.0, 0)]);
        assert_eq!(preflight(&mut probe).len(), 2);

        let mut probe = FakeProbe::new(vec![counters(80.0, 80.0, 0)]);
        assert!(preflight(&mut probe).is_empty());
    }
}
