use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

use airdrop_common::{AirdropError, AirdropResult};

/// Distributor counters, kept in a private registry
#[derive(Clone)]
pub struct DistributorMetrics {
    registry: Registry,
    pub cycles_run: IntCounter,
    pub cycles_skipped: IntCounter,
    pub tasks_processed: IntCounter,
    pub tasks_failed: IntCounter,
    pub proofs_written: IntCounter,
    pub records_rejected: IntCounter,
    pub publish_succeeded: IntCounter,
    pub publish_failed: IntCounter,
    pub last_cycle_seconds: Gauge,
}

fn metric_error(e: prometheus::Error) -> AirdropError {
    AirdropError::Internal(format!("metrics: {}", e))
}

fn counter(registry: &Registry, name: &str, help: &str) -> AirdropResult<IntCounter> {
    let counter = IntCounter::new(name, help).map_err(metric_error)?;
    registry.register(Box::new(counter.clone())).map_err(metric_error)?;
    Ok(counter)
}

impl DistributorMetrics {
    pub fn new() -> AirdropResult<Self> {
        let registry = Registry::new();

        let last_cycle_seconds = Gauge::new(
            "airdrop_last_cycle_duration_seconds",
            "Wall time of the most recent distribution cycle",
        )
        .map_err(metric_error)?;
        registry.register(Box::new(last_cycle_seconds.clone())).map_err(metric_error)?;

        Ok(Self {
            cycles_run: counter(&registry, "airdrop_cycles_total", "Distribution cycles started")?,
            cycles_skipped: counter(
                &registry,
                "airdrop_cycles_skipped_total",
                "Triggers dropped because a cycle was already running",
            )?,
            tasks_processed: counter(&registry, "airdrop_tasks_processed_total", "Task trees built")?,
            tasks_failed: counter(&registry, "airdrop_tasks_failed_total", "Tasks skipped after an error")?,
            proofs_written: counter(&registry, "airdrop_proofs_written_total", "Proofs persisted to the store")?,
            records_rejected: counter(
                &registry,
                "airdrop_records_rejected_total",
                "User task records that could not be encoded",
            )?,
            publish_succeeded: counter(&registry, "airdrop_publish_success_total", "Root batches broadcast")?,
            publish_failed: counter(&registry, "airdrop_publish_failure_total", "Root batches that failed to broadcast")?,
            last_cycle_seconds,
            registry,
        })
    }

    /// Prometheus text exposition of every metric
    pub fn render(&self) -> AirdropResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| AirdropError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = DistributorMetrics::new().unwrap();
        metrics.cycles_run.inc();
        metrics.proofs_written.inc_by(3);
        metrics.last_cycle_seconds.set(1.5);

        let output = metrics.render().unwrap();
        assert!(output.contains("airdrop_cycles_total 1"));
        assert!(output.contains("airdrop_proofs_written_total 3"));
        assert!(output.contains("airdrop_last_cycle_duration_seconds 1.5"));
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let first = DistributorMetrics::new().unwrap();
        let second = DistributorMetrics::new().unwrap();
        first.publish_failed.inc();
        assert_eq!(second.publish_failed.get(), 0);
    }
}
