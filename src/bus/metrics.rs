use anyhow::{Context, Result};
use dashmap::DashMap;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::BTreeMap;
use tracing::info;

use crate::config::MetricsConfig;

/// Messages admitted by the rate limiter, labeled by `source_type`
pub const MESSAGES_TOTAL: &str = "bridgebot_bus_messages_total";
/// Messages dropped by the rate limiter, labeled by `source_type`
pub const MESSAGES_DROPPED_TOTAL: &str = "bridgebot_bus_messages_dropped_total";
/// Deliveries discarded because a destination lane was full, labeled by `dest_type`
pub const DELIVERIES_OVERFLOWED_TOTAL: &str = "bridgebot_bus_deliveries_overflowed_total";

/// Bus counters keyed by platform tag. Kept locally so they can be read back,
/// and mirrored to the `metrics` facade for whatever recorder is installed.
#[derive(Debug, Default)]
pub struct BusMetrics {
    accepted: DashMap<String, u64>,
    dropped: DashMap<String, u64>,
    overflowed: DashMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub accepted: BTreeMap<String, u64>,
    pub dropped: BTreeMap<String, u64>,
    pub overflowed: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn accepted(&self, platform: &str) -> u64 {
        self.accepted.get(platform).copied().unwrap_or(0)
    }

    pub fn dropped(&self, platform: &str) -> u64 {
        self.dropped.get(platform).copied().unwrap_or(0)
    }

    pub fn overflowed(&self, platform: &str) -> u64 {
        self.overflowed.get(platform).copied().unwrap_or(0)
    }
}

fn bump(map: &DashMap<String, u64>, platform: &str) {
    if let Some(mut count) = map.get_mut(platform) {
        *count += 1;
        return;
    }
    *map.entry(platform.to_string()).or_insert(0) += 1;
}

fn collect(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
    map.iter().map(|e| (e.key().clone(), *e.value())).collect()
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self, source_type: &str) {
        bump(&self.accepted, source_type);
        counter!(MESSAGES_TOTAL, "source_type" => source_type.to_string()).increment(1);
    }

    pub fn record_dropped(&self, source_type: &str) {
        bump(&self.dropped, source_type);
        counter!(MESSAGES_DROPPED_TOTAL, "source_type" => source_type.to_string()).increment(1);
    }

    pub fn record_overflow(&self, dest_type: &str) {
        bump(&self.overflowed, dest_type);
        counter!(DELIVERIES_OVERFLOWED_TOTAL, "dest_type" => dest_type.to_string())
            .increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: collect(&self.accepted),
            dropped: collect(&self.dropped),
            overflowed: collect(&self.overflowed),
        }
    }
}

/// Install the Prometheus recorder and serve `/metrics` over HTTP. Without
/// it every counter above is discarded by the facade's no-op recorder.
///
/// Must be called once, from within the tokio runtime.
pub fn install_exporter(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        info!("Metrics exporter is disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .install()
        .with_context(|| format!("Failed to start metrics exporter on {}", config.listen_addr))?;

    info!("Serving Prometheus metrics on http://{}/metrics", config.listen_addr);
    Ok(())
}
