// ABOUTME: Optional Prometheus exporter for the dispatcher's metrics
// ABOUTME: Serves /metrics on the configured port when the prometheus feature is enabled

use crate::config::MetricsConfig;
use anyhow::Result;

/// Install the global metrics recorder. Without a port the `metrics` macros
/// stay no-ops.
pub fn init(config: &MetricsConfig) -> Result<()> {
    let Some(port) = config.port else {
        tracing::debug!("Metrics exporter disabled");
        return Ok(());
    };

    #[cfg(feature = "prometheus")]
    {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            )?
            .install()?;
        tracing::info!(port, "Prometheus exporter listening");
    }

    #[cfg(not(feature = "prometheus"))]
    tracing::warn!(port, "Metrics port set but the prometheus feature is not enabled");

    Ok(())
}
