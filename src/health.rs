//! Collector health probe.

use crate::config::HealthCheckConfig;

/// Outcome of probing the collector's health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Probing is disabled in configuration.
    Skipped,
    /// The endpoint answered with a 2xx status.
    Healthy(u16),
    /// The endpoint answered with a non-2xx status.
    Unhealthy(u16),
    /// The request failed before a response arrived.
    Unreachable(String),
}

impl HealthStatus {
    /// Returns true only for a 2xx answer.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }
}

/// Sends a single GET to the collector's health endpoint.
///
/// The result is logged and returned for inspection, but a failed probe never
/// stops the run: emission proceeds either way.
pub fn probe_collector(config: &HealthCheckConfig) -> HealthStatus {
    if !config.enabled {
        return HealthStatus::Skipped;
    }

    let client = match reqwest::blocking::Client::builder()
        .timeout(config.timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(target: "harness_lifecycle", error = %e, "Could not create health probe client");
            return HealthStatus::Unreachable(e.to_string());
        }
    };

    match client.get(&config.url).send() {
        Ok(response) if response.status().is_success() => {
            let status = response.status().as_u16();
            tracing::info!(target: "harness_lifecycle", url = %config.url, status, "Collector is healthy");
            HealthStatus::Healthy(status)
        }
        Ok(response) => {
            let status = response.status().as_u16();
            tracing::warn!(target: "harness_lifecycle", url = %config.url, status, "Collector health check failed");
            HealthStatus::Unhealthy(status)
        }
        Err(e) => {
            tracing::warn!(target: "harness_lifecycle", url = %config.url, error = %e, "Collector health endpoint unreachable");
            HealthStatus::Unreachable(e.to_string())
        }
    }
}
