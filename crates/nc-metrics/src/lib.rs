//! Operational metrics: atomic counters plus Prometheus text export on
//! `/metrics`.
//!
//! The signed audit trail of privileged actions lives in `nc_audit`, not
//! here — this crate is purely numeric counters for dashboards/alerting.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A thread-safe u64 counter backed by an atomic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Atomic operation counters for the node agent.
///
/// # Example
/// ```rust
/// # use nc_metrics::OperationsMetrics;
/// # use std::sync::Arc;
/// let metrics = Arc::new(OperationsMetrics::new());
/// metrics.deploys_total.inc();
/// assert_eq!(metrics.deploys_total.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct OperationsMetrics {
    /// Total `/deploy` calls that reached the DeployEngine.
    pub deploys_total: Counter,
    /// Deploys that ended in `DeployFailed{..}`.
    pub deploy_errors: Counter,
    /// Total `/rollback` calls.
    pub rollbacks_total: Counter,
    /// Total health-probe attempts during `Probing`.
    pub probe_attempts_total: Counter,
    /// Probe attempts that did not return HTTP 200.
    pub probe_failures_total: Counter,
    /// CommandQueue entries re-appended after a handler failure.
    pub queue_retries_total: Counter,
    /// AuthGate rejections (missing headers, unknown identity, bad
    /// signature, or insufficient role).
    pub auth_failures_total: Counter,
    /// Key-rotation cycles completed.
    pub key_rotations_total: Counter,
    /// Commands fully processed off the queue.
    pub commands_processed_total: Counter,
}

impl OperationsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_deploy_attempt(&self) {
        self.deploys_total.inc();
    }

    pub fn record_deploy_error(&self) {
        self.deploy_errors.inc();
        tracing::warn!(
            counter = "deploy_errors",
            value = self.deploy_errors.get(),
            "deploy failed"
        );
    }

    pub fn record_rollback(&self) {
        self.rollbacks_total.inc();
        tracing::warn!(
            counter = "rollbacks_total",
            value = self.rollbacks_total.get(),
            "rollback initiated"
        );
    }

    pub fn record_probe_attempt(&self) {
        self.probe_attempts_total.inc();
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures_total.inc();
    }

    pub fn record_queue_retry(&self) {
        self.queue_retries_total.inc();
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures_total.inc();
        tracing::warn!(
            counter = "auth_failures_total",
            value = self.auth_failures_total.get(),
            "AuthGate rejection"
        );
    }

    pub fn record_key_rotation(&self) {
        self.key_rotations_total.inc();
    }

    pub fn record_command_processed(&self) {
        self.commands_processed_total.inc();
    }
}

/// Exports [`OperationsMetrics`] in Prometheus text format.
pub struct MetricsExporter {
    metrics: Arc<OperationsMetrics>,
    /// Label prefix added to all metric names (default: `nextcore`).
    prefix: String,
}

impl MetricsExporter {
    pub fn new(metrics: Arc<OperationsMetrics>) -> Self {
        Self {
            metrics,
            prefix: "nextcore".to_string(),
        }
    }

    pub fn with_prefix(metrics: Arc<OperationsMetrics>, prefix: impl Into<String>) -> Self {
        Self {
            metrics,
            prefix: prefix.into(),
        }
    }

    /// Render all metrics as a Prometheus text format string, each with
    /// `# HELP`, `# TYPE`, and value lines.
    pub fn render(&self) -> String {
        let m = &self.metrics;
        let p = &self.prefix;
        let mut out = String::new();

        self.write_counter(&mut out, p, "deploys_total", "Total deploy attempts", m.deploys_total.get());
        self.write_counter(&mut out, p, "deploy_errors", "Total deploy failures", m.deploy_errors.get());
        self.write_counter(&mut out, p, "rollbacks_total", "Total rollback attempts", m.rollbacks_total.get());
        self.write_counter(
            &mut out,
            p,
            "probe_attempts_total",
            "Total health-probe attempts during a deploy",
            m.probe_attempts_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "probe_failures_total",
            "Total non-200 health-probe responses",
            m.probe_failures_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "queue_retries_total",
            "Total command-queue entries re-appended after failure",
            m.queue_retries_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "auth_failures_total",
            "Total AuthGate rejections",
            m.auth_failures_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "key_rotations_total",
            "Total key-rotation cycles completed",
            m.key_rotations_total.get(),
        );
        self.write_counter(
            &mut out,
            p,
            "commands_processed_total",
            "Total commands processed off the queue",
            m.commands_processed_total.get(),
        );

        out
    }

    fn write_counter(&self, out: &mut String, prefix: &str, name: &str, help: &str, value: u64) {
        out.push_str(&format!("# HELP {prefix}_{name} {help}\n"));
        out.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
        out.push_str(&format!("{prefix}_{name} {value}\n\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_independently() {
        let m = OperationsMetrics::new();
        m.record_deploy_attempt();
        m.record_deploy_attempt();
        m.record_deploy_error();
        m.record_rollback();

        assert_eq!(m.deploys_total.get(), 2);
        assert_eq!(m.deploy_errors.get(), 1);
        assert_eq!(m.rollbacks_total.get(), 1);
        assert_eq!(m.probe_attempts_total.get(), 0);
    }

    #[test]
    fn exporter_renders_prometheus_text_with_zero_counters_present() {
        let metrics = Arc::new(OperationsMetrics::new());
        metrics.record_deploy_attempt();
        metrics.record_deploy_attempt();
        metrics.record_deploy_error();

        let exporter = MetricsExporter::new(metrics);
        let output = exporter.render();

        assert!(output.contains("# HELP nextcore_deploys_total"));
        assert!(output.contains("# TYPE nextcore_deploys_total counter"));
        assert!(output.contains("nextcore_deploys_total 2"));
        assert!(output.contains("nextcore_deploy_errors 1"));
        assert!(output.contains("nextcore_rollbacks_total 0"));
    }

    #[test]
    fn exporter_custom_prefix_replaces_default() {
        let metrics = Arc::new(OperationsMetrics::new());
        let exporter = MetricsExporter::with_prefix(metrics, "myagent");
        let output = exporter.render();
        assert!(output.contains("myagent_deploys_total"));
        assert!(!output.contains("nextcore_deploys_total"));
    }
}
