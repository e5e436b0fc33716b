//! Service Metrics
//!
//! Prometheus collectors for volume operations, backend health and
//! replication. Collectors live in a per-service registry so several
//! services can coexist in one process.

use crate::error::{Error, Result};
use crate::registry::{Backend, BackendHealth};
use crate::volume::VolumeStatus;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::collections::BTreeMap;

const NAMESPACE: &str = "volume_orchestrator";

/// Collectors owned by one service
pub struct ServiceMetrics {
    registry: Registry,
    operations: IntCounterVec,
    operation_seconds: HistogramVec,
    backend_health: IntGaugeVec,
    backend_free_gb: GaugeVec,
    backend_in_flight: IntGaugeVec,
    volumes: IntGaugeVec,
    failovers: IntCounterVec,
    reconciled: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Volume operations by outcome").namespace(NAMESPACE),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;
        let operation_seconds = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Volume operation latency")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let backend_health = IntGaugeVec::new(
            Opts::new(
                "backend_health",
                "0 healthy, 1 degraded, 2 unreachable",
            )
            .namespace(NAMESPACE),
            &["backend"],
        )
        .map_err(metrics_error)?;
        let backend_free_gb = GaugeVec::new(
            Opts::new("backend_free_capacity_gb", "Last reported free capacity")
                .namespace(NAMESPACE),
            &["backend"],
        )
        .map_err(metrics_error)?;
        let backend_in_flight = IntGaugeVec::new(
            Opts::new("backend_in_flight_calls", "Driver calls in flight").namespace(NAMESPACE),
            &["backend"],
        )
        .map_err(metrics_error)?;
        let volumes = IntGaugeVec::new(
            Opts::new("volumes", "Volumes by status").namespace(NAMESPACE),
            &["status"],
        )
        .map_err(metrics_error)?;
        let failovers = IntCounterVec::new(
            Opts::new("replication_switches_total", "Failover and failback attempts")
                .namespace(NAMESPACE),
            &["backend", "direction", "outcome"],
        )
        .map_err(metrics_error)?;
        let reconciled = IntCounterVec::new(
            Opts::new("reconciled_total", "Pending records resolved by reconciliation")
                .namespace(NAMESPACE),
            &["result"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(operations.clone())).map_err(metrics_error)?;
        registry.register(Box::new(operation_seconds.clone())).map_err(metrics_error)?;
        registry.register(Box::new(backend_health.clone())).map_err(metrics_error)?;
        registry.register(Box::new(backend_free_gb.clone())).map_err(metrics_error)?;
        registry.register(Box::new(backend_in_flight.clone())).map_err(metrics_error)?;
        registry.register(Box::new(volumes.clone())).map_err(metrics_error)?;
        registry.register(Box::new(failovers.clone())).map_err(metrics_error)?;
        registry.register(Box::new(reconciled.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            operation_seconds,
            backend_health,
            backend_free_gb,
            backend_in_flight,
            volumes,
            failovers,
            reconciled,
        })
    }

    /// Count one operation; errors are labelled by variant
    pub fn record_operation<T>(&self, operation: &str, result: &Result<T>, seconds: f64) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        self.operations.with_label_values(&[operation, outcome]).inc();
        self.operation_seconds
            .with_label_values(&[operation])
            .observe(seconds);
    }

    pub fn record_switch<T>(&self, backend: &str, direction: &str, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        self.failovers
            .with_label_values(&[backend, direction, outcome])
            .inc();
    }

    pub fn record_reconcile(&self, recovered: usize, removed: usize, failed: usize) {
        self.reconciled
            .with_label_values(&["recovered"])
            .inc_by(recovered as u64);
        self.reconciled
            .with_label_values(&["removed"])
            .inc_by(removed as u64);
        self.reconciled
            .with_label_values(&["failed"])
            .inc_by(failed as u64);
    }

    /// Refresh backend gauges from a registry snapshot
    pub fn observe_backends(&self, backends: &[Backend]) {
        for backend in backends {
            let health = match backend.health {
                BackendHealth::Healthy => 0,
                BackendHealth::Degraded(_) => 1,
                BackendHealth::Unreachable(_) => 2,
            };
            self.backend_health
                .with_label_values(&[backend.name.as_str()])
                .set(health);
            self.backend_in_flight
                .with_label_values(&[backend.name.as_str()])
                .set(backend.in_flight as i64);
            if let Some(report) = &backend.report {
                self.backend_free_gb
                    .with_label_values(&[backend.name.as_str()])
                    .set(report.free_capacity_gb);
            }
        }
    }

    /// Refresh per-status volume gauges; absent statuses read zero
    pub fn observe_volumes(&self, counts: &BTreeMap<VolumeStatus, usize>) {
        for status in VolumeStatus::ALL {
            let count = counts.get(&status).copied().unwrap_or(0);
            let label = status.to_string();
            self.volumes
                .with_label_values(&[label.as_str()])
                .set(count as i64);
        }
    }

    /// Text exposition of every collector
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_outcomes_are_labelled() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.record_operation("create_volume", &Ok::<_, Error>(()), 0.2);
        metrics.record_operation::<()>(
            "create_volume",
            &Err(Error::NoValidBackend {
                reason: "none".into(),
            }),
            0.01,
        );

        let (content_type, body) = metrics.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("volume_orchestrator_operations_total"));
        assert!(text.contains("outcome=\"no_valid_backend\""));
    }

    #[test]
    fn test_volume_gauges_cover_every_status() {
        let metrics = ServiceMetrics::new().unwrap();
        let mut counts = BTreeMap::new();
        counts.insert(VolumeStatus::Available, 3);
        metrics.observe_volumes(&counts);

        let text = String::from_utf8(metrics.encode().unwrap().1).unwrap();
        assert!(text.contains("volume_orchestrator_volumes{status=\"available\"} 3"));
        assert!(text.contains("volume_orchestrator_volumes{status=\"deleted\"} 0"));
    }
}
