//! Backend Filters
//!
//! A backend survives placement only when every filter passes. Each filter
//! explains a rejection so `NoValidBackend` can say why nothing fit.

use super::extra_specs;
use super::PlacementRequest;
use crate::domain::model::BACKEND_NAME_SPEC;
use crate::domain::ports::CapabilityReport;
use crate::registry::{Backend, BackendHealth};

/// Why a filter rejected a backend
pub type Rejection = String;

/// One placement constraint
pub trait BackendFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, backend: &Backend, request: &PlacementRequest) -> Result<(), Rejection>;
}

/// Filters in evaluation order
pub fn default_filters() -> Vec<Box<dyn BackendFilter>> {
    vec![
        Box::new(AvailabilityFilter),
        Box::new(BackendNameFilter),
        Box::new(CapacityFilter),
        Box::new(CapabilitiesFilter),
    ]
}

fn report_of(backend: &Backend) -> Result<&CapabilityReport, Rejection> {
    backend
        .report
        .as_deref()
        .ok_or_else(|| "no capability report".to_string())
}

// =============================================================================
// Availability
// =============================================================================

/// Backend is reachable, not excluded, and the pinned one if pinned
pub struct AvailabilityFilter;

impl BackendFilter for AvailabilityFilter {
    fn name(&self) -> &'static str {
        "availability"
    }

    fn check(&self, backend: &Backend, request: &PlacementRequest) -> Result<(), Rejection> {
        if let Some(pinned) = &request.pinned_backend {
            if pinned != &backend.name {
                return Err(format!("request pinned to {}", pinned));
            }
        }
        if request.exclude.contains(&backend.name) {
            return Err("replication pair in transition".to_string());
        }
        if let BackendHealth::Unreachable(reason) = &backend.health {
            return Err(format!("unreachable: {}", reason));
        }
        report_of(backend).map(|_| ())
    }
}

// =============================================================================
// Backend Name
// =============================================================================

/// `volume_backend_name` extra-spec
pub struct BackendNameFilter;

impl BackendFilter for BackendNameFilter {
    fn name(&self) -> &'static str {
        "backend_name"
    }

    fn check(&self, backend: &Backend, request: &PlacementRequest) -> Result<(), Rejection> {
        match request.extra_specs.get(BACKEND_NAME_SPEC) {
            Some(wanted) if !extra_specs::matches(wanted, Some(&backend.name)) => {
                Err(format!("volume_backend_name {} does not match", wanted))
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Capacity
// =============================================================================

/// Usable free space and over-subscription limits
pub struct CapacityFilter;

impl CapacityFilter {
    /// Free space the request needs on `report`
    pub fn required_gb(report: &CapabilityReport, request: &PlacementRequest) -> f64 {
        let size = request.size_gb as f64;
        if request.thin && report.thin_provisioning_support {
            size / report.max_over_subscription_ratio.max(1.0)
        } else {
            size
        }
    }
}

impl BackendFilter for CapacityFilter {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn check(&self, backend: &Backend, request: &PlacementRequest) -> Result<(), Rejection> {
        let report = report_of(backend)?;
        let size = request.size_gb as f64;
        let thin = request.thin && report.thin_provisioning_support;

        if !thin && !report.thick_provisioning_support {
            return Err("thick provisioning not supported".to_string());
        }
        if thin {
            let limit = report.total_capacity_gb * report.max_over_subscription_ratio.max(1.0);
            if report.provisioned_capacity_gb + size > limit {
                return Err(format!(
                    "over-subscription limit: {:.1} + {} > {:.1} GiB",
                    report.provisioned_capacity_gb, request.size_gb, limit
                ));
            }
        }

        let required = Self::required_gb(report, request);
        let usable = report.usable_free_gb();
        if usable < required {
            return Err(format!(
                "insufficient capacity: need {:.1} GiB, usable {:.1} GiB",
                required, usable
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Capability extra-specs match the report
pub struct CapabilitiesFilter;

impl BackendFilter for CapabilitiesFilter {
    fn name(&self) -> &'static str {
        "capabilities"
    }

    fn check(&self, backend: &Backend, request: &PlacementRequest) -> Result<(), Rejection> {
        let report = report_of(backend)?;
        for (key, wanted) in &request.extra_specs {
            let Some(capability) = extra_specs::capability_key(key) else {
                continue;
            };
            let actual = report.capability(capability);
            if !extra_specs::matches(wanted, actual.as_deref()) {
                return Err(format!(
                    "{} is {}, wanted {}",
                    capability,
                    actual.as_deref().unwrap_or("unset"),
                    wanted
                ));
            }
        }
        Ok(())
    }
}
