//! Filter-Weigher Scheduler
//!
//! Ranking is a pure function of a registry snapshot and the request, so two
//! calls over the same snapshot pick the same backend. Placement then drives
//! the create call, moving to the next-ranked backend only when the array
//! gave a definitive `BackendUnavailable`.

use super::filters::{default_filters, BackendFilter};
use super::weigher::{weigh, WeighedBackend, WeigherConfig};
use super::PlacementRequest;
use crate::controlplane::backends::GuardedDriver;
use crate::error::{Error, Result};
use crate::registry::{Backend, BackendRegistry};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub weigher: WeigherConfig,
    /// Backends tried for one create, including the first
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weigher: WeigherConfig::default(),
            max_attempts: 2,
        }
    }
}

/// Outcome of a successful placement
#[derive(Debug, Clone)]
pub struct Placement<T> {
    pub backend: String,
    pub value: T,
    /// Backends tried before the winner answered
    pub attempts: u32,
}

/// Filter-weigher scheduler over the backend registry
pub struct Scheduler {
    registry: Arc<BackendRegistry>,
    filters: Vec<Box<dyn BackendFilter>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(registry: Arc<BackendRegistry>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            filters: default_filters(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Rank `backends` for `request`, best first
    pub fn rank(&self, backends: &[Backend], request: &PlacementRequest) -> Result<Vec<WeighedBackend>> {
        rank_with(&self.filters, &self.config.weigher, backends, request)
    }

    /// Rank the registry's current snapshot
    pub fn select(&self, request: &PlacementRequest) -> Result<Vec<WeighedBackend>> {
        self.rank(&self.registry.snapshot(), request)
    }

    /// Choose a backend and run `create` on it.
    ///
    /// A definitive `BackendUnavailable` marks the backend degraded and moves
    /// on to the next-ranked one, up to `max_attempts`. Every other error,
    /// timeouts included, is returned as is.
    pub async fn place<T, F, Fut>(&self, request: &PlacementRequest, mut create: F) -> Result<Placement<T>>
    where
        F: FnMut(GuardedDriver) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ranked = self.select(request)?;
        let max_attempts = self.config.max_attempts.max(1) as usize;
        let mut last_error = None;

        for (attempt, candidate) in ranked.iter().take(max_attempts).enumerate() {
            let driver = self.registry.driver(&candidate.name)?;
            debug!(
                "Placing {} GiB on {} (score {:.3}, attempt {})",
                request.size_gb,
                candidate.name,
                candidate.score,
                attempt + 1
            );

            match create(driver).await {
                Ok(value) => {
                    info!("Placed {} GiB volume on {}", request.size_gb, candidate.name);
                    return Ok(Placement {
                        backend: candidate.name.clone(),
                        value,
                        attempts: attempt as u32 + 1,
                    });
                }
                Err(e @ Error::BackendUnavailable { .. }) => {
                    warn!("Backend {} unavailable during create: {}", candidate.name, e);
                    if let Err(mark) = self.registry.mark_degraded(&candidate.name, e.to_string()) {
                        debug!("Could not mark backend {} degraded: {}", candidate.name, mark);
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::NoValidBackend {
            reason: "no ranked backend".to_string(),
        }))
    }
}

/// Filter then weigh
pub fn rank_with(
    filters: &[Box<dyn BackendFilter>],
    weigher: &WeigherConfig,
    backends: &[Backend],
    request: &PlacementRequest,
) -> Result<Vec<WeighedBackend>> {
    if backends.is_empty() {
        return Err(Error::NoValidBackend {
            reason: "no backends registered".to_string(),
        });
    }

    let mut survivors = Vec::new();
    let mut rejections = Vec::new();
    for backend in backends {
        let verdict = filters
            .iter()
            .try_for_each(|f| f.check(backend, request).map_err(|r| format!("{} ({})", f.name(), r)));
        match verdict {
            Ok(()) => survivors.push(backend),
            Err(reason) => rejections.push(format!("{}: {}", backend.name, reason)),
        }
    }

    if survivors.is_empty() {
        rejections.sort();
        return Err(Error::NoValidBackend {
            reason: rejections.join("; "),
        });
    }
    Ok(weigh(&survivors, weigher))
}
