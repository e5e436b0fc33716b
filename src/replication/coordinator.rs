//! Replication Failover Coordinator
//!
//! Drives failover from a primary backend to its replication target and
//! failback to the primary. While a pair is in transition the volume
//! manager rejects operations on the primary's volumes, and the scheduler
//! skips the backend for new placements.

use super::pairs::{PairEntry, PairState, ReplicationTable};
use crate::domain::model::{ActiveSide, ReplicationPair};
use crate::domain::ports::{FailoverTarget, ReplicationStatus};
use crate::error::{Error, Result};
use crate::registry::BackendRegistry;
use crate::volume::VolumeManager;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a completed failover or failback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverOutcome {
    pub primary: String,
    /// `None` once the pair is back on the primary
    pub active_backend_id: Option<String>,
    pub volumes_rebound: usize,
}

/// Pair state along with what the array reports
#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub entry: PairEntry,
    pub array: Option<ReplicationStatus>,
    pub error: Option<String>,
}

pub struct FailoverCoordinator {
    registry: Arc<BackendRegistry>,
    table: Arc<ReplicationTable>,
    volumes: Arc<VolumeManager>,
}

impl FailoverCoordinator {
    pub fn new(volumes: Arc<VolumeManager>) -> Self {
        Self {
            registry: volumes.registry().clone(),
            table: volumes.replication().clone(),
            volumes,
        }
    }

    pub fn table(&self) -> &Arc<ReplicationTable> {
        &self.table
    }

    /// Create a pair for every registered backend with a replication device
    pub fn register_pairs(&self) -> Result<usize> {
        let mut added = 0;
        for backend in self.registry.list_backends() {
            let Some(device) = &backend.replication else {
                continue;
            };
            if self.table.get(&backend.name).is_some() {
                continue;
            }
            self.table.insert(ReplicationPair {
                primary: backend.name.clone(),
                secondary: device.backend_id.clone(),
                mode: device.mode,
                rpo: device.rpo,
                active_side: ActiveSide::Primary,
            })?;
            info!(
                "Replication pair {} -> {} ({:?}, rpo {:?})",
                backend.name, device.backend_id, device.mode, device.rpo
            );
            added += 1;
        }
        Ok(added)
    }

    pub fn pair(&self, primary: &str) -> Result<PairEntry> {
        self.table
            .get(primary)
            .ok_or_else(|| Error::ReplicationNotConfigured {
                backend: primary.to_string(),
            })
    }

    pub fn list_pairs(&self) -> Vec<PairEntry> {
        self.table.list()
    }

    pub fn is_in_transition(&self, backend: &str) -> bool {
        self.table.is_in_transition(backend)
    }

    /// Promote the replication target of `primary`
    pub async fn failover(&self, primary: &str, target: &str) -> Result<FailoverOutcome> {
        let driver = self.registry.driver(primary)?;
        self.table.transition(primary, |entry| match &entry.state {
            PairState::Normal if entry.pair.secondary == target => Ok(PairState::FailingOver {
                target: target.to_string(),
            }),
            PairState::Normal => Err(Error::ReplicationNotConfigured {
                backend: format!("{} -> {}", primary, target),
            }),
            state if state.is_transitioning() => Err(Error::FailoverInProgress {
                backend: primary.to_string(),
            }),
            state => Err(Error::InvalidRequest(format!(
                "pair {} is {}, failover needs a normal pair",
                primary, state
            ))),
        })?;
        info!("Failing over {} to {}", primary, target);

        match driver
            .failover(&FailoverTarget::Secondary(target.to_string()))
            .await
        {
            Ok(()) => {
                // Still failing over: volume operations stay blocked until rebound
                let rebound = self.volumes.rebind_pair(primary, Some(target), true).await;
                self.table.settle(
                    primary,
                    PairState::FailedOver {
                        target: target.to_string(),
                    },
                    Some(ActiveSide::Secondary(target.to_string())),
                );
                let rebound = rebound + self.volumes.sync_active_backend(primary).await;
                info!("Failed over {} to {} ({} volumes)", primary, target, rebound);
                Ok(FailoverOutcome {
                    primary: primary.to_string(),
                    active_backend_id: Some(target.to_string()),
                    volumes_rebound: rebound,
                })
            }
            Err(e) => {
                self.settle_failed(primary, PairState::Normal, &e);
                Err(e)
            }
        }
    }

    /// Return a failed-over pair to its primary
    pub async fn failback(&self, primary: &str) -> Result<FailoverOutcome> {
        let driver = self.registry.driver(primary)?;
        let entry = self
            .table
            .get(primary)
            .ok_or_else(|| Error::ReplicationNotConfigured {
                backend: primary.to_string(),
            })?;
        let from = match &entry.state {
            PairState::FailedOver { target } => target.clone(),
            state if state.is_transitioning() => {
                return Err(Error::FailoverInProgress {
                    backend: primary.to_string(),
                })
            }
            state => {
                return Err(Error::InvalidRequest(format!(
                    "pair {} is {}, failback needs a failed-over pair",
                    primary, state
                )))
            }
        };

        let status = driver.replication_status().await?;
        if status.sync_incomplete {
            warn!(
                "Failback of {} refused: {} is {}s behind",
                primary, from, status.lag_secs
            );
            return Err(Error::SyncIncomplete {
                backend: primary.to_string(),
                reason: format!("replica {} is {}s behind", from, status.lag_secs),
            });
        }

        self.table.transition(primary, |entry| match &entry.state {
            PairState::FailedOver { target } if *target == from => Ok(PairState::FailingBack {
                from: from.clone(),
            }),
            state if state.is_transitioning() => Err(Error::FailoverInProgress {
                backend: primary.to_string(),
            }),
            state => Err(Error::InvalidRequest(format!(
                "pair {} changed to {} during failback",
                primary, state
            ))),
        })?;
        info!("Failing back {} from {}", primary, from);

        match driver.failover(&FailoverTarget::Default).await {
            Ok(()) => {
                let rebound = self.volumes.rebind_pair(primary, None, true).await;
                self.table
                    .settle(primary, PairState::Normal, Some(ActiveSide::Primary));
                let rebound = rebound + self.volumes.sync_active_backend(primary).await;
                info!("Failed back {} ({} volumes)", primary, rebound);
                Ok(FailoverOutcome {
                    primary: primary.to_string(),
                    active_backend_id: None,
                    volumes_rebound: rebound,
                })
            }
            Err(e) => {
                self.settle_failed(primary, PairState::FailedOver { target: from }, &e);
                Err(e)
            }
        }
    }

    /// A timed-out switch leaves the active side unknown
    fn settle_failed(&self, primary: &str, prior: PairState, err: &Error) {
        if err.outcome_unknown() {
            error!("Replication switch of {} has unknown outcome: {}", primary, err);
            self.table.settle(
                primary,
                PairState::Faulted {
                    reason: err.to_string(),
                },
                None,
            );
        } else {
            warn!("Replication switch of {} failed, back to {}: {}", primary, prior, err);
            self.table.settle(primary, prior, None);
        }
    }

    /// Resolve a faulted pair from the array's own view of its active side
    pub async fn reset_pair(&self, primary: &str) -> Result<PairEntry> {
        let entry = self
            .table
            .get(primary)
            .ok_or_else(|| Error::ReplicationNotConfigured {
                backend: primary.to_string(),
            })?;
        if !matches!(entry.state, PairState::Faulted { .. }) {
            return Err(Error::InvalidRequest(format!(
                "pair {} is {}, only faulted pairs are reset",
                primary, entry.state
            )));
        }

        let status = self.registry.driver(primary)?.replication_status().await?;
        let (state, side) = match status.active_target {
            FailoverTarget::Default => (PairState::Normal, ActiveSide::Primary),
            FailoverTarget::Secondary(target) => (
                PairState::FailedOver {
                    target: target.clone(),
                },
                ActiveSide::Secondary(target),
            ),
        };
        let active = match &side {
            ActiveSide::Primary => None,
            ActiveSide::Secondary(id) => Some(id.as_str()),
        };
        self.volumes.rebind_pair(primary, active, true).await;
        self.table.settle(primary, state, Some(side));
        self.volumes.sync_active_backend(primary).await;

        let entry = self
            .table
            .get(primary)
            .ok_or_else(|| Error::ReplicationNotConfigured {
                backend: primary.to_string(),
            })?;
        info!("Reset pair {} to {}", primary, entry.state);
        Ok(entry)
    }

    /// Pair states with live replication status from each primary
    pub async fn report(&self) -> Vec<PairReport> {
        let mut reports = Vec::new();
        for entry in self.table.list() {
            let status = match self.registry.driver(&entry.pair.primary) {
                Ok(driver) => driver.replication_status().await,
                Err(e) => Err(e),
            };
            let (array, error) = match status {
                Ok(status) => (Some(status), None),
                Err(e) => (None, Some(e.to_string())),
            };
            reports.push(PairReport { entry, array, error });
        }
        reports
    }
}
