//! Replication Pair Table
//!
//! Shared between the volume manager, which rejects work on pairs in
//! transition, and the failover coordinator, which drives the transitions.
//! All check-and-set updates happen under one write lock.

use crate::domain::model::{ActiveSide, ReplicationPair};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Failover state of a pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum PairState {
    Normal,
    FailingOver { target: String },
    FailedOver { target: String },
    FailingBack { from: String },
    /// A failover or failback timed out; the array side is unknown
    Faulted { reason: String },
}

impl PairState {
    /// A failover or failback is in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(self, PairState::FailingOver { .. } | PairState::FailingBack { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PairState::Normal => "normal",
            PairState::FailingOver { .. } => "failing-over",
            PairState::FailedOver { .. } => "failed-over",
            PairState::FailingBack { .. } => "failing-back",
            PairState::Faulted { .. } => "faulted",
        }
    }

    /// Volume operations on the pair's backend must wait.
    ///
    /// A faulted pair has an unknown active side until it is reset.
    pub fn blocks_operations(&self) -> bool {
        self.is_transitioning() || matches!(self, PairState::Faulted { .. })
    }
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A pair and its current state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairEntry {
    pub pair: ReplicationPair,
    pub state: PairState,
    pub last_transition: DateTime<Utc>,
}

/// Pairs keyed by primary backend name
#[derive(Debug, Default)]
pub struct ReplicationTable {
    pairs: RwLock<BTreeMap<String, PairEntry>>,
}

impl ReplicationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair; at most one per primary
    pub fn insert(&self, pair: ReplicationPair) -> Result<()> {
        let mut pairs = self.pairs.write();
        if pairs.contains_key(&pair.primary) {
            return Err(Error::invalid_config(
                &pair.primary,
                "backend already has a replication pair",
            ));
        }
        pairs.insert(
            pair.primary.clone(),
            PairEntry {
                pair,
                state: PairState::Normal,
                last_transition: Utc::now(),
            },
        );
        Ok(())
    }

    pub fn get(&self, primary: &str) -> Option<PairEntry> {
        self.pairs.read().get(primary).cloned()
    }

    pub fn list(&self) -> Vec<PairEntry> {
        self.pairs.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }

    pub fn is_in_transition(&self, backend: &str) -> bool {
        self.pairs
            .read()
            .get(backend)
            .map(|e| e.state.blocks_operations())
            .unwrap_or(false)
    }

    /// Primaries whose pair is in transition or faulted
    pub fn in_transition(&self) -> BTreeSet<String> {
        self.pairs
            .read()
            .iter()
            .filter(|(_, e)| e.state.blocks_operations())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Fail with `FailoverInProgress` if the backend's pair is in transition
    pub fn ensure_stable(&self, backend: &str) -> Result<()> {
        if self.is_in_transition(backend) {
            return Err(Error::FailoverInProgress {
                backend: backend.to_string(),
            });
        }
        Ok(())
    }

    /// Effective backend id for replicated volumes on `backend`
    pub fn active_backend_id(&self, backend: &str) -> Option<String> {
        self.pairs
            .read()
            .get(backend)
            .and_then(|e| e.pair.active_backend_id().map(String::from))
    }

    /// Atomically move a pair to the state `next` computes from the current one
    pub fn transition<F>(&self, primary: &str, next: F) -> Result<PairEntry>
    where
        F: FnOnce(&PairEntry) -> Result<PairState>,
    {
        let mut pairs = self.pairs.write();
        let entry = pairs
            .get_mut(primary)
            .ok_or_else(|| Error::ReplicationNotConfigured {
                backend: primary.to_string(),
            })?;
        entry.state = next(entry)?;
        entry.last_transition = Utc::now();
        Ok(entry.clone())
    }

    /// Set state and, when given, the active side
    pub fn settle(&self, primary: &str, state: PairState, active_side: Option<ActiveSide>) {
        if let Some(entry) = self.pairs.write().get_mut(primary) {
            entry.state = state;
            if let Some(side) = active_side {
                entry.pair.active_side = side;
            }
            entry.last_transition = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ReplicationMode;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn pair() -> ReplicationPair {
        ReplicationPair {
            primary: "pool-a".into(),
            secondary: "replica-1".into(),
            mode: ReplicationMode::Async,
            rpo: Duration::from_secs(300),
            active_side: ActiveSide::Primary,
        }
    }

    #[test]
    fn test_one_pair_per_backend() {
        let table = ReplicationTable::new();
        table.insert(pair()).unwrap();
        assert_matches!(table.insert(pair()), Err(Error::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_transition_guards() {
        let table = ReplicationTable::new();
        table.insert(pair()).unwrap();
        assert!(table.ensure_stable("pool-a").is_ok());

        table
            .transition("pool-a", |_| {
                Ok(PairState::FailingOver {
                    target: "replica-1".into(),
                })
            })
            .unwrap();
        assert!(table.is_in_transition("pool-a"));
        assert_matches!(
            table.ensure_stable("pool-a"),
            Err(Error::FailoverInProgress { .. })
        );
        assert!(table.in_transition().contains("pool-a"));

        table.settle(
            "pool-a",
            PairState::FailedOver {
                target: "replica-1".into(),
            },
            Some(ActiveSide::Secondary("replica-1".into())),
        );
        assert_eq!(table.active_backend_id("pool-a").as_deref(), Some("replica-1"));
        assert!(!table.is_in_transition("pool-a"));
    }

    #[test]
    fn test_unknown_pair() {
        let table = ReplicationTable::new();
        assert_matches!(
            table.transition("pool-x", |_| Ok(PairState::Normal)),
            Err(Error::ReplicationNotConfigured { .. })
        );
        assert!(table.ensure_stable("pool-x").is_ok());
    }
}
