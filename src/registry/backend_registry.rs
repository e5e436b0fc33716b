//! Backend Registry
//!
//! Holds every configured backend along with its last capability report and
//! health. Reads are concurrent; mutations take the write lock briefly and
//! never across a driver call.
//!
//! Capability reports are replaced whole as `Arc<CapabilityReport>`, so a
//! scheduler snapshot stays consistent while refreshes continue.

use super::events::RegistryEvent;
use crate::controlplane::backends::{DriverKind, GuardedDriver};
use crate::controlplane::config::ReplicationDevice;
use crate::domain::ports::CapabilityReport;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Refresh behaviour
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub refresh_interval: Duration,
    /// Consecutive failures before a backend is excluded
    pub unreachable_after: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            unreachable_after: 3,
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Backend health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum BackendHealth {
    Healthy,
    /// Still schedulable on its last report
    Degraded(String),
    /// Excluded from scheduling
    Unreachable(String),
}

impl BackendHealth {
    pub fn label(&self) -> &'static str {
        match self {
            BackendHealth::Healthy => "healthy",
            BackendHealth::Degraded(_) => "degraded",
            BackendHealth::Unreachable(_) => "unreachable",
        }
    }
}

/// One configured backend, as seen by readers
#[derive(Debug, Clone)]
pub struct Backend {
    pub name: String,
    pub kind: DriverKind,
    pub driver: GuardedDriver,
    pub replication: Option<ReplicationDevice>,
    pub report: Option<Arc<CapabilityReport>>,
    pub health: BackendHealth,
    pub consecutive_failures: u32,
    pub last_refresh: Option<DateTime<Utc>>,
    /// Driver calls in flight when this copy was taken
    pub in_flight: u64,
}

impl Backend {
    /// Eligible for placement
    pub fn is_schedulable(&self) -> bool {
        self.report.is_some() && !matches!(self.health, BackendHealth::Unreachable(_))
    }

    /// Load figure used by the weigher
    pub fn load(&self) -> u64 {
        self.report.as_ref().map(|r| r.total_volumes).unwrap_or(0) + self.in_flight
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Refresh counters
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub refreshes: AtomicU64,
    pub refresh_failures: AtomicU64,
}

/// Snapshot of [`RegistryStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub refreshes: u64,
    pub refresh_failures: u64,
}

impl RegistryStats {
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Backend Registry
// =============================================================================

/// Registry of configured backends
pub struct BackendRegistry {
    backends: RwLock<BTreeMap<String, Backend>>,
    config: RegistryConfig,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl BackendRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            backends: RwLock::new(BTreeMap::new()),
            config,
            stats: RegistryStats::default(),
            event_sender,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Register a backend and take its first capability report.
    ///
    /// A backend whose first report fails stays registered as degraded, with
    /// no report, until a refresh succeeds.
    pub async fn register(
        &self,
        name: impl Into<String>,
        kind: DriverKind,
        driver: GuardedDriver,
        replication: Option<ReplicationDevice>,
    ) -> Result<()> {
        let name = name.into();
        {
            let mut backends = self.backends.write();
            if backends.contains_key(&name) {
                return Err(Error::invalid_config(&name, "backend registered twice"));
            }
            backends.insert(
                name.clone(),
                Backend {
                    name: name.clone(),
                    kind,
                    driver,
                    replication,
                    report: None,
                    health: BackendHealth::Degraded("awaiting first capability report".into()),
                    consecutive_failures: 0,
                    last_refresh: None,
                    in_flight: 0,
                },
            );
        }

        let _ = self.event_sender.send(RegistryEvent::BackendRegistered {
            backend: name.clone(),
            driver: kind.to_string(),
        });
        info!("Registered backend {} ({})", name, kind);

        if let Err(e) = self.refresh(&name).await {
            warn!("Initial capability report for {} failed: {}", name, e);
        }
        Ok(())
    }

    /// Poll one backend and store its report
    pub async fn refresh(&self, name: &str) -> Result<Arc<CapabilityReport>> {
        let driver = self
            .backends
            .read()
            .get(name)
            .map(|b| b.driver.clone())
            .ok_or_else(|| Error::not_found("backend", name))?;

        self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
        let result = driver.get_capabilities().await;

        let mut backends = self.backends.write();
        let backend = backends
            .get_mut(name)
            .ok_or_else(|| Error::not_found("backend", name))?;

        match result {
            Ok(mut report) => {
                report.backend_name = name.to_string();
                let report = Arc::new(report);
                let was = std::mem::replace(&mut backend.health, BackendHealth::Healthy);
                let had_report = backend.report.is_some();
                backend.report = Some(report.clone());
                backend.consecutive_failures = 0;
                backend.last_refresh = Some(Utc::now());

                if was != BackendHealth::Healthy && had_report {
                    info!("Backend {} recovered", name);
                    let _ = self.event_sender.send(RegistryEvent::BackendRecovered {
                        backend: name.to_string(),
                    });
                }
                let _ = self.event_sender.send(RegistryEvent::CapabilitiesRefreshed {
                    backend: name.to_string(),
                    free_capacity_gb: report.free_capacity_gb,
                    total_volumes: report.total_volumes,
                });
                debug!(
                    "Refreshed {}: {:.1}/{:.1} GiB free, {} volumes",
                    name, report.free_capacity_gb, report.total_capacity_gb, report.total_volumes
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.refresh_failures.fetch_add(1, Ordering::Relaxed);
                backend.consecutive_failures += 1;
                let failures = backend.consecutive_failures;
                let reason = e.to_string();

                if failures >= self.config.unreachable_after {
                    if !matches!(backend.health, BackendHealth::Unreachable(_)) {
                        warn!(
                            "Backend {} unreachable after {} failed refreshes",
                            name, failures
                        );
                        let _ = self.event_sender.send(RegistryEvent::BackendUnreachable {
                            backend: name.to_string(),
                            failures,
                        });
                    }
                    backend.health = BackendHealth::Unreachable(reason);
                } else {
                    if backend.health == BackendHealth::Healthy {
                        let _ = self.event_sender.send(RegistryEvent::BackendDegraded {
                            backend: name.to_string(),
                            reason: reason.clone(),
                        });
                    }
                    backend.health = BackendHealth::Degraded(reason);
                }
                Err(e)
            }
        }
    }

    /// Refresh every backend concurrently
    pub async fn refresh_all(&self) -> usize {
        let names = self.names();
        let results =
            futures::future::join_all(names.iter().map(|name| self.refresh(name))).await;
        results.iter().filter(|r| r.is_ok()).count()
    }

    /// Mark a backend degraded; it stays schedulable
    pub fn mark_degraded(&self, name: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut backends = self.backends.write();
        let backend = backends
            .get_mut(name)
            .ok_or_else(|| Error::not_found("backend", name))?;
        if matches!(backend.health, BackendHealth::Unreachable(_)) {
            return Ok(());
        }
        warn!("Backend {} degraded: {}", name, reason);
        backend.health = BackendHealth::Degraded(reason.clone());
        let _ = self.event_sender.send(RegistryEvent::BackendDegraded {
            backend: name.to_string(),
            reason,
        });
        Ok(())
    }

    /// Get a backend by name
    pub fn get(&self, name: &str) -> Option<Backend> {
        self.backends.read().get(name).map(Self::copy_of)
    }

    /// Driver handle for a backend
    pub fn driver(&self, name: &str) -> Result<GuardedDriver> {
        self.backends
            .read()
            .get(name)
            .map(|b| b.driver.clone())
            .ok_or_else(|| Error::not_found("backend", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }

    /// All backends, ordered by name
    pub fn list_backends(&self) -> Vec<Backend> {
        self.backends.read().values().map(Self::copy_of).collect()
    }

    /// Scheduling input: every backend with its load captured now
    pub fn snapshot(&self) -> Vec<Backend> {
        self.list_backends()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    fn copy_of(backend: &Backend) -> Backend {
        let mut copy = backend.clone();
        copy.in_flight = backend.driver.load().in_flight();
        copy
    }

    /// Start one refresh task per backend
    pub fn spawn_refresh_loops(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.names()
            .into_iter()
            .map(|name| {
                let registry = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { registry.refresh_loop(name, cancel).await })
            })
            .collect()
    }

    async fn refresh_loop(&self, name: String, cancel: CancellationToken) {
        let period = self.config.refresh_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Refresh loop for {} every {:?}", name, period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Refresh loop for {} stopped", name);
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(&name).await {
                        debug!("Refresh of {} failed: {}", name, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{CallPolicy, DriverOp, InjectedFault, MemoryDriver};
    use assert_matches::assert_matches;

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(200),
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    async fn registry_with(
        name: &str,
        unreachable_after: u32,
    ) -> (Arc<BackendRegistry>, Arc<MemoryDriver>) {
        let registry = BackendRegistry::new(RegistryConfig {
            refresh_interval: Duration::from_millis(20),
            unreachable_after,
        });
        let driver = Arc::new(MemoryDriver::for_tests(name, 100));
        registry
            .register(
                name,
                DriverKind::Memory,
                GuardedDriver::new(name, driver.clone(), policy()),
                None,
            )
            .await
            .unwrap();
        (registry, driver)
    }

    #[tokio::test]
    async fn test_register_takes_first_report() {
        let (registry, _) = registry_with("pool-a", 3).await;
        let backend = registry.get("pool-a").unwrap();
        assert_eq!(backend.health, BackendHealth::Healthy);
        assert!(backend.is_schedulable());
        assert_eq!(backend.report.unwrap().total_capacity_gb, 100.0);
    }

    #[tokio::test]
    async fn test_failed_first_report_keeps_backend_registered() {
        let registry = BackendRegistry::new(RegistryConfig::default());
        let driver = Arc::new(MemoryDriver::for_tests("pool-a", 100));
        driver.set_unavailable(true);
        registry
            .register(
                "pool-a",
                DriverKind::Memory,
                GuardedDriver::new("pool-a", driver.clone(), policy()),
                None,
            )
            .await
            .unwrap();

        let backend = registry.get("pool-a").unwrap();
        assert_matches!(backend.health, BackendHealth::Degraded(_));
        assert!(!backend.is_schedulable(), "no report yet");

        driver.set_unavailable(false);
        registry.refresh("pool-a").await.unwrap();
        assert!(registry.get("pool-a").unwrap().is_schedulable());
    }

    #[tokio::test]
    async fn test_unreachable_after_consecutive_failures() {
        let (registry, driver) = registry_with("pool-a", 3).await;
        let mut events = registry.subscribe();
        driver.set_unavailable(true);

        for _ in 0..2 {
            assert!(registry.refresh("pool-a").await.is_err());
        }
        let backend = registry.get("pool-a").unwrap();
        assert_matches!(backend.health, BackendHealth::Degraded(_));
        assert!(backend.is_schedulable(), "degraded keeps its last report");

        assert!(registry.refresh("pool-a").await.is_err());
        let backend = registry.get("pool-a").unwrap();
        assert_matches!(backend.health, BackendHealth::Unreachable(_));
        assert!(!backend.is_schedulable());

        driver.set_unavailable(false);
        registry.refresh("pool-a").await.unwrap();
        assert_eq!(registry.get("pool-a").unwrap().health, BackendHealth::Healthy);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&RegistryEvent::BackendUnreachable {
            backend: "pool-a".into(),
            failures: 3
        }));
        assert!(seen.contains(&RegistryEvent::BackendRecovered {
            backend: "pool-a".into()
        }));
    }

    #[tokio::test]
    async fn test_refresh_loop_detects_outage_and_recovery() {
        let (registry, driver) = registry_with("pool-a", 2).await;
        let cancel = CancellationToken::new();
        let handles = registry.spawn_refresh_loops(cancel.clone());

        driver.set_unavailable(true);
        let mut unreachable = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !registry.get("pool-a").unwrap().is_schedulable() {
                unreachable = true;
                break;
            }
        }
        assert!(unreachable);

        driver.set_unavailable(false);
        let mut recovered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if registry.get("pool-a").unwrap().health == BackendHealth::Healthy {
                recovered = true;
                break;
            }
        }
        assert!(recovered);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_mark_degraded_and_duplicates() {
        let (registry, driver) = registry_with("pool-a", 3).await;
        registry.mark_degraded("pool-a", "operator maintenance").unwrap();
        let backend = registry.get("pool-a").unwrap();
        assert_eq!(
            backend.health,
            BackendHealth::Degraded("operator maintenance".into())
        );
        assert!(backend.is_schedulable());
        assert_matches!(
            registry.mark_degraded("missing", "x"),
            Err(Error::NotFound { .. })
        );

        let dup = registry
            .register(
                "pool-a",
                DriverKind::Memory,
                GuardedDriver::new("pool-a", driver, policy()),
                None,
            )
            .await;
        assert_matches!(dup, Err(Error::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn test_refresh_timeout_counts_as_failure() {
        let (registry, driver) = registry_with("pool-a", 1).await;
        driver.inject(DriverOp::Capabilities, InjectedFault::Hang);
        assert_matches!(
            registry.refresh("pool-a").await,
            Err(Error::DriverTimeout { .. })
        );
        assert!(!registry.get("pool-a").unwrap().is_schedulable());
    }
}
