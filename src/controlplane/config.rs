//! Service Configuration
//!
//! Loads the multi-backend YAML configuration. Each backend section is a
//! flat bag of string options in the style of a `cinder.conf` backend
//! stanza; typed accessors validate values at backend construction time.

use crate::controlplane::backends::DriverKind;
use crate::domain::model::ReplicationMode;
use crate::domain::ports::Protocol;
use crate::error::{Error, Result};
use crate::volume::locks::LockMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Service Configuration
// =============================================================================

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Sections to load; empty means every section
    pub enabled_backends: Vec<String>,
    /// Upper bound for any single driver call
    pub driver_call_timeout_secs: u64,
    pub registry: RegistrySettings,
    pub scheduler: SchedulerSettings,
    pub workers: WorkerSettings,
    pub reconcile_interval_secs: u64,
    /// Queue or reject callers that find a volume locked
    pub lock_mode: LockMode,
    /// Raw backend sections keyed by section name
    pub backends: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled_backends: Vec::new(),
            driver_call_timeout_secs: 30,
            registry: RegistrySettings::default(),
            scheduler: SchedulerSettings::default(),
            workers: WorkerSettings::default(),
            reconcile_interval_secs: 120,
            lock_mode: LockMode::Queue,
            backends: BTreeMap::new(),
        }
    }
}

/// Capability refresh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub refresh_interval_secs: u64,
    /// Consecutive failed refreshes before a backend is unreachable
    pub unreachable_after: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            unreachable_after: 3,
        }
    }
}

/// Filter-weigher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub capacity_weight: f64,
    pub load_weight: f64,
    /// Backends tried for one create, including the first
    pub max_attempts: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            capacity_weight: 1.0,
            load_weight: 0.5,
            max_attempts: 2,
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub max_concurrent: usize,
    /// Attempts for idempotent driver calls
    pub driver_retry_attempts: u32,
    pub driver_retry_initial_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            driver_retry_attempts: 3,
            driver_retry_initial_ms: 200,
        }
    }
}

impl ServiceConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.driver_call_timeout_secs == 0 {
            return Err(Error::invalid_config("*", "driver_call_timeout_secs must be > 0"));
        }
        if self.registry.refresh_interval_secs == 0 {
            return Err(Error::invalid_config("*", "refresh_interval_secs must be > 0"));
        }
        if self.scheduler.max_attempts == 0 {
            return Err(Error::invalid_config("*", "scheduler.max_attempts must be > 0"));
        }
        if self.workers.max_concurrent == 0 {
            return Err(Error::invalid_config("*", "workers.max_concurrent must be > 0"));
        }
        for name in &self.enabled_backends {
            if !self.backends.contains_key(name) {
                return Err(Error::invalid_config(
                    name,
                    "listed in enabled_backends but has no section",
                ));
            }
        }
        Ok(())
    }

    pub fn driver_call_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_call_timeout_secs)
    }

    /// Enabled sections, converted to option bags.
    ///
    /// A section that cannot be converted is returned as an error entry so
    /// the caller can exclude it without aborting startup.
    pub fn sections(&self) -> Vec<(String, Result<BackendSection>)> {
        self.backends
            .iter()
            .filter(|(name, _)| {
                self.enabled_backends.is_empty() || self.enabled_backends.contains(name)
            })
            .map(|(name, raw)| (name.clone(), BackendSection::from_yaml(name, raw)))
            .collect()
    }
}

// =============================================================================
// Backend Section
// =============================================================================

const REPLICATION_DEVICE_KEY: &str = "replication_device";

/// One backend stanza as a flat option bag
#[derive(Clone, Default)]
pub struct BackendSection {
    pub name: String,
    options: BTreeMap<String, String>,
    replication_devices: Vec<String>,
}

impl std::fmt::Debug for BackendSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted: BTreeMap<&str, &str> = self
            .options
            .iter()
            .map(|(k, v)| {
                if k.contains("password") || k.contains("secret") {
                    (k.as_str(), "***")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("BackendSection")
            .field("name", &self.name)
            .field("options", &redacted)
            .field("replication_devices", &self.replication_devices.len())
            .finish()
    }
}

impl BackendSection {
    /// Build from string options, as read from an INI-style source
    pub fn from_options(name: impl Into<String>, mut options: BTreeMap<String, String>) -> Self {
        let replication_devices = options
            .remove(REPLICATION_DEVICE_KEY)
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect();
        Self {
            name: name.into(),
            options,
            replication_devices,
        }
    }

    fn from_yaml(name: &str, raw: &BTreeMap<String, serde_yaml::Value>) -> Result<Self> {
        let mut options = BTreeMap::new();
        let mut replication_devices = Vec::new();

        for (key, value) in raw {
            if key == REPLICATION_DEVICE_KEY {
                match value {
                    serde_yaml::Value::Sequence(items) => {
                        for item in items {
                            replication_devices.push(scalar_to_string(name, key, item)?);
                        }
                    }
                    other => replication_devices.push(scalar_to_string(name, key, other)?),
                }
                continue;
            }

            let rendered = match value {
                serde_yaml::Value::Sequence(items) => items
                    .iter()
                    .map(|v| scalar_to_string(name, key, v))
                    .collect::<Result<Vec<_>>>()?
                    .join(","),
                other => scalar_to_string(name, key, other)?,
            };
            options.insert(key.clone(), rendered);
        }

        Ok(Self {
            name: name.to_string(),
            options,
            replication_devices,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Required option
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::invalid_config(&self.name, format!("missing required option {}", key)))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_bool(v).ok_or_else(|| {
                Error::invalid_config(&self.name, format!("{} is not a boolean: {}", key, v))
            }),
        }
    }

    pub fn get_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.trim().parse::<f64>().map_err(|_| {
                Error::invalid_config(&self.name, format!("{} is not a number: {}", key, v))
            }),
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.trim().parse::<u64>().map_err(|_| {
                Error::invalid_config(&self.name, format!("{} is not an integer: {}", key, v))
            }),
        }
    }

    pub fn get_u32(&self, key: &str, default: u32) -> Result<u32> {
        let v = self.get_u64(key, u64::from(default))?;
        u32::try_from(v)
            .map_err(|_| Error::invalid_config(&self.name, format!("{} out of range: {}", key, v)))
    }

    /// Comma-separated list option
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Name advertised to the scheduler; defaults to the section name
    pub fn backend_name(&self) -> String {
        self.get("volume_backend_name")
            .map(String::from)
            .unwrap_or_else(|| self.name.clone())
    }

    pub fn driver_kind(&self) -> Result<DriverKind> {
        self.require("volume_driver")?
            .parse::<DriverKind>()
            .map_err(|e| Error::invalid_config(&self.name, e))
    }

    /// Protocol from `target_protocol`, if set
    pub fn protocol(&self) -> Result<Option<Protocol>> {
        self.get("target_protocol")
            .map(|v| v.parse::<Protocol>().map_err(|e| Error::invalid_config(&self.name, e)))
            .transpose()
    }

    /// The single replication target, if configured
    pub fn replication_device(&self) -> Result<Option<ReplicationDevice>> {
        match self.replication_devices.as_slice() {
            [] => Ok(None),
            [one] => ReplicationDevice::parse(&self.name, one).map(Some),
            many => Err(Error::invalid_config(
                &self.name,
                format!(
                    "at most one replication_device is supported, found {}",
                    many.len()
                ),
            )),
        }
    }
}

fn scalar_to_string(section: &str, key: &str, value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        _ => Err(Error::invalid_config(
            section,
            format!("option {} must be a scalar", key),
        )),
    }
}

/// Parse `True/False/yes/no/1/0`
pub fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Replication Device
// =============================================================================

/// Structured `replication_device` sub-config
#[derive(Clone, PartialEq)]
pub struct ReplicationDevice {
    pub backend_id: String,
    pub san_ip: String,
    pub san_login: String,
    pub san_password: String,
    pub mode: ReplicationMode,
    pub rpo: Duration,
    /// Vendor keys not recognized here
    pub extra: BTreeMap<String, String>,
}

impl std::fmt::Debug for ReplicationDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationDevice")
            .field("backend_id", &self.backend_id)
            .field("san_ip", &self.san_ip)
            .field("san_login", &self.san_login)
            .field("san_password", &"***")
            .field("mode", &self.mode)
            .field("rpo", &self.rpo)
            .finish()
    }
}

impl ReplicationDevice {
    /// Parse `backend_id:replica-1,san_ip:10.0.0.2,...`
    pub fn parse(section: &str, raw: &str) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once(':').ok_or_else(|| {
                Error::invalid_config(
                    section,
                    format!("replication_device entry '{}' is not key:value", pair),
                )
            })?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut take = |key: &str| {
            fields.remove(key).filter(|v| !v.is_empty()).ok_or_else(|| {
                Error::invalid_config(section, format!("replication_device missing {}", key))
            })
        };

        let backend_id = take("backend_id")?;
        let san_ip = take("san_ip")?;
        let san_login = take("san_login")?;
        let san_password = take("san_password")?;

        let mode = match fields.remove("replication_mode") {
            Some(m) => m
                .parse::<ReplicationMode>()
                .map_err(|e| Error::invalid_config(section, e))?,
            None => ReplicationMode::Async,
        };

        let rpo_secs = match fields.remove("rpo_secs") {
            Some(v) => v.parse::<u64>().map_err(|_| {
                Error::invalid_config(section, format!("rpo_secs is not an integer: {}", v))
            })?,
            None => match mode {
                ReplicationMode::Sync => 0,
                ReplicationMode::Async => 300,
            },
        };

        Ok(Self {
            backend_id,
            san_ip,
            san_login,
            san_password,
            mode,
            rpo: Duration::from_secs(rpo_secs),
            extra: fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SAMPLE: &str = r#"
enabled_backends: [pool-a, pool-b]
driver_call_timeout_secs: 10
registry:
  refresh_interval_secs: 30
  unreachable_after: 2
backends:
  pool-a:
    volume_driver: memory
    san_ip: 10.0.0.10
    san_login: admin
    san_password: secret
    san_thin_provision: true
    max_over_subscription_ratio: 20.0
    target_portals: [10.0.1.10:3260, 10.0.1.11:3260]
    replication_device: "backend_id:replica-1,san_ip:10.0.0.20,san_login:admin,san_password:s3cr3t,replication_mode:sync"
  pool-b:
    volume_driver: file
    volumes_dir: /var/lib/volumes
    total_capacity_gb: 500
  pool-c:
    volume_driver: memory
"#;

    #[test]
    fn test_parse_service_config() {
        let config = ServiceConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.driver_call_timeout(), Duration::from_secs(10));
        assert_eq!(config.registry.unreachable_after, 2);
        assert_eq!(config.scheduler.max_attempts, 2);

        let sections = config.sections();
        assert_eq!(sections.len(), 2, "pool-c is not enabled");

        let (_, pool_a) = &sections[0];
        let pool_a = pool_a.as_ref().unwrap();
        assert_eq!(pool_a.get("san_ip"), Some("10.0.0.10"));
        assert!(pool_a.get_bool("san_thin_provision", false).unwrap());
        assert_eq!(pool_a.get_f64("max_over_subscription_ratio", 1.0).unwrap(), 20.0);
        assert_eq!(
            pool_a.get_list("target_portals"),
            vec!["10.0.1.10:3260".to_string(), "10.0.1.11:3260".to_string()]
        );
        assert_eq!(pool_a.driver_kind().unwrap(), DriverKind::Memory);

        let device = pool_a.replication_device().unwrap().unwrap();
        assert_eq!(device.backend_id, "replica-1");
        assert_eq!(device.mode, ReplicationMode::Sync);
        assert_eq!(device.rpo, Duration::ZERO);
        assert!(!format!("{:?}", device).contains("s3cr3t"));
    }

    #[test]
    fn test_unknown_enabled_backend_rejected() {
        let text = "enabled_backends: [missing]\n";
        assert_matches!(
            ServiceConfig::from_yaml_str(text),
            Err(Error::InvalidConfiguration { .. })
        );
    }

    #[test]
    fn test_replication_device_validation() {
        let err = ReplicationDevice::parse("pool-a", "backend_id:replica-1,san_ip:10.0.0.2").unwrap_err();
        assert!(err.to_string().contains("san_login"));

        let err = ReplicationDevice::parse("pool-a", "backend_id").unwrap_err();
        assert_matches!(err, Error::InvalidConfiguration { .. });

        let device = ReplicationDevice::parse(
            "pool-a",
            "backend_id:r1,san_ip:10.0.0.2,san_login:u,san_password:p,rpo_secs:60,vendor_key:x",
        )
        .unwrap();
        assert_eq!(device.mode, ReplicationMode::Async);
        assert_eq!(device.rpo, Duration::from_secs(60));
        assert_eq!(device.extra.get("vendor_key").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_multiple_replication_devices_rejected() {
        let mut options = BTreeMap::new();
        options.insert("volume_driver".to_string(), "memory".to_string());
        let mut section = BackendSection::from_options("pool-a", options);
        section.replication_devices = vec![
            "backend_id:a,san_ip:1,san_login:u,san_password:p".into(),
            "backend_id:b,san_ip:2,san_login:u,san_password:p".into(),
        ];
        assert_matches!(
            section.replication_device(),
            Err(Error::InvalidConfiguration { .. })
        );
    }

    #[test]
    fn test_typed_accessor_errors() {
        let mut options = BTreeMap::new();
        options.insert("reserved_percentage".to_string(), "lots".to_string());
        options.insert("target_protocol".to_string(), "smb".to_string());
        options.insert("san_password".to_string(), "hunter2".to_string());
        let section = BackendSection::from_options("pool-x", options);
        assert!(section.get_u32("reserved_percentage", 0).is_err());
        assert!(section.protocol().is_err());
        assert!(section.require("san_ip").is_err());
        assert!(section.driver_kind().is_err());
        assert!(!format!("{:?}", section).contains("hunter2"));
    }
}
