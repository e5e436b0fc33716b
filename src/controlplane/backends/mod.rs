//! Volume Driver Backends
//!
//! Provides the drivers a backend section can name:
//! - memory: Simulated block array (iSCSI, FC, NVMe-oF)
//! - file: Sparse image files exported over NFS
//!
//! Every driver is wrapped in a [`GuardedDriver`] before the rest of the
//! core sees it.

pub mod file;
pub mod guard;
pub mod memory;

pub use file::{FileDriver, FileDriverConfig};
pub use guard::{BackendLoad, CallPolicy, GuardedDriver, LoadSnapshot};
pub use memory::{DriverOp, InjectedFault, MemoryDriver, MemoryDriverConfig};

use crate::controlplane::config::BackendSection;
use crate::domain::ports::VolumeDriverRef;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Registered driver variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Memory,
    File,
}

impl std::str::FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "simulated" => Ok(DriverKind::Memory),
            "file" | "nfs" => Ok(DriverKind::File),
            other => Err(format!("unknown volume_driver: {}", other)),
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Memory => write!(f, "memory"),
            DriverKind::File => write!(f, "file"),
        }
    }
}

/// Factory for creating drivers from configuration
pub struct BackendFactory;

impl BackendFactory {
    /// Build the driver a section names, validating its options
    pub async fn create(section: &BackendSection) -> Result<(DriverKind, VolumeDriverRef)> {
        let kind = section.driver_kind()?;
        let driver: VolumeDriverRef = match kind {
            DriverKind::Memory => {
                Arc::new(MemoryDriver::new(MemoryDriverConfig::from_section(section)?))
            }
            DriverKind::File => {
                Arc::new(FileDriver::new(FileDriverConfig::from_section(section)?).await?)
            }
        };
        Ok((kind, driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;

    fn section(pairs: &[(&str, &str)]) -> BackendSection {
        let options: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BackendSection::from_options("pool-a", options)
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("memory".parse::<DriverKind>().unwrap(), DriverKind::Memory);
        assert_eq!("NFS".parse::<DriverKind>().unwrap(), DriverKind::File);
        assert!("cinder.volume.drivers.lvm.LVMVolumeDriver"
            .parse::<DriverKind>()
            .is_err());
    }

    #[tokio::test]
    async fn test_factory_builds_memory_driver() {
        let section = section(&[
            ("volume_driver", "memory"),
            ("san_ip", "10.0.0.10"),
            ("san_login", "admin"),
            ("san_password", "secret"),
            ("target_protocol", "fc"),
            ("target_wwns", "500a098280feeba5,500a098290feeba5"),
        ]);
        let (kind, driver) = BackendFactory::create(&section).await.unwrap();
        assert_eq!(kind, DriverKind::Memory);
        assert_eq!(driver.protocol(), crate::domain::ports::Protocol::FibreChannel);
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_driver() {
        let section = section(&[("volume_driver", "vendor-x")]);
        assert_matches!(
            BackendFactory::create(&section).await.map(|_| ()),
            Err(Error::InvalidConfiguration { .. })
        );
    }

    #[tokio::test]
    async fn test_factory_rejects_block_protocol_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().display().to_string();
        let section = section(&[
            ("volume_driver", "file"),
            ("volumes_dir", path.as_str()),
            ("target_protocol", "iscsi"),
        ]);
        assert_matches!(
            BackendFactory::create(&section).await.map(|_| ()),
            Err(Error::InvalidConfiguration { .. })
        );
    }
}
