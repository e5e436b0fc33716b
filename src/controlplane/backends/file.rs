//! File-Backed NFS Driver
//!
//! Stores each volume as a sparse image file under `volumes_dir` and exports
//! it over NFS. Snapshots and clones are sparse copies; extend grows the
//! file with `set_len`.

use crate::controlplane::config::BackendSection;
use crate::domain::ports::{
    CapabilityReport, ConnectionInfo, FailoverTarget, HostDescriptor, Protocol,
    ReplicationStatus, SnapshotHandle, VolumeDriver, VolumeHandle, VolumeInfo, VolumeSpec,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

const GIB: u64 = 1024 * 1024 * 1024;
const COPY_CHUNK: usize = 1024 * 1024;
const DRIVER_VERSION: &str = "1.1.0";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the file driver
#[derive(Debug, Clone)]
pub struct FileDriverConfig {
    pub backend_name: String,
    pub volumes_dir: PathBuf,
    pub total_capacity_gb: u64,
    /// `server` part of the export path
    pub nfs_server: String,
    pub mount_options: Option<String>,
    /// Create sparse images instead of preallocating
    pub sparse: bool,
    pub max_over_subscription_ratio: f64,
    pub reserved_percentage: u32,
}

impl FileDriverConfig {
    pub fn new(backend_name: impl Into<String>, volumes_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend_name: backend_name.into(),
            volumes_dir: volumes_dir.into(),
            total_capacity_gb: 100,
            nfs_server: "127.0.0.1".to_string(),
            mount_options: None,
            sparse: true,
            max_over_subscription_ratio: 1.0,
            reserved_percentage: 0,
        }
    }

    pub fn from_section(section: &BackendSection) -> Result<Self> {
        let volumes_dir = PathBuf::from(section.require("volumes_dir")?);
        if !volumes_dir.is_absolute() {
            return Err(Error::invalid_config(
                &section.name,
                "volumes_dir must be an absolute path",
            ));
        }
        if let Some(protocol) = section.protocol()? {
            if protocol != Protocol::Nfs {
                return Err(Error::invalid_config(
                    &section.name,
                    format!("file driver cannot export over {}", protocol),
                ));
            }
        }
        let total_capacity_gb = section.get_u64("total_capacity_gb", 100)?;
        if total_capacity_gb == 0 {
            return Err(Error::invalid_config(&section.name, "total_capacity_gb must be > 0"));
        }
        let reserved_percentage = section.get_u32("reserved_percentage", 0)?;
        if reserved_percentage > 100 {
            return Err(Error::invalid_config(
                &section.name,
                "reserved_percentage must be within 0..=100",
            ));
        }

        Ok(Self {
            backend_name: section.backend_name(),
            volumes_dir,
            total_capacity_gb,
            nfs_server: section
                .get("nfs_server")
                .or_else(|| section.get("target_ip_address"))
                .unwrap_or("127.0.0.1")
                .to_string(),
            mount_options: section.get("nfs_mount_options").map(String::from),
            sparse: section.get_bool("nfs_sparsed_volumes", true)?,
            max_over_subscription_ratio: section.get_f64("max_over_subscription_ratio", 1.0)?,
            reserved_percentage,
        })
    }
}

// =============================================================================
// File Driver
// =============================================================================

/// Sparse image files exported over NFS
#[derive(Debug)]
pub struct FileDriver {
    config: FileDriverConfig,
    /// volume id -> hosts with an active export
    exports: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl FileDriver {
    /// Create the driver, making sure the volumes directory exists
    pub async fn new(config: FileDriverConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.volumes_dir).await?;
        info!(
            "Initialized file backend {} at {}",
            config.backend_name,
            config.volumes_dir.display()
        );
        Ok(Self {
            config,
            exports: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &FileDriverConfig {
        &self.config
    }

    fn volume_path(&self, volume_id: &str) -> Result<PathBuf> {
        check_id(volume_id)?;
        Ok(self.config.volumes_dir.join(format!("volume-{}.img", volume_id)))
    }

    fn snapshot_path(&self, volume_id: &str, snapshot_id: &str) -> Result<PathBuf> {
        check_id(volume_id)?;
        check_id(snapshot_id)?;
        Ok(self
            .config
            .volumes_dir
            .join(format!("volume-{}.snap-{}.img", volume_id, snapshot_id)))
    }

    fn handle(&self, volume_id: &str, path: &Path) -> VolumeHandle {
        VolumeHandle {
            provider_id: volume_id.to_string(),
            provider_location: Some(path.display().to_string()),
        }
    }

    async fn snapshot_count(&self, volume_id: &str) -> Result<usize> {
        let prefix = format!("volume-{}.snap-", volume_id);
        let mut count = 0;
        let mut dir = tokio::fs::read_dir(&self.config.volumes_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// (volume count, provisioned GiB, allocated GiB)
    async fn usage(&self) -> Result<(u64, f64, f64)> {
        let mut volumes = 0u64;
        let mut provisioned = 0u64;
        let mut allocated = 0u64;
        let mut dir = tokio::fs::read_dir(&self.config.volumes_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("volume-") || !name.ends_with(".img") {
                continue;
            }
            let metadata = entry.metadata().await?;
            provisioned += metadata.len();
            allocated += allocated_bytes(&metadata);
            if !name.contains(".snap-") {
                volumes += 1;
            }
        }
        Ok((
            volumes,
            provisioned as f64 / GIB as f64,
            allocated as f64 / GIB as f64,
        ))
    }

    async fn check_capacity(&self, size_gb: u64) -> Result<()> {
        let (_, provisioned, allocated) = self.usage().await?;
        let total = self.config.total_capacity_gb as f64;
        let (limit, used) = if self.config.sparse {
            (total * self.config.max_over_subscription_ratio, provisioned)
        } else {
            (total, allocated)
        };
        if used + size_gb as f64 > limit {
            return Err(Error::InsufficientCapacity {
                backend: self.config.backend_name.clone(),
                requested_gb: size_gb,
                available_gb: (limit - used).max(0.0),
            });
        }
        Ok(())
    }

    /// Create a fresh image of `size_gb`, refusing to overwrite
    async fn create_image(&self, path: &Path, size_gb: u64) -> Result<tokio::fs::File> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| self.io_failure("create_volume", e))?;
        let sized = match size_gb.checked_mul(GIB) {
            Some(bytes) => file.set_len(bytes).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} GiB overflows the image length", size_gb),
            )),
        };
        if let Err(e) = sized {
            discard_image(path).await;
            return Err(self.io_failure("create_volume", e));
        }
        Ok(file)
    }

    /// Copy `src` into a new image of `size_gb`, skipping zero chunks
    async fn sparse_copy(&self, src: &Path, dst: &Path, size_gb: u64) -> Result<()> {
        let mut input = tokio::fs::File::open(src).await.map_err(map_missing(src))?;
        let mut output = self.create_image(dst, size_gb).await?;
        if let Err(e) = copy_nonzero(&mut input, &mut output).await {
            drop(output);
            discard_image(dst).await;
            return Err(e);
        }
        Ok(())
    }

    fn io_failure(&self, operation: &str, e: std::io::Error) -> Error {
        Error::BackendOperationFailed {
            backend: self.config.backend_name.clone(),
            operation: operation.to_string(),
            reason: e.to_string(),
        }
    }
}

async fn copy_nonzero(input: &mut tokio::fs::File, output: &mut tokio::fs::File) -> Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if buf[..n].iter().any(|b| *b != 0) {
            output.seek(SeekFrom::Start(offset)).await?;
            output.write_all(&buf[..n]).await?;
        }
        offset += n as u64;
    }
    output.flush().await?;
    output.sync_all().await?;
    Ok(())
}

/// Remove a half-built image so the id can be created again
async fn discard_image(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove partial image {}: {}", path.display(), e);
    }
}

fn check_id(id: &str) -> Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidRequest(format!("invalid identifier: {:?}", id)));
    }
    Ok(())
}

fn map_missing(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found("image", path.display().to_string())
        } else {
            Error::Io(e)
        }
    }
}

#[cfg(unix)]
fn allocated_bytes(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(metadata: &std::fs::Metadata) -> u64 {
    metadata.len()
}

#[async_trait]
impl VolumeDriver for FileDriver {
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeHandle> {
        if spec.size_gb == 0 {
            return Err(Error::InvalidRequest("volume size must be > 0".into()));
        }
        let path = self.volume_path(&spec.volume_id)?;
        self.check_capacity(spec.size_gb).await?;
        self.create_image(&path, spec.size_gb).await?;
        debug!("Created image {} ({} GiB)", path.display(), spec.size_gb);
        Ok(self.handle(&spec.volume_id, &path))
    }

    async fn delete_volume(&self, handle: &VolumeHandle) -> Result<()> {
        let path = self.volume_path(&handle.provider_id)?;
        let snapshots = self.snapshot_count(&handle.provider_id).await?;
        if snapshots > 0 {
            return Err(Error::InUse {
                kind: "volume".into(),
                id: handle.provider_id.clone(),
                reason: format!("{} snapshot images remain", snapshots),
            });
        }
        tokio::fs::remove_file(&path).await.map_err(map_missing(&path))?;
        self.exports.lock().remove(&handle.provider_id);
        debug!("Deleted image {}", path.display());
        Ok(())
    }

    async fn create_snapshot(
        &self,
        handle: &VolumeHandle,
        snapshot_id: &str,
    ) -> Result<SnapshotHandle> {
        let src = self.volume_path(&handle.provider_id)?;
        let dst = self.snapshot_path(&handle.provider_id, snapshot_id)?;
        let metadata = tokio::fs::metadata(&src).await.map_err(map_missing(&src))?;
        let size_gb = metadata.len().div_ceil(GIB);

        self.sparse_copy(&src, &dst, size_gb).await?;
        let copied = tokio::fs::metadata(&dst).await?;

        Ok(SnapshotHandle {
            provider_id: snapshot_id.to_string(),
            volume_provider_id: handle.provider_id.clone(),
            size_gb,
            consumption_ratio: allocated_bytes(&copied) as f64 / metadata.len().max(1) as f64,
        })
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
        let path = self.snapshot_path(&snapshot.volume_provider_id, &snapshot.provider_id)?;
        tokio::fs::remove_file(&path).await.map_err(map_missing(&path))
    }

    async fn create_from_snapshot(
        &self,
        snapshot: &SnapshotHandle,
        spec: &VolumeSpec,
    ) -> Result<VolumeHandle> {
        if spec.size_gb < snapshot.size_gb {
            return Err(Error::InvalidRequest(format!(
                "volume size {} GiB smaller than snapshot {} GiB",
                spec.size_gb, snapshot.size_gb
            )));
        }
        let src = self.snapshot_path(&snapshot.volume_provider_id, &snapshot.provider_id)?;
        let dst = self.volume_path(&spec.volume_id)?;
        self.check_capacity(spec.size_gb).await?;
        self.sparse_copy(&src, &dst, spec.size_gb).await?;
        Ok(self.handle(&spec.volume_id, &dst))
    }

    async fn clone_volume(
        &self,
        source: &VolumeHandle,
        spec: &VolumeSpec,
    ) -> Result<VolumeHandle> {
        let src = self.volume_path(&source.provider_id)?;
        let dst = self.volume_path(&spec.volume_id)?;
        let metadata = tokio::fs::metadata(&src).await.map_err(map_missing(&src))?;
        if spec.size_gb * GIB < metadata.len() {
            return Err(Error::InvalidRequest(format!(
                "clone size {} GiB smaller than source",
                spec.size_gb
            )));
        }
        self.check_capacity(spec.size_gb).await?;
        self.sparse_copy(&src, &dst, spec.size_gb).await?;
        Ok(self.handle(&spec.volume_id, &dst))
    }

    async fn extend(&self, handle: &VolumeHandle, new_size_gb: u64) -> Result<()> {
        let path = self.volume_path(&handle.provider_id)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(map_missing(&path))?;
        let current = metadata.len().div_ceil(GIB);
        if new_size_gb <= current {
            return Err(Error::InvalidRequest(format!(
                "new size {} GiB must exceed current {} GiB",
                new_size_gb, current
            )));
        }
        self.check_capacity(new_size_gb - current).await?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(map_missing(&path))?;
        file.set_len(new_size_gb * GIB).await?;
        Ok(())
    }

    async fn attach(
        &self,
        handle: &VolumeHandle,
        host: &HostDescriptor,
    ) -> Result<ConnectionInfo> {
        let path = self.volume_path(&handle.provider_id)?;
        tokio::fs::metadata(&path).await.map_err(map_missing(&path))?;
        self.exports
            .lock()
            .entry(handle.provider_id.clone())
            .or_default()
            .insert(host.host.clone());

        Ok(ConnectionInfo::Nfs {
            export: format!("{}:{}", self.config.nfs_server, path.display()),
            mount_options: self.config.mount_options.clone(),
        })
    }

    async fn detach(&self, handle: &VolumeHandle, host: &HostDescriptor) -> Result<()> {
        let mut exports = self.exports.lock();
        if let Some(hosts) = exports.get_mut(&handle.provider_id) {
            hosts.remove(&host.host);
            if hosts.is_empty() {
                exports.remove(&handle.provider_id);
            }
        }
        Ok(())
    }

    async fn get_capabilities(&self) -> Result<CapabilityReport> {
        let (volumes, provisioned, allocated) = self.usage().await?;
        let total = self.config.total_capacity_gb as f64;

        Ok(CapabilityReport {
            backend_name: self.config.backend_name.clone(),
            vendor_name: "Generic NFS".to_string(),
            driver_version: DRIVER_VERSION.to_string(),
            storage_protocol: Protocol::Nfs,
            pool_name: Some(self.config.volumes_dir.display().to_string()),
            total_capacity_gb: total,
            free_capacity_gb: (total - allocated).max(0.0),
            provisioned_capacity_gb: provisioned,
            reserved_percentage: self.config.reserved_percentage,
            max_over_subscription_ratio: self.config.max_over_subscription_ratio,
            thin_provisioning_support: self.config.sparse,
            thick_provisioning_support: !self.config.sparse,
            compression_support: false,
            qos_support: false,
            multiattach: true,
            replication_enabled: false,
            replication_targets: Vec::new(),
            supports_extend_with_snapshots: true,
            total_volumes: volumes,
            extra: BTreeMap::new(),
            reported_at: chrono::Utc::now(),
        })
    }

    async fn failover(&self, _target: &FailoverTarget) -> Result<()> {
        Err(Error::ReplicationNotConfigured {
            backend: self.config.backend_name.clone(),
        })
    }

    async fn replication_status(&self) -> Result<ReplicationStatus> {
        Err(Error::ReplicationNotConfigured {
            backend: self.config.backend_name.clone(),
        })
    }

    async fn query_volume(&self, handle: &VolumeHandle) -> Result<Option<VolumeInfo>> {
        let path = self.volume_path(&handle.provider_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => Ok(Some(VolumeInfo {
                provider_id: handle.provider_id.clone(),
                size_gb: metadata.len().div_ceil(GIB),
                exported_to: self
                    .exports
                    .lock()
                    .get(&handle.provider_id)
                    .map(|hosts| hosts.iter().cloned().collect())
                    .unwrap_or_default(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn query_snapshot(&self, snapshot: &SnapshotHandle) -> Result<bool> {
        let path = self.snapshot_path(&snapshot.volume_provider_id, &snapshot.provider_id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Nfs
    }

    fn driver_name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn spec(id: &str, size_gb: u64) -> VolumeSpec {
        VolumeSpec {
            volume_id: id.into(),
            name: id.into(),
            size_gb,
            thin: true,
            extra_specs: Default::default(),
        }
    }

    async fn driver(dir: &tempfile::TempDir, total_gb: u64) -> FileDriver {
        let mut config = FileDriverConfig::new("nfs-1", dir.path());
        config.total_capacity_gb = total_gb;
        FileDriver::new(config).await.unwrap()
    }

    async fn write_at(handle: &VolumeHandle, offset: u64, data: &[u8]) {
        let path = handle.provider_location.as_ref().unwrap();
        let mut file = tokio::fs::OpenOptions::new().write(true).open(path).await.unwrap();
        file.seek(SeekFrom::Start(offset)).await.unwrap();
        file.write_all(data).await.unwrap();
        file.sync_all().await.unwrap();
    }

    async fn read_at(handle: &VolumeHandle, offset: u64, len: usize) -> Vec<u8> {
        let path = handle.provider_location.as_ref().unwrap();
        let mut file = tokio::fs::File::open(path).await.unwrap();
        file.seek(SeekFrom::Start(offset)).await.unwrap();
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_create_extend_delete() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir, 10).await;

        let handle = driver.create_volume(&spec("v1", 1)).await.unwrap();
        let info = driver.query_volume(&handle).await.unwrap().unwrap();
        assert_eq!(info.size_gb, 1);

        driver.extend(&handle, 2).await.unwrap();
        let info = driver.query_volume(&handle).await.unwrap().unwrap();
        assert_eq!(info.size_gb, 2);

        driver.delete_volume(&handle).await.unwrap();
        assert!(driver.query_volume(&handle).await.unwrap().is_none());
        assert_matches!(
            driver.delete_volume(&handle).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_failed_sizing_leaves_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir, 10).await;
        let path = driver.volume_path("v1").unwrap();

        // Past the largest file offset the platform can express
        let result = driver.create_image(&path, 9_000_000_000).await;
        assert_matches!(result, Err(Error::BackendOperationFailed { .. }));
        assert!(!path.exists());
        assert_matches!(
            driver.create_image(&path, u64::MAX).await,
            Err(Error::BackendOperationFailed { .. })
        );
        assert!(!path.exists());

        let handle = driver.create_volume(&spec("v1", 1)).await.unwrap();
        let info = driver.query_volume(&handle).await.unwrap().unwrap();
        assert_eq!(info.size_gb, 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir, 10).await;

        let handle = driver.create_volume(&spec("v1", 1)).await.unwrap();
        write_at(&handle, 4096, b"block payload").await;

        let snapshot = driver.create_snapshot(&handle, "s1").await.unwrap();
        write_at(&handle, 4096, b"overwritten!!").await;

        let restored = driver
            .create_from_snapshot(&snapshot, &spec("v2", 1))
            .await
            .unwrap();
        assert_eq!(read_at(&restored, 4096, 13).await, b"block payload");

        assert_matches!(
            driver.delete_volume(&handle).await,
            Err(Error::InUse { .. })
        );
        driver.delete_snapshot(&snapshot).await.unwrap();
        assert!(!driver.query_snapshot(&snapshot).await.unwrap());
        driver.delete_volume(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir, 2).await;
        driver.create_volume(&spec("v1", 2)).await.unwrap();
        assert_matches!(
            driver.create_volume(&spec("v2", 1)).await,
            Err(Error::InsufficientCapacity { .. })
        );
        let caps = driver.get_capabilities().await.unwrap();
        assert_eq!(caps.total_volumes, 1);
        assert_eq!(caps.provisioned_capacity_gb, 2.0);
    }

    #[tokio::test]
    async fn test_nfs_attach_and_rejects_bad_ids() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(&dir, 10).await;
        let handle = driver.create_volume(&spec("v1", 1)).await.unwrap();
        let host = HostDescriptor::iscsi("compute-1", "iqn.1994-05.com.redhat:c1");

        let info = driver.attach(&handle, &host).await.unwrap();
        assert_eq!(info.protocol(), Protocol::Nfs);
        driver.detach(&handle, &host).await.unwrap();
        driver.detach(&handle, &host).await.unwrap();

        assert_matches!(
            driver.create_volume(&spec("../escape", 1)).await,
            Err(Error::InvalidRequest(_))
        );
    }
}
