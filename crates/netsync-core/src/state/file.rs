// # File Store
//
// File-based implementation of ProvisioningStore with crash recovery.
//
// ## Purpose
//
// Keeps subnets, pools, services, sync jobs, router checkpoints and the
// audit log across daemon restarts, so pending jobs resume after a crash.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good state
// - Recovery: Falls back to backup if corruption detected
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "tables": {
//     "sequence": 42,
//     "subnets": [...],
//     "addresses": [...],
//     "services": [...],
//     "jobs": [...],
//     "checkpoints": [...],
//     "audit": [...]
//   }
// }
// ```

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use super::tables::{Tables, TablesSnapshot};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::{
    AddressId, AddressStatus, AuditLogEntry, CustomerService, EntityRef, IpAddress, JobId,
    RouterCheckpoint, RouterId, ServiceId, ServiceStatus, Subnet, SubnetId, SyncJob, SyncStatus,
};
use crate::traits::{JobFilter, ProvisioningStore, ServiceFilter, StoreFactory};

/// State file format version
/// Used for future migration if format changes
const STATE_FILE_VERSION: &str = "1.0";

/// File-based store with crash recovery
///
/// Every mutation is applied to a copy of the tables, written to disk, and
/// only then published. A failed write leaves the visible state untouched.
///
/// # Example
///
/// ```rust,no_run
/// use netsync_core::state::FileStore;
/// use netsync_core::traits::ProvisioningStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStore::new("/var/lib/netsync/state.json").await?;
///     let subnets = store.list_subnets().await?;
///     println!("{} subnets", subnets.len());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    tables: Arc<RwLock<Tables>>,
    /// Serializes mutations from copy through rename to publish
    write_lock: Mutex<()>,
}

/// Serializable state file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StateFileFormat {
    version: String,
    tables: TablesSnapshot,
}

impl FileStore {
    /// Create or load a file store
    ///
    /// This will:
    /// 1. Try to load existing state file
    /// 2. If corruption detected, try to load from backup
    /// 3. If both fail, start with empty state
    /// 4. Create parent directories if needed
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let snapshot = Self::load_state_with_recovery(&path).await?;

        Ok(Self {
            path,
            tables: Arc::new(RwLock::new(Tables::from_snapshot(snapshot))),
            write_lock: Mutex::new(()),
        })
    }

    /// Load state from file with automatic recovery
    ///
    /// Recovery strategy:
    /// 1. Try to load main state file
    /// 2. If JSON parse error, try loading backup
    /// 3. If backup also fails, start with empty state
    async fn load_state_with_recovery(path: &Path) -> Result<TablesSnapshot> {
        match Self::load_state(path).await {
            Ok(snapshot) => {
                tracing::debug!(
                    "Loaded state from file: {} subnets, {} jobs",
                    snapshot.subnets.len(),
                    snapshot.jobs.len()
                );
                Ok(snapshot)
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "State file appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = Self::backup_path(path);
                if !backup_path.exists() {
                    tracing::warn!("No backup file found. Starting with empty state.");
                    return Ok(TablesSnapshot::default());
                }

                match Self::load_state(&backup_path).await {
                    Ok(snapshot) => {
                        tracing::info!(
                            "Recovered state from backup: {} subnets, {} jobs",
                            snapshot.subnets.len(),
                            snapshot.jobs.len()
                        );
                        if let Err(restore_err) =
                            Self::restore_from_backup(path, &backup_path).await
                        {
                            tracing::error!(
                                "Failed to restore state file from backup: {}",
                                restore_err
                            );
                        }
                        Ok(snapshot)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also corrupted: {}. Starting with empty state.",
                            backup_err
                        );
                        Ok(TablesSnapshot::default())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Load state from file
    async fn load_state(path: &Path) -> Result<TablesSnapshot> {
        if !path.exists() {
            tracing::debug!("State file does not exist: {}", path.display());
            return Ok(TablesSnapshot::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            ))
        })?;

        let state_file: StateFileFormat = serde_json::from_str(&content)?;

        if state_file.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file version mismatch: expected {}, got {}. \
                Attempting to load anyway.",
                STATE_FILE_VERSION,
                state_file.version
            );
        }

        Ok(state_file.tables)
    }

    /// Write tables to file atomically
    ///
    /// Callers hold `write_lock`.
    async fn write_state(&self, tables: &Tables) -> Result<()> {
        let state_file = StateFileFormat {
            version: STATE_FILE_VERSION.to_string(),
            tables: tables.snapshot(),
        };
        let json = serde_json::to_string_pretty(&state_file)
            .map_err(|e| Error::store(format!("Failed to serialize state: {}", e)))?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            file.sync_all().await.map_err(|e| {
                Error::store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("State written to file: {}", self.path.display());
        Ok(())
    }

    /// Apply a mutation to a copy of the tables, persist it, then publish
    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _writer = self.write_lock.lock().await;

        let mut next = self.tables.read().await.clone();
        let value = f(&mut next)?;
        self.write_state(&next).await?;
        *self.tables.write().await = next;
        Ok(value)
    }

    /// Like [`mutate`](Self::mutate) but skips the write when nothing changed
    async fn mutate_if(&self, f: impl FnOnce(&mut Tables) -> Result<bool>) -> Result<bool> {
        let _writer = self.write_lock.lock().await;

        let mut next = self.tables.read().await.clone();
        if !f(&mut next)? {
            return Ok(false);
        }
        self.write_state(&next).await?;
        *self.tables.write().await = next;
        Ok(true)
    }

    /// Restore state file from backup
    async fn restore_from_backup(path: &Path, backup_path: &Path) -> Result<()> {
        fs::copy(backup_path, path).await.map_err(|e| {
            Error::store(format!(
                "Failed to restore from backup {} to {}: {}",
                backup_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!("Restored state file from backup");
        Ok(())
    }

    /// Get path to temporary file for atomic writes
    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    /// Get path to backup file
    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl ProvisioningStore for FileStore {
    async fn reserve_ids(&self, count: u64) -> Result<u64> {
        self.mutate(|t| Ok(t.reserve_ids(count))).await
    }

    async fn insert_subnet(&self, subnet: &Subnet, addresses: &[IpAddress]) -> Result<()> {
        self.mutate(|t| t.insert_subnet(subnet, addresses)).await
    }

    async fn update_subnet(&self, subnet: &Subnet, addresses: Option<&[IpAddress]>) -> Result<()> {
        self.mutate(|t| t.update_subnet(subnet, addresses)).await
    }

    async fn delete_subnet(&self, id: SubnetId) -> Result<()> {
        self.mutate(|t| t.delete_subnet(id)).await
    }

    async fn get_subnet(&self, id: SubnetId) -> Result<Option<Subnet>> {
        Ok(self.tables.read().await.get_subnet(id))
    }

    async fn list_subnets(&self) -> Result<Vec<Subnet>> {
        Ok(self.tables.read().await.list_subnets())
    }

    async fn get_address(&self, id: AddressId) -> Result<Option<IpAddress>> {
        Ok(self.tables.read().await.get_address(id))
    }

    async fn find_address(&self, address: Ipv4Addr) -> Result<Option<IpAddress>> {
        Ok(self.tables.read().await.find_address(address))
    }

    async fn list_addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>> {
        Ok(self.tables.read().await.list_addresses(subnet))
    }

    async fn update_address(&self, expected: AddressStatus, address: &IpAddress) -> Result<bool> {
        self.mutate_if(|t| t.update_address(expected, address)).await
    }

    async fn insert_service(&self, service: &CustomerService) -> Result<()> {
        self.mutate(|t| t.insert_service(service)).await
    }

    async fn get_service(&self, id: ServiceId) -> Result<Option<CustomerService>> {
        Ok(self.tables.read().await.get_service(id))
    }

    async fn list_services(&self, filter: &ServiceFilter) -> Result<Vec<CustomerService>> {
        Ok(self.tables.read().await.list_services(filter))
    }

    async fn update_service(
        &self,
        expected: ServiceStatus,
        service: &CustomerService,
    ) -> Result<bool> {
        self.mutate_if(|t| t.update_service(expected, service)).await
    }

    async fn insert_job(&self, job: &SyncJob) -> Result<()> {
        self.mutate(|t| t.insert_job(job)).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        Ok(self.tables.read().await.get_job(id))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        Ok(self.tables.read().await.list_jobs(filter))
    }

    async fn update_job(&self, expected: SyncStatus, job: &SyncJob) -> Result<bool> {
        self.mutate_if(|t| t.update_job(expected, job)).await
    }

    async fn get_checkpoint(&self, router: RouterId) -> Result<Option<RouterCheckpoint>> {
        Ok(self.tables.read().await.get_checkpoint(router))
    }

    async fn put_checkpoint(&self, checkpoint: &RouterCheckpoint) -> Result<()> {
        self.mutate(|t| {
            t.put_checkpoint(checkpoint);
            Ok(())
        })
        .await
    }

    async fn list_checkpoints(&self) -> Result<Vec<RouterCheckpoint>> {
        Ok(self.tables.read().await.list_checkpoints())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.mutate(|t| {
            t.append_audit(entry);
            Ok(())
        })
        .await
    }

    async fn list_audit(&self, entity: Option<EntityRef>) -> Result<Vec<AuditLogEntry>> {
        Ok(self.tables.read().await.list_audit(entity))
    }

    async fn flush(&self) -> Result<()> {
        // Mutations are on disk before they become visible.
        Ok(())
    }
}

/// Factory for the `file` store type
pub struct FileStoreFactory;

#[async_trait]
impl StoreFactory for FileStoreFactory {
    async fn create(&self, config: &StoreConfig) -> Result<Arc<dyn ProvisioningStore>> {
        match config {
            StoreConfig::File { path } => Ok(Arc::new(FileStore::new(path).await?)),
            other => Err(Error::config(format!(
                "file store factory cannot build a '{}' store",
                other.type_name()
            ))),
        }
    }
}
