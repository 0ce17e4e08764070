// # Provisioning Store Trait
//
// Defines the persistence interface for subnets, pool addresses, customer
// services, sync jobs, router checkpoints and the audit log.
//
// ## Consistency Model
//
// The core never holds a transaction open across components. Every mutation
// of a live row goes through a conditional update that only applies when the
// stored status still matches what the caller read (optimistic
// read-modify-write). A `false` return means another writer won the race.
//
// ## Implementations
//
// - In-memory: `MemoryStore`
// - File-based: `FileStore` (JSON document, atomic rename)
// - Future: SQL backends with row-level conditional updates

use async_trait::async_trait;
use std::net::Ipv4Addr;

use crate::error::Result;
use crate::model::{
    AddressId, AddressStatus, AuditLogEntry, CustomerId, CustomerService, EntityRef, IpAddress,
    JobId, RouterCheckpoint, RouterId, ServiceId, ServiceStatus, Subnet, SubnetId, SyncJob,
    SyncStatus,
};

/// Selection criteria for services
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    pub router_id: Option<RouterId>,
    pub customer_id: Option<CustomerId>,
    pub status: Option<ServiceStatus>,
}

impl ServiceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn router(mut self, router_id: RouterId) -> Self {
        self.router_id = Some(router_id);
        self
    }

    pub fn customer(mut self, customer_id: CustomerId) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, service: &CustomerService) -> bool {
        self.router_id.is_none_or(|r| service.router_id == r)
            && self.customer_id.is_none_or(|c| service.customer_id == c)
            && self.status.is_none_or(|s| service.status == s)
    }
}

/// Selection criteria for sync jobs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub router_id: Option<RouterId>,
    pub service_id: Option<ServiceId>,
    pub status: Option<SyncStatus>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn router(mut self, router_id: RouterId) -> Self {
        self.router_id = Some(router_id);
        self
    }

    pub fn service(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &SyncJob) -> bool {
        self.router_id.is_none_or(|r| job.router_id == r)
            && self.service_id.is_none_or(|s| job.service_id == Some(s))
            && self.status.is_none_or(|s| job.sync_status == s)
    }
}

/// Trait for provisioning store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage (files, databases, etc.)
/// - ✅ Implement locking/concurrency control for thread safety
/// - ✅ Enforce row-level preconditions on conditional updates
///
/// ## Forbidden Capabilities
/// - ❌ Decide state transitions (owned by the lifecycle controller)
/// - ❌ Talk to devices (owned by `DeviceDriver`)
/// - ❌ Spawn background tasks
#[async_trait]
pub trait ProvisioningStore: Send + Sync {
    /// Reserve `count` consecutive values of the store-wide monotonic
    /// sequence and return the first
    ///
    /// Every identifier and audit sequence number is drawn from it, so job
    /// ids order jobs by creation.
    async fn reserve_ids(&self, count: u64) -> Result<u64>;

    /// Next value of the store-wide monotonic sequence
    async fn next_id(&self) -> Result<u64> {
        self.reserve_ids(1).await
    }

    /// Insert a subnet together with its enumerated pool, atomically
    async fn insert_subnet(&self, subnet: &Subnet, addresses: &[IpAddress]) -> Result<()>;

    /// Replace a subnet row; `addresses`, when given, replaces its whole pool
    async fn update_subnet(&self, subnet: &Subnet, addresses: Option<&[IpAddress]>) -> Result<()>;

    /// Delete a subnet and its pool
    async fn delete_subnet(&self, id: SubnetId) -> Result<()>;

    async fn get_subnet(&self, id: SubnetId) -> Result<Option<Subnet>>;

    /// All subnets ordered by id
    async fn list_subnets(&self) -> Result<Vec<Subnet>>;

    async fn get_address(&self, id: AddressId) -> Result<Option<IpAddress>>;

    /// Look up a pool row by its dotted value
    async fn find_address(&self, address: Ipv4Addr) -> Result<Option<IpAddress>>;

    /// Pool rows of a subnet ordered by address value
    async fn list_addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>>;

    /// Conditional update: applies only if the stored status equals `expected`
    async fn update_address(&self, expected: AddressStatus, address: &IpAddress) -> Result<bool>;

    async fn insert_service(&self, service: &CustomerService) -> Result<()>;

    async fn get_service(&self, id: ServiceId) -> Result<Option<CustomerService>>;

    /// Matching services ordered by id
    async fn list_services(&self, filter: &ServiceFilter) -> Result<Vec<CustomerService>>;

    /// Conditional update: applies only if the stored status equals `expected`
    async fn update_service(
        &self,
        expected: ServiceStatus,
        service: &CustomerService,
    ) -> Result<bool>;

    async fn insert_job(&self, job: &SyncJob) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>>;

    /// Matching jobs ordered by id (creation order)
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>>;

    /// Conditional update: applies only if the stored status equals `expected`
    async fn update_job(&self, expected: SyncStatus, job: &SyncJob) -> Result<bool>;

    async fn get_checkpoint(&self, router: RouterId) -> Result<Option<RouterCheckpoint>>;

    async fn put_checkpoint(&self, checkpoint: &RouterCheckpoint) -> Result<()>;

    async fn list_checkpoints(&self) -> Result<Vec<RouterCheckpoint>>;

    /// Append an audit entry; entries are never modified afterwards
    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Audit entries in append order, optionally for one entity
    async fn list_audit(&self, entity: Option<EntityRef>) -> Result<Vec<AuditLogEntry>>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<()>;
}

/// Helper trait for constructing stores from configuration
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Create a store instance from configuration
    async fn create(
        &self,
        config: &crate::config::StoreConfig,
    ) -> Result<std::sync::Arc<dyn ProvisioningStore>>;
}
