// # Memory Store
//
// In-memory implementation of ProvisioningStore.
//
// ## Purpose
//
// Provides a simple, fast store that doesn't persist across restarts.
// Useful for testing, embedding in hosts that own durability elsewhere, and
// dry-run deployments.
//
// ## Crash Behavior
//
// - All subnets, pools, services and jobs are lost on restart/crash
// - Pending sync jobs are not resumed

use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::tables::Tables;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::{
    AddressId, AddressStatus, AuditLogEntry, CustomerService, EntityRef, IpAddress, JobId,
    RouterCheckpoint, RouterId, ServiceId, ServiceStatus, Subnet, SubnetId, SyncJob, SyncStatus,
};
use crate::traits::{JobFilter, ProvisioningStore, ServiceFilter, StoreFactory};

/// In-memory store implementation
///
/// All tables live behind a single RwLock, so every conditional update is
/// atomic with respect to every other store call.
///
/// # Example
///
/// ```rust,no_run
/// use netsync_core::state::MemoryStore;
/// use netsync_core::traits::ProvisioningStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStore::new();
///     let first = store.next_id().await?;
///     let second = store.next_id().await?;
///     assert!(second > first);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvisioningStore for MemoryStore {
    async fn reserve_ids(&self, count: u64) -> Result<u64> {
        Ok(self.inner.write().await.reserve_ids(count))
    }

    async fn insert_subnet(&self, subnet: &Subnet, addresses: &[IpAddress]) -> Result<()> {
        self.inner.write().await.insert_subnet(subnet, addresses)
    }

    async fn update_subnet(&self, subnet: &Subnet, addresses: Option<&[IpAddress]>) -> Result<()> {
        self.inner.write().await.update_subnet(subnet, addresses)
    }

    async fn delete_subnet(&self, id: SubnetId) -> Result<()> {
        self.inner.write().await.delete_subnet(id)
    }

    async fn get_subnet(&self, id: SubnetId) -> Result<Option<Subnet>> {
        Ok(self.inner.read().await.get_subnet(id))
    }

    async fn list_subnets(&self) -> Result<Vec<Subnet>> {
        Ok(self.inner.read().await.list_subnets())
    }

    async fn get_address(&self, id: AddressId) -> Result<Option<IpAddress>> {
        Ok(self.inner.read().await.get_address(id))
    }

    async fn find_address(&self, address: Ipv4Addr) -> Result<Option<IpAddress>> {
        Ok(self.inner.read().await.find_address(address))
    }

    async fn list_addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>> {
        Ok(self.inner.read().await.list_addresses(subnet))
    }

    async fn update_address(&self, expected: AddressStatus, address: &IpAddress) -> Result<bool> {
        self.inner.write().await.update_address(expected, address)
    }

    async fn insert_service(&self, service: &CustomerService) -> Result<()> {
        self.inner.write().await.insert_service(service)
    }

    async fn get_service(&self, id: ServiceId) -> Result<Option<CustomerService>> {
        Ok(self.inner.read().await.get_service(id))
    }

    async fn list_services(&self, filter: &ServiceFilter) -> Result<Vec<CustomerService>> {
        Ok(self.inner.read().await.list_services(filter))
    }

    async fn update_service(
        &self,
        expected: ServiceStatus,
        service: &CustomerService,
    ) -> Result<bool> {
        self.inner.write().await.update_service(expected, service)
    }

    async fn insert_job(&self, job: &SyncJob) -> Result<()> {
        self.inner.write().await.insert_job(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<SyncJob>> {
        Ok(self.inner.read().await.get_job(id))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        Ok(self.inner.read().await.list_jobs(filter))
    }

    async fn update_job(&self, expected: SyncStatus, job: &SyncJob) -> Result<bool> {
        self.inner.write().await.update_job(expected, job)
    }

    async fn get_checkpoint(&self, router: RouterId) -> Result<Option<RouterCheckpoint>> {
        Ok(self.inner.read().await.get_checkpoint(router))
    }

    async fn put_checkpoint(&self, checkpoint: &RouterCheckpoint) -> Result<()> {
        self.inner.write().await.put_checkpoint(checkpoint);
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<RouterCheckpoint>> {
        Ok(self.inner.read().await.list_checkpoints())
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.inner.write().await.append_audit(entry);
        Ok(())
    }

    async fn list_audit(&self, entity: Option<EntityRef>) -> Result<Vec<AuditLogEntry>> {
        Ok(self.inner.read().await.list_audit(entity))
    }

    async fn flush(&self) -> Result<()> {
        // No-op for memory store (everything is already "persisted")
        Ok(())
    }
}

/// Factory for the `memory` store type
pub struct MemoryStoreFactory;

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn create(&self, config: &StoreConfig) -> Result<Arc<dyn ProvisioningStore>> {
        match config {
            StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            other => Err(Error::config(format!(
                "memory store factory cannot build a '{}' store",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CustomerId, IpAddress};
    use chrono::Utc;

    fn subnet(id: u64, cidr: &str) -> Subnet {
        Subnet {
            id: SubnetId(id),
            cidr: cidr.parse().unwrap(),
            router_id: RouterId(1),
            gateway: None,
            name: format!("pool-{}", id),
            created_at: Utc::now(),
        }
    }

    fn service(id: u64) -> CustomerService {
        CustomerService {
            id: ServiceId(id),
            customer_id: CustomerId(9),
            router_id: RouterId(1),
            subnet_id: None,
            address_id: None,
            address: None,
            status: ServiceStatus::Pending,
            suspension_reason: None,
            suspended_at: None,
            suspended_until: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subnet_rows_carry_their_pool() {
        let store = MemoryStore::new();
        let block = subnet(1, "10.0.0.0/30");
        let pool: Vec<IpAddress> = block
            .cidr
            .hosts()
            .enumerate()
            .map(|(i, a)| IpAddress::new(AddressId(100 + i as u64), block.id, a))
            .collect();

        store.insert_subnet(&block, &pool).await.unwrap();
        assert_eq!(store.list_addresses(block.id).await.unwrap().len(), 2);
        assert!(
            store
                .find_address("10.0.0.2".parse().unwrap())
                .await
                .unwrap()
                .is_some()
        );

        store.delete_subnet(block.id).await.unwrap();
        assert!(store.list_addresses(block.id).await.unwrap().is_empty());
        assert!(
            store
                .find_address("10.0.0.2".parse().unwrap())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn conditional_update_checks_status() {
        let store = MemoryStore::new();
        let mut svc = service(5);
        store.insert_service(&svc).await.unwrap();

        svc.status = ServiceStatus::Active;
        assert!(
            store
                .update_service(ServiceStatus::Pending, &svc)
                .await
                .unwrap()
        );

        // Second writer still believes the row is pending.
        svc.status = ServiceStatus::Cancelled;
        assert!(
            !store
                .update_service(ServiceStatus::Pending, &svc)
                .await
                .unwrap()
        );
        assert_eq!(
            store.get_service(svc.id).await.unwrap().unwrap().status,
            ServiceStatus::Active
        );
    }

    #[tokio::test]
    async fn sequence_is_monotonic() {
        let store = MemoryStore::new();
        let mut last = 0;
        for _ in 0..5 {
            let next = store.next_id().await.unwrap();
            assert!(next > last);
            last = next;
        }
    }
}
