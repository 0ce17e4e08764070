// # In-memory Tables
//
// Row storage shared by `MemoryStore` and `FileStore`. All methods are
// synchronous and run under the owning store's lock, which is what makes
// the conditional updates atomic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::model::{
    AddressId, AddressStatus, AuditLogEntry, CustomerService, EntityRef, IpAddress, JobId,
    RouterCheckpoint, RouterId, ServiceId, ServiceStatus, Subnet, SubnetId, SyncJob, SyncStatus,
};
use crate::traits::{JobFilter, ServiceFilter};

#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    sequence: u64,
    subnets: BTreeMap<SubnetId, Subnet>,
    addresses: BTreeMap<AddressId, IpAddress>,
    by_value: HashMap<Ipv4Addr, AddressId>,
    services: BTreeMap<ServiceId, CustomerService>,
    jobs: BTreeMap<JobId, SyncJob>,
    checkpoints: BTreeMap<RouterId, RouterCheckpoint>,
    audit: Vec<AuditLogEntry>,
}

/// Serializable form of [`Tables`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TablesSnapshot {
    pub sequence: u64,
    pub subnets: Vec<Subnet>,
    pub addresses: Vec<IpAddress>,
    pub services: Vec<CustomerService>,
    pub jobs: Vec<SyncJob>,
    pub checkpoints: Vec<RouterCheckpoint>,
    pub audit: Vec<AuditLogEntry>,
}

impl Tables {
    pub fn from_snapshot(snapshot: TablesSnapshot) -> Self {
        let mut tables = Tables {
            sequence: snapshot.sequence,
            ..Tables::default()
        };
        for subnet in snapshot.subnets {
            tables.subnets.insert(subnet.id, subnet);
        }
        for address in snapshot.addresses {
            tables.by_value.insert(address.address, address.id);
            tables.addresses.insert(address.id, address);
        }
        for service in snapshot.services {
            tables.services.insert(service.id, service);
        }
        for job in snapshot.jobs {
            tables.jobs.insert(job.id, job);
        }
        for checkpoint in snapshot.checkpoints {
            tables.checkpoints.insert(checkpoint.router_id, checkpoint);
        }
        tables.audit = snapshot.audit;
        tables
    }

    pub fn snapshot(&self) -> TablesSnapshot {
        TablesSnapshot {
            sequence: self.sequence,
            subnets: self.subnets.values().cloned().collect(),
            addresses: self.addresses.values().cloned().collect(),
            services: self.services.values().cloned().collect(),
            jobs: self.jobs.values().cloned().collect(),
            checkpoints: self.checkpoints.values().cloned().collect(),
            audit: self.audit.clone(),
        }
    }

    pub fn reserve_ids(&mut self, count: u64) -> u64 {
        let first = self.sequence + 1;
        self.sequence += count.max(1);
        first
    }

    pub fn insert_subnet(&mut self, subnet: &Subnet, addresses: &[IpAddress]) -> Result<()> {
        if self.subnets.contains_key(&subnet.id) {
            return Err(Error::store(format!("{} already exists", subnet.id)));
        }
        self.check_new_addresses(addresses)?;
        self.subnets.insert(subnet.id, subnet.clone());
        self.insert_addresses(addresses);
        Ok(())
    }

    pub fn update_subnet(&mut self, subnet: &Subnet, addresses: Option<&[IpAddress]>) -> Result<()> {
        if !self.subnets.contains_key(&subnet.id) {
            return Err(Error::not_found(subnet.id.to_string()));
        }
        if let Some(addresses) = addresses {
            let removed = self.remove_pool(subnet.id);
            if let Err(e) = self.check_new_addresses(addresses) {
                self.insert_addresses(&removed);
                return Err(e);
            }
            self.insert_addresses(addresses);
        }
        self.subnets.insert(subnet.id, subnet.clone());
        Ok(())
    }

    pub fn delete_subnet(&mut self, id: SubnetId) -> Result<()> {
        if self.subnets.remove(&id).is_none() {
            return Err(Error::not_found(id.to_string()));
        }
        self.remove_pool(id);
        Ok(())
    }

    pub fn get_subnet(&self, id: SubnetId) -> Option<Subnet> {
        self.subnets.get(&id).cloned()
    }

    pub fn list_subnets(&self) -> Vec<Subnet> {
        self.subnets.values().cloned().collect()
    }

    pub fn get_address(&self, id: AddressId) -> Option<IpAddress> {
        self.addresses.get(&id).cloned()
    }

    pub fn find_address(&self, address: Ipv4Addr) -> Option<IpAddress> {
        self.by_value
            .get(&address)
            .and_then(|id| self.addresses.get(id))
            .cloned()
    }

    pub fn list_addresses(&self, subnet: SubnetId) -> Vec<IpAddress> {
        let mut rows: Vec<IpAddress> = self
            .addresses
            .values()
            .filter(|a| a.subnet_id == subnet)
            .cloned()
            .collect();
        rows.sort_by_key(|a| u32::from(a.address));
        rows
    }

    pub fn update_address(&mut self, expected: AddressStatus, address: &IpAddress) -> Result<bool> {
        let row = self
            .addresses
            .get_mut(&address.id)
            .ok_or_else(|| Error::not_found(address.id.to_string()))?;
        if row.status != expected {
            return Ok(false);
        }
        if row.address != address.address || row.subnet_id != address.subnet_id {
            return Err(Error::store(format!(
                "{} cannot change its value or subnet",
                address.id
            )));
        }
        *row = address.clone();
        Ok(true)
    }

    pub fn insert_service(&mut self, service: &CustomerService) -> Result<()> {
        if self.services.contains_key(&service.id) {
            return Err(Error::store(format!("{} already exists", service.id)));
        }
        self.services.insert(service.id, service.clone());
        Ok(())
    }

    pub fn get_service(&self, id: ServiceId) -> Option<CustomerService> {
        self.services.get(&id).cloned()
    }

    pub fn list_services(&self, filter: &ServiceFilter) -> Vec<CustomerService> {
        self.services
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }

    pub fn update_service(
        &mut self,
        expected: ServiceStatus,
        service: &CustomerService,
    ) -> Result<bool> {
        let row = self
            .services
            .get_mut(&service.id)
            .ok_or_else(|| Error::not_found(service.id.to_string()))?;
        if row.status != expected {
            return Ok(false);
        }
        *row = service.clone();
        Ok(true)
    }

    pub fn insert_job(&mut self, job: &SyncJob) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(Error::store(format!("{} already exists", job.id)));
        }
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> Option<SyncJob> {
        self.jobs.get(&id).cloned()
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<SyncJob> {
        self.jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect()
    }

    pub fn update_job(&mut self, expected: SyncStatus, job: &SyncJob) -> Result<bool> {
        let row = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| Error::not_found(job.id.to_string()))?;
        if row.sync_status != expected {
            return Ok(false);
        }
        *row = job.clone();
        Ok(true)
    }

    pub fn get_checkpoint(&self, router: RouterId) -> Option<RouterCheckpoint> {
        self.checkpoints.get(&router).cloned()
    }

    pub fn put_checkpoint(&mut self, checkpoint: &RouterCheckpoint) {
        self.checkpoints
            .insert(checkpoint.router_id, checkpoint.clone());
    }

    pub fn list_checkpoints(&self) -> Vec<RouterCheckpoint> {
        self.checkpoints.values().cloned().collect()
    }

    pub fn append_audit(&mut self, entry: &AuditLogEntry) {
        self.audit.push(entry.clone());
    }

    pub fn list_audit(&self, entity: Option<EntityRef>) -> Vec<AuditLogEntry> {
        self.audit
            .iter()
            .filter(|e| entity.is_none_or(|target| e.entity == target))
            .cloned()
            .collect()
    }

    fn check_new_addresses(&self, addresses: &[IpAddress]) -> Result<()> {
        for address in addresses {
            if self.addresses.contains_key(&address.id) || self.by_value.contains_key(&address.address)
            {
                return Err(Error::store(format!(
                    "address {} is already stored",
                    address.address
                )));
            }
        }
        Ok(())
    }

    fn insert_addresses(&mut self, addresses: &[IpAddress]) {
        for address in addresses {
            self.by_value.insert(address.address, address.id);
            self.addresses.insert(address.id, address.clone());
        }
    }

    fn remove_pool(&mut self, subnet: SubnetId) -> Vec<IpAddress> {
        let ids: Vec<AddressId> = self
            .addresses
            .values()
            .filter(|a| a.subnet_id == subnet)
            .map(|a| a.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(address) = self.addresses.remove(&id) {
                self.by_value.remove(&address.address);
                removed.push(address);
            }
        }
        removed
    }
}
