//! IP allocation pool
//!
//! Hands out addresses from a subnet's enumerated pool. Every pool mutation
//! holds the subnet's lock across read, pick and conditional write, so two
//! allocators on one subnet can never pick the same address. The
//! conditional write still guards against writers outside this process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::model::{
    AddressStatus, AuditEvent, EntityRef, IpAddress, ServiceId, SubnetId,
};
use crate::subnet::{SubnetLocks, SubnetRegistry};
use crate::traits::{ProvisioningStore, ServiceFilter};

/// Answer of [`IpPool::check_availability`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    pub allocated_to: Option<ServiceId>,
}

/// Address counts of one subnet, by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub total: usize,
    pub available: usize,
    pub allocated: usize,
    pub reserved: usize,
    pub released: usize,
}

/// Address allocation over the registered subnets
#[derive(Clone)]
pub struct IpPool {
    store: Arc<dyn ProvisioningStore>,
    audit: AuditLog,
    config: PoolConfig,
    locks: SubnetLocks,
}

impl IpPool {
    /// Create a pool sharing the registry's per-subnet locks
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        audit: AuditLog,
        registry: &SubnetRegistry,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            audit,
            config,
            locks: registry.locks().clone(),
        }
    }

    /// Allocate the lowest-numbered free address of a subnet to a service
    ///
    /// # Errors
    ///
    /// - `NotFound`: the subnet does not exist
    /// - `PoolExhausted`: no address is free
    pub async fn allocate(&self, subnet: SubnetId, service: ServiceId) -> Result<IpAddress> {
        let _guard = self.locks.lock(subnet).await;

        if self.store.get_subnet(subnet).await?.is_none() {
            return Err(Error::not_found(subnet.to_string()));
        }

        let now = Utc::now();
        let candidates = self
            .store
            .list_addresses(subnet)
            .await?
            .into_iter()
            .filter(|a| self.is_free(a, now));

        for row in candidates {
            if let Some(allocated) = self.claim(row, service, now).await? {
                return Ok(allocated);
            }
        }

        debug!(%subnet, %service, "Pool exhausted");
        Err(Error::PoolExhausted(subnet))
    }

    /// Allocate an operator-chosen address
    ///
    /// The address is re-validated with [`check_availability`] under the
    /// subnet lock, so it cannot race the auto-picker.
    ///
    /// [`check_availability`]: IpPool::check_availability
    pub async fn allocate_specific(&self, address: Ipv4Addr, service: ServiceId) -> Result<IpAddress> {
        let row = self.find(address).await?;
        let _guard = self.locks.lock(row.subnet_id).await;

        let availability = self.check_availability(address).await?;
        if !availability.available {
            return Err(Error::conflict(match availability.allocated_to {
                Some(owner) => format!("{} is allocated to {}", address, owner),
                None => format!("{} is not available", address),
            }));
        }

        // Re-read under the lock; check_availability saw the same row.
        let row = self.find(address).await?;
        self.claim(row, service, Utc::now())
            .await?
            .ok_or_else(|| Error::conflict(format!("{} was taken concurrently", address)))
    }

    /// Return an address to the pool
    ///
    /// Releasing an address that is already released or available is a
    /// no-op. With no cooldown configured the address becomes `available`
    /// at once; otherwise it stays `released` until the cooldown passes.
    pub async fn release(&self, address: Ipv4Addr) -> Result<()> {
        let row = self.find(address).await?;
        let _guard = self.locks.lock(row.subnet_id).await;

        let row = self.find(address).await?;
        let expected = row.status;
        if matches!(expected, AddressStatus::Available | AddressStatus::Released) {
            debug!(%address, status = ?expected, "Release is a no-op");
            return Ok(());
        }

        let now = Utc::now();
        let mut next = row;
        next.status = if self.config.release_cooldown_secs == 0 {
            AddressStatus::Available
        } else {
            AddressStatus::Released
        };
        next.service_id = None;
        next.allocated_at = None;
        next.released_at = Some(now);

        if !self.store.update_address(expected, &next).await? {
            return Err(Error::conflict(format!("{} changed concurrently", address)));
        }

        info!(%address, "Released address");
        self.audit
            .record(EntityRef::Address(next.id), AuditEvent::AddressReleased { address })
            .await;
        Ok(())
    }

    /// Whether an address can be handed out, and to whom it belongs if not
    ///
    /// Consults both the pool row and the live service records, so a
    /// service still pointing at an address blocks it even if the pool row
    /// has drifted back to free.
    pub async fn check_availability(&self, address: Ipv4Addr) -> Result<Availability> {
        let row = self.find(address).await?;

        let holder = self
            .store
            .list_services(&ServiceFilter::all())
            .await?
            .into_iter()
            .find(|s| !s.status.is_terminal() && s.address_id == Some(row.id))
            .map(|s| s.id);

        if let (Some(owner), Some(live)) = (row.service_id, holder)
            && owner != live
        {
            warn!(%address, %owner, %live, "Pool row and service disagree on owner");
        }

        let allocated_to = row.service_id.or(holder);
        Ok(Availability {
            available: allocated_to.is_none() && self.is_free(&row, Utc::now()),
            allocated_to,
        })
    }

    /// Withhold an available address from auto-pick
    pub async fn reserve(&self, address: Ipv4Addr) -> Result<IpAddress> {
        let row = self.find(address).await?;
        let _guard = self.locks.lock(row.subnet_id).await;

        let row = self.find(address).await?;
        if row.status != AddressStatus::Available {
            return Err(Error::conflict(format!(
                "{} is {:?}, only available addresses can be reserved",
                address, row.status
            )));
        }

        let mut next = row;
        next.status = AddressStatus::Reserved;
        if !self
            .store
            .update_address(AddressStatus::Available, &next)
            .await?
        {
            return Err(Error::conflict(format!("{} changed concurrently", address)));
        }

        info!(%address, "Reserved address");
        self.audit
            .record(EntityRef::Address(next.id), AuditEvent::AddressReserved { address })
            .await;
        Ok(next)
    }

    /// Move released addresses whose cooldown has passed back to available
    ///
    /// Returns the number of addresses reclaimed.
    pub async fn reclaim_released(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut reclaimed = 0;
        for subnet in self.store.list_subnets().await? {
            let _guard = self.locks.lock(subnet.id).await;
            for row in self.store.list_addresses(subnet.id).await? {
                if row.status != AddressStatus::Released || !self.cooled_down(&row, now) {
                    continue;
                }
                let mut next = row;
                next.status = AddressStatus::Available;
                if self
                    .store
                    .update_address(AddressStatus::Released, &next)
                    .await?
                {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "Reclaimed released addresses");
        }
        Ok(reclaimed)
    }

    /// Address counts for one subnet
    pub async fn pool_usage(&self, subnet: SubnetId) -> Result<PoolUsage> {
        if self.store.get_subnet(subnet).await?.is_none() {
            return Err(Error::not_found(subnet.to_string()));
        }
        let mut usage = PoolUsage::default();
        for row in self.store.list_addresses(subnet).await? {
            usage.total += 1;
            match row.status {
                AddressStatus::Available => usage.available += 1,
                AddressStatus::Allocated => usage.allocated += 1,
                AddressStatus::Reserved => usage.reserved += 1,
                AddressStatus::Released => usage.released += 1,
            }
        }
        Ok(usage)
    }

    /// Pool rows of a subnet ordered by address
    pub async fn addresses(&self, subnet: SubnetId) -> Result<Vec<IpAddress>> {
        self.store.list_addresses(subnet).await
    }

    async fn find(&self, address: Ipv4Addr) -> Result<IpAddress> {
        self.store
            .find_address(address)
            .await?
            .ok_or_else(|| Error::unknown_address(address))
    }

    fn is_free(&self, row: &IpAddress, now: DateTime<Utc>) -> bool {
        match row.status {
            AddressStatus::Available => true,
            AddressStatus::Released => self.cooled_down(row, now),
            AddressStatus::Allocated | AddressStatus::Reserved => false,
        }
    }

    fn cooled_down(&self, row: &IpAddress, now: DateTime<Utc>) -> bool {
        row.released_at
            .is_none_or(|at| at + self.config.release_cooldown() <= now)
    }

    /// Conditionally link a free row to a service; `None` if it was taken
    async fn claim(
        &self,
        row: IpAddress,
        service: ServiceId,
        now: DateTime<Utc>,
    ) -> Result<Option<IpAddress>> {
        let expected = row.status;
        let mut next = row;
        next.status = AddressStatus::Allocated;
        next.service_id = Some(service);
        next.allocated_at = Some(now);
        next.released_at = None;

        if !self.store.update_address(expected, &next).await? {
            debug!(address = %next.address, "Address taken by another writer, skipping");
            return Ok(None);
        }

        info!(address = %next.address, %service, "Allocated address");
        self.audit
            .record(
                EntityRef::Address(next.id),
                AuditEvent::AddressAllocated {
                    address: next.address,
                    service_id: service,
                },
            )
            .await;
        Ok(Some(next))
    }
}
