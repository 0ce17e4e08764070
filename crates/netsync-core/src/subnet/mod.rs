//! Subnet registry
//!
//! Owns CIDR blocks and the invariant that no two registered blocks share
//! an address: two routers must never be told to answer for the same host.
//! Registering a block also enumerates its pool of host addresses.

use chrono::Utc;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::audit::AuditLog;
use crate::cidr::Cidr;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::model::{
    AddressId, AddressStatus, AuditEvent, EntityRef, IpAddress, RouterId, Subnet, SubnetId,
};
use crate::traits::ProvisioningStore;

/// Request to register a subnet
#[derive(Debug, Clone)]
pub struct NewSubnet {
    pub cidr: String,
    pub router_id: RouterId,
    pub name: String,
    /// Router-side gateway; stored as a `reserved` pool address
    pub gateway: Option<Ipv4Addr>,
}

impl NewSubnet {
    pub fn new(cidr: impl Into<String>, router_id: RouterId, name: impl Into<String>) -> Self {
        Self {
            cidr: cidr.into(),
            router_id,
            name: name.into(),
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }
}

/// Partial update of a subnet; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct SubnetUpdate {
    pub name: Option<String>,
    pub router_id: Option<RouterId>,
    /// `Some(None)` clears the gateway
    pub gateway: Option<Option<Ipv4Addr>>,
    pub cidr: Option<String>,
}

/// Result of an overlap query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapReport {
    pub overlaps: bool,
    pub conflicting: Vec<Subnet>,
}

/// Per-subnet mutual exclusion shared by the registry and the pool
///
/// Allocation and any pool-reshaping subnet mutation hold the subnet's lock
/// for the whole read-pick-write sequence.
pub(crate) type SubnetLocks = KeyedLocks<SubnetId>;

/// Registry of CIDR blocks
#[derive(Clone)]
pub struct SubnetRegistry {
    store: Arc<dyn ProvisioningStore>,
    audit: AuditLog,
    config: PoolConfig,
    locks: SubnetLocks,
    /// Serializes overlap-check-then-insert across registrations
    registration: Arc<tokio::sync::Mutex<()>>,
}

impl SubnetRegistry {
    pub fn new(store: Arc<dyn ProvisioningStore>, audit: AuditLog, config: PoolConfig) -> Self {
        Self {
            store,
            audit,
            config,
            locks: SubnetLocks::default(),
            registration: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub(crate) fn locks(&self) -> &SubnetLocks {
        &self.locks
    }

    /// Register a block and enumerate its pool
    ///
    /// # Errors
    ///
    /// - `InvalidCidr`: malformed block, oversized block, or gateway outside it
    /// - `Overlap`: the block intersects a registered subnet
    pub async fn register_subnet(&self, request: NewSubnet) -> Result<Subnet> {
        let cidr: Cidr = request.cidr.parse()?;
        self.check_size(&cidr)?;
        check_gateway(&cidr, request.gateway)?;

        let _registration = self.registration.lock().await;

        let report = self.overlap_report(&cidr, None).await?;
        if report.overlaps {
            return Err(overlap_error(&cidr, &report));
        }

        let id = SubnetId(self.store.next_id().await?);
        let subnet = Subnet {
            id,
            cidr,
            router_id: request.router_id,
            gateway: request.gateway,
            name: request.name,
            created_at: Utc::now(),
        };
        let pool = self.enumerate(&subnet).await?;

        self.store.insert_subnet(&subnet, &pool).await?;
        info!(subnet = %id, %cidr, router = %subnet.router_id, hosts = pool.len(), "Registered subnet");

        self.audit
            .record(
                EntityRef::Subnet(id),
                AuditEvent::SubnetRegistered {
                    cidr: cidr.to_string(),
                },
            )
            .await;

        Ok(subnet)
    }

    /// Report registered subnets whose range intersects `cidr`
    ///
    /// `exclude` skips one subnet, for validating an edit of that subnet.
    pub async fn check_overlap(&self, cidr: &str, exclude: Option<SubnetId>) -> Result<OverlapReport> {
        let cidr: Cidr = cidr.parse()?;
        self.overlap_report(&cidr, exclude).await
    }

    async fn overlap_report(&self, cidr: &Cidr, exclude: Option<SubnetId>) -> Result<OverlapReport> {
        let conflicting: Vec<Subnet> = self
            .store
            .list_subnets()
            .await?
            .into_iter()
            .filter(|s| Some(s.id) != exclude && s.cidr.overlaps(cidr))
            .collect();

        Ok(OverlapReport {
            overlaps: !conflicting.is_empty(),
            conflicting,
        })
    }

    /// Edit a subnet
    ///
    /// Name changes always apply. Changing the CIDR or the router requires
    /// that no pool address is allocated; a new CIDR is re-checked for
    /// overlap and its pool re-enumerated.
    pub async fn update_subnet(&self, id: SubnetId, update: SubnetUpdate) -> Result<Subnet> {
        let _registration = self.registration.lock().await;
        let _pool = self.locks.lock(id).await;

        let current = self.get_subnet(id).await?;
        let mut next = current.clone();
        if let Some(name) = update.name {
            next.name = name;
        }
        if let Some(router_id) = update.router_id {
            next.router_id = router_id;
        }
        if let Some(gateway) = update.gateway {
            next.gateway = gateway;
        }
        if let Some(cidr) = update.cidr.as_deref() {
            next.cidr = cidr.parse()?;
        }

        let reshaped = next.cidr != current.cidr;
        let moved = next.router_id != current.router_id;
        let pool = self.store.list_addresses(id).await?;

        if (reshaped || moved) && pool.iter().any(|a| a.status == AddressStatus::Allocated) {
            return Err(Error::conflict(format!(
                "{} has allocated addresses; release them before changing its CIDR or router",
                id
            )));
        }

        check_gateway(&next.cidr, next.gateway)?;

        if reshaped {
            self.check_size(&next.cidr)?;
            let report = self.overlap_report(&next.cidr, Some(id)).await?;
            if report.overlaps {
                return Err(overlap_error(&next.cidr, &report));
            }
            let fresh = self.enumerate(&next).await?;
            self.store.update_subnet(&next, Some(&fresh)).await?;
        } else {
            if next.gateway != current.gateway {
                self.move_gateway(&pool, current.gateway, next.gateway).await?;
            }
            self.store.update_subnet(&next, None).await?;
        }

        info!(subnet = %id, cidr = %next.cidr, "Updated subnet");
        self.audit
            .record(
                EntityRef::Subnet(id),
                AuditEvent::SubnetUpdated {
                    cidr: next.cidr.to_string(),
                },
            )
            .await;

        Ok(next)
    }

    /// Delete a subnet whose pool holds no allocated address
    pub async fn delete_subnet(&self, id: SubnetId) -> Result<()> {
        let guard = self.locks.lock(id).await;

        let subnet = self.get_subnet(id).await?;
        let allocated = self
            .store
            .list_addresses(id)
            .await?
            .iter()
            .filter(|a| a.status == AddressStatus::Allocated)
            .count();
        if allocated > 0 {
            return Err(Error::conflict(format!(
                "{} still has {} allocated address(es)",
                id, allocated
            )));
        }

        self.store.delete_subnet(id).await?;
        drop(guard);
        self.locks.forget(id);

        info!(subnet = %id, cidr = %subnet.cidr, "Deleted subnet");
        self.audit
            .record(
                EntityRef::Subnet(id),
                AuditEvent::SubnetDeleted {
                    cidr: subnet.cidr.to_string(),
                },
            )
            .await;
        Ok(())
    }

    pub async fn get_subnet(&self, id: SubnetId) -> Result<Subnet> {
        self.store
            .get_subnet(id)
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    pub async fn list_subnets(&self) -> Result<Vec<Subnet>> {
        self.store.list_subnets().await
    }

    /// Subnets served by a router, ordered by id
    pub async fn subnets_for_router(&self, router: RouterId) -> Result<Vec<Subnet>> {
        Ok(self
            .store
            .list_subnets()
            .await?
            .into_iter()
            .filter(|s| s.router_id == router)
            .collect())
    }

    /// The registered subnet containing `address`, if any
    pub async fn subnet_for_address(&self, address: Ipv4Addr) -> Result<Option<Subnet>> {
        Ok(self
            .store
            .list_subnets()
            .await?
            .into_iter()
            .find(|s| s.cidr.contains(address)))
    }

    fn check_size(&self, cidr: &Cidr) -> Result<()> {
        if cidr.host_count() > self.config.max_enumerated_hosts {
            return Err(Error::invalid_cidr(format!(
                "{} has {} hosts, more than the configured maximum of {}",
                cidr,
                cidr.host_count(),
                self.config.max_enumerated_hosts
            )));
        }
        Ok(())
    }

    async fn enumerate(&self, subnet: &Subnet) -> Result<Vec<IpAddress>> {
        let count = subnet.cidr.host_count();
        let first = self.store.reserve_ids(count).await?;
        let pool = subnet
            .cidr
            .hosts()
            .zip(first..)
            .map(|(address, id)| {
                let mut row = IpAddress::new(AddressId(id), subnet.id, address);
                if Some(address) == subnet.gateway {
                    row.status = AddressStatus::Reserved;
                }
                row
            })
            .collect::<Vec<_>>();
        debug!(subnet = %subnet.id, hosts = pool.len(), "Enumerated pool");
        Ok(pool)
    }

    async fn move_gateway(
        &self,
        pool: &[IpAddress],
        old: Option<Ipv4Addr>,
        new: Option<Ipv4Addr>,
    ) -> Result<()> {
        if let Some(new) = new {
            let row = pool
                .iter()
                .find(|a| a.address == new)
                .ok_or_else(|| Error::unknown_address(new))?;
            if row.status != AddressStatus::Available {
                return Err(Error::conflict(format!(
                    "gateway {} is {:?}, not available",
                    new, row.status
                )));
            }
            let mut reserved = row.clone();
            reserved.status = AddressStatus::Reserved;
            if !self
                .store
                .update_address(AddressStatus::Available, &reserved)
                .await?
            {
                return Err(Error::conflict(format!("gateway {} was taken concurrently", new)));
            }
        }

        if let Some(old) = old
            && let Some(row) = pool.iter().find(|a| a.address == old)
            && row.status == AddressStatus::Reserved
            && row.service_id.is_none()
        {
            let mut freed = row.clone();
            freed.status = AddressStatus::Available;
            self.store
                .update_address(AddressStatus::Reserved, &freed)
                .await?;
        }
        Ok(())
    }
}

fn check_gateway(cidr: &Cidr, gateway: Option<Ipv4Addr>) -> Result<()> {
    match gateway {
        Some(gw) if !cidr.is_host(gw) => Err(Error::invalid_cidr(format!(
            "gateway {} is not a host address of {}",
            gw, cidr
        ))),
        _ => Ok(()),
    }
}

fn overlap_error(cidr: &Cidr, report: &OverlapReport) -> Error {
    Error::Overlap {
        cidr: cidr.to_string(),
        conflicting: report.conflicting.iter().map(|s| s.id).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceId;
    use crate::pool::IpPool;
    use crate::state::MemoryStore;

    fn registry() -> SubnetRegistry {
        let store = Arc::new(MemoryStore::new());
        let (audit, _stream) = AuditLog::new(store.clone(), 64);
        SubnetRegistry::new(store, audit, PoolConfig::default())
    }

    #[tokio::test]
    async fn nested_block_is_reported_as_overlap() {
        let registry = registry();
        let outer = registry
            .register_subnet(NewSubnet::new("10.0.0.0/24", RouterId(1), "core"))
            .await
            .unwrap();

        let report = registry.check_overlap("10.0.0.128/25", None).await.unwrap();
        assert!(report.overlaps);
        assert_eq!(report.conflicting, vec![outer.clone()]);

        let err = registry
            .register_subnet(NewSubnet::new("10.0.0.128/25", RouterId(2), "edge"))
            .await
            .unwrap_err();
        match err {
            Error::Overlap { conflicting, .. } => assert_eq!(conflicting, vec![outer.id]),
            other => panic!("expected overlap, got {:?}", other),
        }

        // Excluding the outer block itself (an edit) clears the overlap.
        let report = registry
            .check_overlap("10.0.0.128/25", Some(outer.id))
            .await
            .unwrap();
        assert!(!report.overlaps);
    }

    #[tokio::test]
    async fn adjacent_blocks_coexist() {
        let registry = registry();
        registry
            .register_subnet(NewSubnet::new("10.0.0.0/25", RouterId(1), "a"))
            .await
            .unwrap();
        registry
            .register_subnet(NewSubnet::new("10.0.0.128/25", RouterId(1), "b"))
            .await
            .unwrap();
        assert_eq!(registry.list_subnets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gateway_is_reserved_in_pool() {
        let registry = registry();
        let subnet = registry
            .register_subnet(
                NewSubnet::new("192.168.10.0/29", RouterId(1), "gw")
                    .with_gateway(Ipv4Addr::new(192, 168, 10, 1)),
            )
            .await
            .unwrap();

        let pool = registry.store.list_addresses(subnet.id).await.unwrap();
        assert_eq!(pool.len(), 6);
        assert_eq!(pool[0].address, Ipv4Addr::new(192, 168, 10, 1));
        assert_eq!(pool[0].status, AddressStatus::Reserved);
        assert!(pool[1..].iter().all(|a| a.status == AddressStatus::Available));
    }

    #[tokio::test]
    async fn rejects_invalid_and_oversized_blocks() {
        let registry = registry();
        let err = registry
            .register_subnet(NewSubnet::new("10.0.0.300/24", RouterId(1), "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCidr(_)));

        let err = registry
            .register_subnet(NewSubnet::new("10.0.0.0/8", RouterId(1), "huge"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCidr(_)));

        let err = registry
            .register_subnet(
                NewSubnet::new("10.0.0.0/30", RouterId(1), "gw")
                    .with_gateway(Ipv4Addr::new(10, 0, 1, 1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCidr(_)));
    }

    #[tokio::test]
    async fn cidr_change_reenumerates_empty_pool() {
        let registry = registry();
        let subnet = registry
            .register_subnet(NewSubnet::new("10.1.0.0/30", RouterId(1), "small"))
            .await
            .unwrap();

        let updated = registry
            .update_subnet(
                subnet.id,
                SubnetUpdate {
                    cidr: Some("10.1.0.0/29".to_string()),
                    ..SubnetUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.cidr.to_string(), "10.1.0.0/29");
        assert_eq!(registry.store.list_addresses(subnet.id).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn delete_removes_pool() {
        let registry = registry();
        let subnet = registry
            .register_subnet(NewSubnet::new("10.2.0.0/30", RouterId(1), "tmp"))
            .await
            .unwrap();
        registry.delete_subnet(subnet.id).await.unwrap();

        assert!(registry.list_subnets().await.unwrap().is_empty());
        assert!(
            registry
                .subnet_for_address(Ipv4Addr::new(10, 2, 0, 1))
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            registry.delete_subnet(subnet.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn allocated_pool_blocks_reshape_move_and_delete() {
        let registry = registry();
        let pool = IpPool::new(
            registry.store.clone(),
            registry.audit.clone(),
            &registry,
            PoolConfig::default(),
        );
        let subnet = registry
            .register_subnet(NewSubnet::new("10.3.0.0/29", RouterId(1), "busy"))
            .await
            .unwrap();
        pool.allocate(subnet.id, ServiceId(40)).await.unwrap();
        let before = registry.store.list_addresses(subnet.id).await.unwrap();

        let reshape = registry
            .update_subnet(
                subnet.id,
                SubnetUpdate {
                    cidr: Some("10.3.0.0/28".to_string()),
                    ..SubnetUpdate::default()
                },
            )
            .await;
        assert!(matches!(reshape, Err(Error::Conflict(_))));

        let moved = registry
            .update_subnet(
                subnet.id,
                SubnetUpdate {
                    router_id: Some(RouterId(2)),
                    ..SubnetUpdate::default()
                },
            )
            .await;
        assert!(matches!(moved, Err(Error::Conflict(_))));

        assert!(matches!(
            registry.delete_subnet(subnet.id).await,
            Err(Error::Conflict(_))
        ));

        assert_eq!(registry.get_subnet(subnet.id).await.unwrap(), subnet);
        assert_eq!(registry.store.list_addresses(subnet.id).await.unwrap(), before);

        // Renaming touches neither the block nor its pool.
        let renamed = registry
            .update_subnet(
                subnet.id,
                SubnetUpdate {
                    name: Some("busy-renamed".to_string()),
                    ..SubnetUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "busy-renamed");
        assert_eq!(registry.store.list_addresses(subnet.id).await.unwrap(), before);
    }
}
