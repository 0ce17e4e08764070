//! Service lifecycle controller
//!
//! Sole owner of customer-service state transitions:
//!
//! ```text
//! (create) ─▶ pending ──(provision job synced)──▶ active
//!                ▲                                  │
//!                └──────── activate ── suspended ◀──┘ suspend
//!
//! pending / active / suspended ──cancel──▶ cancelled (terminal)
//! ```
//!
//! Every transition writes an audit entry and enqueues exactly one sync job.
//! Nothing here waits on a device: `activate` returns once the service is
//! pending and its job is queued.

use chrono::{DateTime, Duration, Utc};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::engine::queue::{JobQueue, NewJob};
use crate::error::{Error, Result};
use crate::locks::KeyedLocks;
use crate::model::{
    AuditEvent, CustomerId, CustomerService, EntityRef, IpAddress, JobId, PushParams, RouterId,
    ServiceId, ServiceStatus, SubnetId, SyncAction, SyncJob,
};
use crate::pool::IpPool;
use crate::subnet::SubnetRegistry;
use crate::traits::{ProvisioningStore, ServiceFilter};

/// Request to create a customer service
#[derive(Debug, Clone)]
pub struct NewService {
    pub customer_id: CustomerId,
    pub router_id: RouterId,
    /// Draw from this subnet only; otherwise any subnet of the router
    pub subnet_id: Option<SubnetId>,
    /// Operator-chosen address, allocated at provisioning time
    pub address: Option<Ipv4Addr>,
}

impl NewService {
    pub fn new(customer_id: CustomerId, router_id: RouterId) -> Self {
        Self {
            customer_id,
            router_id,
            subnet_id: None,
            address: None,
        }
    }

    pub fn in_subnet(mut self, subnet_id: SubnetId) -> Self {
        self.subnet_id = Some(subnet_id);
        self
    }

    pub fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.address = Some(address);
        self
    }
}

/// Customer service state machine
///
/// Transitions of one service are serialized: each holds the service's lock
/// from the read through the pool change, the write and the enqueue.
#[derive(Clone)]
pub struct ServiceLifecycle {
    store: Arc<dyn ProvisioningStore>,
    audit: AuditLog,
    registry: SubnetRegistry,
    pool: IpPool,
    queue: JobQueue,
    locks: KeyedLocks<ServiceId>,
}

impl ServiceLifecycle {
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        audit: AuditLog,
        registry: SubnetRegistry,
        pool: IpPool,
        queue: JobQueue,
    ) -> Self {
        Self {
            store,
            audit,
            registry,
            pool,
            queue,
            locks: KeyedLocks::default(),
        }
    }

    /// Record a new service in `pending` without touching the pool
    pub async fn create_service(&self, request: NewService) -> Result<CustomerService> {
        if let Some(subnet) = request.subnet_id {
            let subnet = self.registry.get_subnet(subnet).await?;
            if subnet.router_id != request.router_id {
                return Err(Error::conflict(format!(
                    "{} is served by {}, not {}",
                    subnet.id, subnet.router_id, request.router_id
                )));
            }
        }

        let now = Utc::now();
        let service = CustomerService {
            id: ServiceId(self.store.next_id().await?),
            customer_id: request.customer_id,
            router_id: request.router_id,
            subnet_id: request.subnet_id,
            address_id: None,
            address: None,
            status: ServiceStatus::Pending,
            suspension_reason: None,
            suspended_at: None,
            suspended_until: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_service(&service).await?;

        info!(service = %service.id, customer = %service.customer_id, router = %service.router_id, "Created service");
        self.audit
            .record(
                EntityRef::Service(service.id),
                AuditEvent::ServiceTransition {
                    from: None,
                    to: ServiceStatus::Pending,
                },
            )
            .await;
        Ok(service)
    }

    /// Create a service and activate it in one step
    ///
    /// With an operator-chosen address, that address is allocated before
    /// activation; if it is unavailable the service is left pending without
    /// an address and the error is returned.
    pub async fn provision(&self, request: NewService) -> Result<CustomerService> {
        let address = request.address;
        if let Some(address) = address {
            let subnet = self
                .registry
                .subnet_for_address(address)
                .await?
                .ok_or_else(|| Error::unknown_address(address))?;
            if subnet.router_id != request.router_id
                || request.subnet_id.is_some_and(|id| id != subnet.id)
            {
                return Err(Error::conflict(format!(
                    "{} belongs to {} on {}",
                    address, subnet.id, subnet.router_id
                )));
            }
        }
        let service = self.create_service(request).await?;
        let _guard = self.locks.lock(service.id).await;

        if let Some(address) = address {
            let row = self.pool.allocate_specific(address, service.id).await?;
            self.attach(&service, &row).await?;
        }

        self.activate_held(service.id).await
    }

    /// Move a service to `pending`, allocating an address if none is held,
    /// and enqueue a provision job
    ///
    /// # Errors
    ///
    /// - `Conflict`: the service is already active or cancelled
    /// - `PoolExhausted`: no address could be allocated
    /// - `MaxRetriesExceeded`: its provision job is parked at the retry
    ///   bound and needs a forced retry
    pub async fn activate(&self, id: ServiceId) -> Result<CustomerService> {
        let _guard = self.locks.lock(id).await;
        self.activate_held(id).await
    }

    async fn activate_held(&self, id: ServiceId) -> Result<CustomerService> {
        let current = self.get_service(id).await?;
        match current.status {
            ServiceStatus::Active => {
                return Err(Error::conflict(format!("{} is already active", id)));
            }
            ServiceStatus::Cancelled => {
                return Err(Error::conflict(format!("{} is cancelled", id)));
            }
            ServiceStatus::Pending | ServiceStatus::Suspended => {}
        }
        self.queue.check_retry_bound(id, SyncAction::Provision).await?;

        let mut next = current.clone();
        let fresh = match current.address_id {
            Some(_) => None,
            None => {
                let row = self.allocate_for(&current).await?;
                next.address_id = Some(row.id);
                next.address = Some(row.address);
                Some(row)
            }
        };

        next.status = ServiceStatus::Pending;
        next.suspension_reason = None;
        next.suspended_at = None;
        next.suspended_until = None;
        next.updated_at = Utc::now();

        if !self.store.update_service(current.status, &next).await? {
            if let Some(row) = fresh {
                self.pool.release(row.address).await?;
            }
            return Err(Error::conflict(format!("{} changed concurrently", id)));
        }

        info!(service = %id, address = ?next.address, "Activating service");
        self.transition(&next, Some(current.status), None).await;
        self.enqueue(&next, SyncAction::Provision).await?;
        Ok(next)
    }

    /// Suspend an active service, releasing its address, and enqueue a
    /// deprovision job
    ///
    /// # Errors
    ///
    /// - `Conflict`: the service is not active
    pub async fn suspend(
        &self,
        id: ServiceId,
        reason: impl Into<String>,
        duration_days: Option<u32>,
    ) -> Result<CustomerService> {
        let _guard = self.locks.lock(id).await;
        let current = self.get_service(id).await?;
        if current.status != ServiceStatus::Active {
            return Err(Error::conflict(format!(
                "cannot suspend {}: it is {}, not active",
                id, current.status
            )));
        }

        let now = Utc::now();
        let until = match duration_days {
            Some(days) => Some(
                now.checked_add_signed(Duration::days(i64::from(days)))
                    .ok_or_else(|| {
                        Error::Other(format!("suspension of {} days is out of range", days))
                    })?,
            ),
            None => None,
        };
        let reason = reason.into();
        let mut next = current.clone();
        next.status = ServiceStatus::Suspended;
        next.suspension_reason = Some(reason.clone());
        next.suspended_at = Some(now);
        next.suspended_until = until;
        next.address_id = None;
        next.address = None;
        next.updated_at = now;

        if !self
            .store
            .update_service(ServiceStatus::Active, &next)
            .await?
        {
            return Err(Error::conflict(format!("{} changed concurrently", id)));
        }
        if let Some(address) = current.address {
            self.pool.release(address).await?;
        }

        info!(service = %id, %reason, until = ?next.suspended_until, "Suspended service");
        self.transition(&next, Some(ServiceStatus::Active), Some(reason))
            .await;

        let mut job = self.desired_job(&current, SyncAction::Deprovision).await?;
        job.params.reason = next.suspension_reason.clone();
        job.params.until = next.suspended_until;
        self.queue.enqueue(job).await?;
        Ok(next)
    }

    /// Cancel a service from any non-terminal state
    pub async fn cancel(&self, id: ServiceId) -> Result<CustomerService> {
        let _guard = self.locks.lock(id).await;
        let current = self.get_service(id).await?;
        if current.status.is_terminal() {
            return Err(Error::conflict(format!("{} is already cancelled", id)));
        }

        let mut next = current.clone();
        next.status = ServiceStatus::Cancelled;
        next.address_id = None;
        next.address = None;
        next.updated_at = Utc::now();

        if !self.store.update_service(current.status, &next).await? {
            return Err(Error::conflict(format!("{} changed concurrently", id)));
        }
        if let Some(address) = current.address {
            self.pool.release(address).await?;
        }

        info!(service = %id, "Cancelled service");
        self.transition(&next, Some(current.status), None).await;

        let job = self.desired_job(&current, SyncAction::Deprovision).await?;
        self.queue.enqueue(job).await?;
        Ok(next)
    }

    /// Promote a pending service to active after its provision job synced
    ///
    /// Returns `false` when the service moved on in the meantime (suspended,
    /// cancelled, or already active).
    pub async fn confirm_provisioned(&self, id: ServiceId, job: JobId) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let current = self.get_service(id).await?;
        if current.status != ServiceStatus::Pending {
            debug!(service = %id, status = %current.status, %job, "Not promoting");
            return Ok(false);
        }
        if current.address_id.is_none() {
            warn!(service = %id, %job, "Pending service holds no address, not promoting");
            return Ok(false);
        }

        let mut next = current;
        next.status = ServiceStatus::Active;
        next.updated_at = Utc::now();
        if !self
            .store
            .update_service(ServiceStatus::Pending, &next)
            .await?
        {
            return Ok(false);
        }

        info!(service = %id, %job, "Service active");
        self.transition(
            &next,
            Some(ServiceStatus::Pending),
            Some(format!("confirmed by {}", job)),
        )
        .await;
        Ok(true)
    }

    /// Re-activate suspensions whose end date has passed
    ///
    /// Failures are logged per service and do not stop the sweep.
    pub async fn resume_expired(&self, now: DateTime<Utc>) -> Result<Vec<ServiceId>> {
        let expired = self
            .store
            .list_services(&ServiceFilter::all().status(ServiceStatus::Suspended))
            .await?
            .into_iter()
            .filter(|s| s.suspended_until.is_some_and(|until| until <= now));

        let mut resumed = Vec::new();
        for service in expired {
            match self.activate(service.id).await {
                Ok(_) => resumed.push(service.id),
                Err(e) => warn!(service = %service.id, "Failed to resume expired suspension: {}", e),
            }
        }
        Ok(resumed)
    }

    pub async fn get_service(&self, id: ServiceId) -> Result<CustomerService> {
        self.store
            .get_service(id)
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    pub async fn list_services(&self, filter: &ServiceFilter) -> Result<Vec<CustomerService>> {
        self.store.list_services(filter).await
    }

    /// Job that brings the router in line with the service's current state
    pub(crate) async fn sync_job_for(&self, service: &CustomerService) -> Result<NewJob> {
        let action = match service.status {
            ServiceStatus::Pending | ServiceStatus::Active => SyncAction::Provision,
            ServiceStatus::Suspended => SyncAction::SuspendConfig,
            ServiceStatus::Cancelled => {
                return Err(Error::conflict(format!(
                    "{} is cancelled; nothing to sync",
                    service.id
                )));
            }
        };
        let mut job = self.desired_job(service, action).await?;
        if service.status == ServiceStatus::Suspended {
            job.params.reason = service.suspension_reason.clone();
            job.params.until = service.suspended_until;
        }
        Ok(job)
    }

    async fn enqueue(&self, service: &CustomerService, action: SyncAction) -> Result<SyncJob> {
        let job = self.desired_job(service, action).await?;
        self.queue.enqueue(job).await
    }

    async fn desired_job(&self, service: &CustomerService, action: SyncAction) -> Result<NewJob> {
        let mut params = PushParams {
            service_id: Some(service.id),
            customer_id: Some(service.customer_id),
            address: service.address,
            ..PushParams::default()
        };
        if let Some(address) = service.address
            && let Some(subnet) = self.registry.subnet_for_address(address).await?
        {
            params.gateway = subnet.gateway;
            params.prefix_len = Some(subnet.cidr.prefix_len());
        }

        Ok(NewJob {
            router_id: service.router_id,
            service_id: Some(service.id),
            address_id: service.address_id,
            action,
            params,
        })
    }

    async fn allocate_for(&self, service: &CustomerService) -> Result<IpAddress> {
        if let Some(subnet) = service.subnet_id {
            return self.pool.allocate(subnet, service.id).await;
        }

        let subnets = self.registry.subnets_for_router(service.router_id).await?;
        let mut exhausted = None;
        for subnet in subnets {
            match self.pool.allocate(subnet.id, service.id).await {
                Ok(row) => return Ok(row),
                Err(Error::PoolExhausted(id)) => exhausted = Some(id),
                Err(e) => return Err(e),
            }
        }
        Err(match exhausted {
            Some(id) => Error::PoolExhausted(id),
            None => Error::not_found(format!("no subnet registered for {}", service.router_id)),
        })
    }

    async fn attach(&self, service: &CustomerService, row: &IpAddress) -> Result<()> {
        let mut next = service.clone();
        next.address_id = Some(row.id);
        next.address = Some(row.address);
        next.updated_at = Utc::now();
        if !self.store.update_service(service.status, &next).await? {
            self.pool.release(row.address).await?;
            return Err(Error::conflict(format!("{} changed concurrently", service.id)));
        }
        Ok(())
    }

    async fn transition(
        &self,
        service: &CustomerService,
        from: Option<ServiceStatus>,
        message: Option<String>,
    ) {
        let entity = EntityRef::Service(service.id);
        let event = AuditEvent::ServiceTransition {
            from,
            to: service.status,
        };
        match message {
            Some(message) => self.audit.record_with(entity, event, message).await,
            None => self.audit.record(entity, event).await,
        }
    }
}
