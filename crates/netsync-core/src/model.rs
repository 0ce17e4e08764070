//! Persistent records shared by every component
//!
//! The store owns these rows. Components read them, decide, and write them
//! back through status-preconditioned conditional updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::cidr::Cidr;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }
    };
}

id_type!(
    /// Subnet identifier
    SubnetId, "subnet"
);
id_type!(
    /// Pool address identifier
    AddressId, "addr"
);
id_type!(
    /// Customer service identifier
    ServiceId, "svc"
);
id_type!(
    /// Sync job identifier, allocated from the store's monotonic sequence
    JobId, "job"
);
id_type!(
    /// Router reference (routers themselves live in the CRUD layer)
    RouterId, "router"
);
id_type!(
    /// Customer reference
    CustomerId, "cust"
);

/// A registered CIDR block served by one router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: SubnetId,
    pub cidr: Cidr,
    pub router_id: RouterId,
    pub gateway: Option<Ipv4Addr>,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Status of a pool address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    Available,
    Allocated,
    Reserved,
    Released,
}

/// One address in a subnet's pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: AddressId,
    pub subnet_id: SubnetId,
    pub address: Ipv4Addr,
    pub status: AddressStatus,
    pub service_id: Option<ServiceId>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl IpAddress {
    pub(crate) fn new(id: AddressId, subnet_id: SubnetId, address: Ipv4Addr) -> Self {
        Self {
            id,
            subnet_id,
            address,
            status: AddressStatus::Available,
            service_id: None,
            allocated_at: None,
            released_at: None,
        }
    }
}

/// Desired state of a customer's network service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Active,
    Suspended,
    Cancelled,
}

impl ServiceStatus {
    /// Cancelled is the only terminal state
    pub fn is_terminal(self) -> bool {
        self == ServiceStatus::Cancelled
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Active => "active",
            ServiceStatus::Suspended => "suspended",
            ServiceStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A customer's network service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerService {
    pub id: ServiceId,
    pub customer_id: CustomerId,
    pub router_id: RouterId,
    /// Preferred pool; `None` draws from any subnet of the router
    pub subnet_id: Option<SubnetId>,
    /// Address held from the pool (non-owning claim)
    pub address_id: Option<AddressId>,
    pub address: Option<Ipv4Addr>,
    pub status: ServiceStatus,
    pub suspension_reason: Option<String>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspended_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Router action a sync job asks the device driver to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncAction {
    Provision,
    Deprovision,
    SuspendConfig,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncAction::Provision => "provision",
            SyncAction::Deprovision => "deprovision",
            SyncAction::SuspendConfig => "suspend-config",
        };
        f.write_str(s)
    }
}

/// Synchronization status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InSync,
    OutOfSync,
    /// Replaced by a newer job for the same service; never processed again
    Superseded,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InSync => "in_sync",
            SyncStatus::OutOfSync => "out_of_sync",
            SyncStatus::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

/// Parameters handed to the device driver with a push
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushParams {
    pub service_id: Option<ServiceId>,
    pub customer_id: Option<CustomerId>,
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub prefix_len: Option<u8>,
    pub reason: Option<String>,
    pub until: Option<DateTime<Utc>>,
}

/// One unit of reconciliation work (a `router_sync_status` row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: JobId,
    pub router_id: RouterId,
    pub service_id: Option<ServiceId>,
    pub address_id: Option<AddressId>,
    pub action: SyncAction,
    pub params: PushParams,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_synced: Option<DateTime<Utc>>,
    /// Earliest time the reconciler may attempt this job again
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Per-router bookkeeping maintained by the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterCheckpoint {
    pub router_id: RouterId,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Entity an audit entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Subnet(SubnetId),
    Address(AddressId),
    Service(ServiceId),
    Job(JobId),
    Router(RouterId),
}

/// What happened to the entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    SubnetRegistered { cidr: String },
    SubnetUpdated { cidr: String },
    SubnetDeleted { cidr: String },
    AddressAllocated { address: Ipv4Addr, service_id: ServiceId },
    AddressReleased { address: Ipv4Addr },
    AddressReserved { address: Ipv4Addr },
    ServiceTransition { from: Option<ServiceStatus>, to: ServiceStatus },
    JobEnqueued { action: SyncAction },
    JobSuperseded { by: JobId },
    SyncAttempt { success: bool, retry_count: u32, status: SyncStatus },
    JobRetried { retry_count: u32 },
    JobForceRetried { operator: String },
    DriftDetected { detail: String },
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub entity: EntityRef,
    #[serde(flatten)]
    pub event: AuditEvent,
    pub message: Option<String>,
}
