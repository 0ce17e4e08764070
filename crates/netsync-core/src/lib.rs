// # netsync-core
//
// Core library for ISP network provisioning reconciliation.
//
// ## Architecture Overview
//
// This library keeps recorded provisioning state and router configuration
// in agreement:
// - **SubnetRegistry**: CIDR blocks with no overlap, each enumerated into a pool
// - **IpPool**: Per-subnet serialized address allocation and release
// - **ServiceLifecycle**: The customer-service state machine
// - **SyncReconciler**: Background loop pushing sync jobs to routers with
//   bounded retry, per-router FIFO ordering and drift detection
// - **DeviceDriver**: Trait for pushing configuration to a router
// - **ProvisioningStore**: Trait for persistence with conditional row updates
// - **PluginRegistry**: Factories for drivers and stores by type name
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from device and storage backends
// 2. **Asynchronous Device I/O**: Foreground calls enqueue work and never wait on a router
// 3. **Plugin-Based**: Drivers and stores are registered dynamically
// 4. **Library-First**: The daemon is a thin shell over this crate
// 5. **Optimistic Updates**: Every row mutation is preconditioned on the status it was read in

pub mod audit;
pub mod cidr;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod lifecycle;
mod locks;
pub mod model;
pub mod netsync;
pub mod pool;
pub mod registry;
pub mod state;
pub mod subnet;
pub mod traits;

// Re-export core types for convenience
pub use audit::{AuditLog, AuditStream};
pub use cidr::Cidr;
pub use config::{DriverConfig, NetsyncConfig, PoolConfig, ReconcilerConfig, StoreConfig};
pub use driver::DryRunDriver;
pub use engine::queue::{JobQueue, NewJob};
pub use engine::{
    DriftReport, JobOutcome, MAX_RETRIES, ReconcilerEvent, Step, SyncHealth, SyncReconciler,
    SyncTarget,
};
pub use error::{Error, Result};
pub use lifecycle::{NewService, ServiceLifecycle};
pub use netsync::{CoreStreams, NetsyncCore};
pub use pool::{Availability, IpPool, PoolUsage};
pub use registry::PluginRegistry;
pub use state::{FileStore, MemoryStore};
pub use subnet::{NewSubnet, OverlapReport, SubnetRegistry, SubnetUpdate};
pub use traits::{DeviceDriver, ProvisioningStore};
