// # Device Driver Trait
//
// Defines the interface for pushing configuration to routers and reading
// back what they actually carry.
//
// ## Implementations
//
// - Dry run: `DryRunDriver` (logs, never touches a device)
// - Vendor drivers live outside this crate and register a factory
//
// ## Usage
//
// ```rust,ignore
// use netsync_core::{DeviceDriver, model::{RouterId, SyncAction, PushParams}};
//
// async fn push(driver: &dyn DeviceDriver) -> netsync_core::Result<()> {
//     driver
//         .push_config(RouterId(1), SyncAction::Provision, &PushParams::default())
//         .await
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::model::{PushParams, RouterId, ServiceId, SyncAction};

/// One address binding a router reports as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    /// The configured customer address
    pub address: Ipv4Addr,
    /// Service tag found on the device entry, when the driver can read one
    pub service_id: Option<ServiceId>,
}

/// Actual state reported by a router
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub bindings: Vec<DeviceBinding>,
}

impl DeviceState {
    pub fn binding_for(&self, address: Ipv4Addr) -> Option<&DeviceBinding> {
        self.bindings.iter().find(|b| b.address == address)
    }
}

/// Trait for device driver implementations
///
/// # Thread Safety
///
/// Implementations must be thread-safe; the reconciler calls them from one
/// worker task per router, with several routers in flight at once.
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - ✅ Talk to the addressed router only
/// - ✅ Return success or failure (the reconciler handles retry)
///
/// ## Forbidden Capabilities
/// - ❌ Implement retry logic or backoff (owned by `SyncReconciler`)
/// - ❌ Apply its own timeouts longer than the push timeout
/// - ❌ Access the provisioning store
/// - ❌ Spawn tasks or threads (violates shutdown determinism)
///
/// A driver that hangs is cut off by the reconciler's push timeout and the
/// attempt counts as failed.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Apply one action to one router
    ///
    /// Must be idempotent: provisioning an address the router already
    /// carries, or removing one it does not, succeeds.
    ///
    /// # Returns
    ///
    /// - `Ok(())`: The router accepted the configuration
    /// - `Err(Error)`: The router refused or could not be reached
    async fn push_config(
        &self,
        router: RouterId,
        action: SyncAction,
        params: &PushParams,
    ) -> Result<(), crate::Error>;

    /// Read the router's actual address bindings
    ///
    /// # Returns
    ///
    /// - `Ok(Some(DeviceState))`: Current bindings
    /// - `Ok(None)`: This driver cannot report state (drift sweep skips it)
    /// - `Err(Error)`: The router could not be queried
    async fn query_state(&self, _router: RouterId) -> Result<Option<DeviceState>, crate::Error> {
        Ok(None)
    }

    /// Get the driver name (for logging/debugging)
    fn driver_name(&self) -> &'static str;
}

/// Helper trait for constructing device drivers from configuration
pub trait DeviceDriverFactory: Send + Sync {
    /// Create a DeviceDriver instance from configuration
    fn create(
        &self,
        config: &crate::config::DriverConfig,
    ) -> Result<std::sync::Arc<dyn DeviceDriver>, crate::Error>;
}
