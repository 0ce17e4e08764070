// # Dry-Run Device Driver
//
// Built-in driver that never touches a router.
//
// ## Behavior
//
// - Logs every push at INFO with a "DRY-RUN" marker
// - Always succeeds
// - Remembers the bindings it was told about, per router, and reports them
//   from `query_state` so the drift sweep has something to compare in
//   staging deployments
//
// ## Trust Level: Untrusted (Device Driver)
//
// Single-shot like every driver: no retries, no spawned tasks, no store
// access. The in-memory view is the only state it keeps.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::model::{PushParams, RouterId, ServiceId, SyncAction};
use crate::traits::{DeviceBinding, DeviceDriver, DeviceDriverFactory, DeviceState};

type Bindings = BTreeMap<Ipv4Addr, Option<ServiceId>>;

/// Driver that logs pushes and keeps an in-memory view of each router
#[derive(Debug, Default)]
pub struct DryRunDriver {
    routers: Mutex<HashMap<RouterId, Bindings>>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_router<T>(&self, router: RouterId, f: impl FnOnce(&mut Bindings) -> T) -> T {
        let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        f(routers.entry(router).or_default())
    }
}

#[async_trait]
impl DeviceDriver for DryRunDriver {
    async fn push_config(&self, router: RouterId, action: SyncAction, params: &PushParams) -> Result<()> {
        tracing::info!(
            %router,
            %action,
            address = ?params.address,
            service = ?params.service_id,
            "[DRY-RUN] Would push configuration"
        );

        let Some(address) = params.address else {
            return Ok(());
        };

        self.with_router(router, |bindings| match action {
            SyncAction::Provision => {
                bindings.insert(address, params.service_id);
            }
            SyncAction::Deprovision | SyncAction::SuspendConfig => {
                bindings.remove(&address);
            }
        });
        Ok(())
    }

    async fn query_state(&self, router: RouterId) -> Result<Option<DeviceState>> {
        let bindings = self.with_router(router, |bindings| {
            bindings
                .iter()
                .map(|(address, service_id)| DeviceBinding {
                    address: *address,
                    service_id: *service_id,
                })
                .collect()
        });
        Ok(Some(DeviceState { bindings }))
    }

    fn driver_name(&self) -> &'static str {
        "dry_run"
    }
}

/// Factory for the `dry_run` driver type
pub struct DryRunDriverFactory;

impl DeviceDriverFactory for DryRunDriverFactory {
    fn create(&self, config: &DriverConfig) -> Result<Arc<dyn DeviceDriver>> {
        match config {
            DriverConfig::DryRun => {
                tracing::warn!("Device driver running in DRY-RUN mode - no router will be changed");
                Ok(Arc::new(DryRunDriver::new()))
            }
            other => Err(Error::config(format!(
                "dry_run factory cannot build a '{}' driver",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(address: [u8; 4], service: u64) -> PushParams {
        PushParams {
            service_id: Some(ServiceId(service)),
            address: Some(Ipv4Addr::from(address)),
            ..PushParams::default()
        }
    }

    #[tokio::test]
    async fn view_tracks_pushes_per_router() {
        let driver = DryRunDriver::new();
        driver
            .push_config(RouterId(1), SyncAction::Provision, &params([10, 0, 0, 1], 5))
            .await
            .unwrap();
        driver
            .push_config(RouterId(2), SyncAction::Provision, &params([10, 1, 0, 1], 6))
            .await
            .unwrap();

        let state = driver.query_state(RouterId(1)).await.unwrap().unwrap();
        assert_eq!(state.bindings.len(), 1);
        assert_eq!(
            state.binding_for(Ipv4Addr::new(10, 0, 0, 1)).unwrap().service_id,
            Some(ServiceId(5))
        );

        // Removing twice is fine: pushes are idempotent.
        for _ in 0..2 {
            driver
                .push_config(RouterId(1), SyncAction::Deprovision, &params([10, 0, 0, 1], 5))
                .await
                .unwrap();
        }
        let state = driver.query_state(RouterId(1)).await.unwrap().unwrap();
        assert!(state.bindings.is_empty());
    }

    #[test]
    fn factory_rejects_other_types() {
        let config = DriverConfig::Custom {
            factory: "vendor".into(),
            config: serde_json::json!({}),
        };
        assert!(DryRunDriverFactory.create(&config).is_err());
        assert!(DryRunDriverFactory.create(&DriverConfig::DryRun).is_ok());
    }
}
