//! Wiring of the provisioning core
//!
//! [`NetsyncCore`] builds every component over one store and one driver and
//! hands back the streams an embedder can observe.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::audit::{AuditLog, AuditStream};
use crate::config::NetsyncConfig;
use crate::engine::queue::JobQueue;
use crate::engine::{ReconcilerEvent, SyncReconciler};
use crate::error::Result;
use crate::lifecycle::ServiceLifecycle;
use crate::pool::IpPool;
use crate::registry::PluginRegistry;
use crate::subnet::SubnetRegistry;
use crate::traits::{DeviceDriver, ProvisioningStore};

/// Observation streams of a running core
pub struct CoreStreams {
    /// Reconciler events (job outcomes, drift, start/stop)
    pub events: mpsc::Receiver<ReconcilerEvent>,
    /// Mirrored audit entries
    pub audit: AuditStream,
}

/// The assembled provisioning core
///
/// Cheap to clone: every component is a handle over shared state.
#[derive(Clone)]
pub struct NetsyncCore {
    store: Arc<dyn ProvisioningStore>,
    subnets: SubnetRegistry,
    pool: IpPool,
    lifecycle: ServiceLifecycle,
    reconciler: SyncReconciler,
    audit: AuditLog,
}

impl NetsyncCore {
    /// Assemble the core over an existing store and driver
    pub fn new(
        config: NetsyncConfig,
        store: Arc<dyn ProvisioningStore>,
        driver: Arc<dyn DeviceDriver>,
    ) -> Result<(Self, CoreStreams)> {
        config.validate()?;

        let (audit, audit_stream) =
            AuditLog::new(Arc::clone(&store), config.reconciler.event_channel_capacity);
        let subnets = SubnetRegistry::new(Arc::clone(&store), audit.clone(), config.pool.clone());
        let pool = IpPool::new(Arc::clone(&store), audit.clone(), &subnets, config.pool.clone());
        let (queue, wakeups) = JobQueue::new(Arc::clone(&store), audit.clone());
        let lifecycle = ServiceLifecycle::new(
            Arc::clone(&store),
            audit.clone(),
            subnets.clone(),
            pool.clone(),
            queue.clone(),
        );
        let (reconciler, events) = SyncReconciler::new(
            Arc::clone(&store),
            driver,
            queue,
            wakeups,
            lifecycle.clone(),
            pool.clone(),
            audit.clone(),
            config.reconciler,
        )?;

        let core = Self {
            store,
            subnets,
            pool,
            lifecycle,
            reconciler,
            audit,
        };
        Ok((
            core,
            CoreStreams {
                events,
                audit: audit_stream,
            },
        ))
    }

    /// Create store and driver through the registry, then assemble
    pub async fn from_config(
        config: NetsyncConfig,
        registry: &PluginRegistry,
    ) -> Result<(Self, CoreStreams)> {
        config.validate()?;

        let store = registry.create_store(&config.store).await?;
        let driver = registry.create_driver(&config.driver)?;
        info!(
            store = config.store.type_name(),
            driver = driver.driver_name(),
            "Provisioning core assembled"
        );
        Self::new(config, store, driver)
    }

    pub fn subnets(&self) -> &SubnetRegistry {
        &self.subnets
    }

    pub fn pool(&self) -> &IpPool {
        &self.pool
    }

    pub fn lifecycle(&self) -> &ServiceLifecycle {
        &self.lifecycle
    }

    pub fn reconciler(&self) -> &SyncReconciler {
        &self.reconciler
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store(&self) -> &Arc<dyn ProvisioningStore> {
        &self.store
    }
}
