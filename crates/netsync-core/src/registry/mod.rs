//! Plugin-based registry for device drivers and stores
//!
//! Drivers and stores are registered by type name at startup and created
//! from configuration, so the daemon never hardcodes a backend.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use netsync_core::registry::PluginRegistry;
//! use netsync_core::config::DriverConfig;
//!
//! let registry = PluginRegistry::with_builtins();
//!
//! // Vendor crates add their own factories
//! registry.register_driver("routeros", Box::new(RouterOsFactory));
//!
//! let driver = registry.create_driver(&DriverConfig::DryRun)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{DriverConfig, StoreConfig};
use crate::driver::DryRunDriverFactory;
use crate::error::{Error, Result};
use crate::state::{FileStoreFactory, MemoryStoreFactory};
use crate::traits::{DeviceDriver, DeviceDriverFactory, ProvisioningStore, StoreFactory};

/// Registry of driver and store factories
///
/// ## Thread Safety
///
/// Interior mutability with RwLock: concurrent lookups, exclusive
/// registration. A poisoned lock is recovered, since the maps hold no
/// invariant a panicking writer could break.
#[derive(Default)]
pub struct PluginRegistry {
    /// Registered device driver factories
    drivers: RwLock<HashMap<String, Arc<dyn DeviceDriverFactory>>>,

    /// Registered store factories
    stores: RwLock<HashMap<String, Arc<dyn StoreFactory>>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `dry_run` driver and `memory`/`file` stores
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_driver("dry_run", Box::new(DryRunDriverFactory));
        registry.register_store("memory", Box::new(MemoryStoreFactory));
        registry.register_store("file", Box::new(FileStoreFactory));
        registry
    }

    /// Register a device driver factory under a type name
    pub fn register_driver(&self, name: impl Into<String>, factory: Box<dyn DeviceDriverFactory>) {
        let mut drivers = self.drivers.write().unwrap_or_else(|e| e.into_inner());
        drivers.insert(name.into(), Arc::from(factory));
    }

    /// Register a store factory under a type name
    pub fn register_store(&self, name: impl Into<String>, factory: Box<dyn StoreFactory>) {
        let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
        stores.insert(name.into(), Arc::from(factory));
    }

    /// Create a device driver from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Arc<dyn DeviceDriver>)`: Created driver
    /// - `Err(Error::Config)`: Driver type is not registered, or the
    ///   factory rejected the configuration
    pub fn create_driver(&self, config: &DriverConfig) -> Result<Arc<dyn DeviceDriver>> {
        let driver_type = config.type_name();
        let factory = self
            .drivers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(driver_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown driver type: {}", driver_type)))?;

        factory.create(config)
    }

    /// Create a store from configuration
    pub async fn create_store(&self, config: &StoreConfig) -> Result<Arc<dyn ProvisioningStore>> {
        let store_type = config.type_name();

        // Clone the factory out so the lock is not held across the await.
        let factory = self
            .stores
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(store_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown store type: {}", store_type)))?;

        factory.create(config).await
    }

    /// List all registered driver types
    pub fn list_drivers(&self) -> Vec<String> {
        let drivers = self.drivers.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// List all registered store types
    pub fn list_stores(&self) -> Vec<String> {
        let stores = self.stores.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = stores.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_driver(&self, name: &str) -> bool {
        let drivers = self.drivers.read().unwrap_or_else(|e| e.into_inner());
        drivers.contains_key(name)
    }

    pub fn has_store(&self, name: &str) -> bool {
        let stores = self.stores.read().unwrap_or_else(|e| e.into_inner());
        stores.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectingFactory;

    impl DeviceDriverFactory for RejectingFactory {
        fn create(&self, _config: &DriverConfig) -> Result<Arc<dyn DeviceDriver>> {
            Err(Error::config("vendor driver needs credentials"))
        }
    }

    #[test]
    fn test_registry_registration() {
        let registry = PluginRegistry::new();
        assert!(!registry.has_driver("vendor"));

        registry.register_driver("vendor", Box::new(RejectingFactory));

        assert!(registry.has_driver("vendor"));
        assert_eq!(registry.list_drivers(), vec!["vendor".to_string()]);

        let config = DriverConfig::Custom {
            factory: "vendor".into(),
            config: serde_json::json!({ "host": "10.0.0.1" }),
        };
        assert!(matches!(registry.create_driver(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn builtins_create_from_config() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.list_stores(), vec!["file".to_string(), "memory".to_string()]);

        let driver = registry.create_driver(&DriverConfig::DryRun).unwrap();
        assert_eq!(driver.driver_name(), "dry_run");
        assert!(registry.create_store(&StoreConfig::Memory).await.is_ok());

        let unknown = StoreConfig::Custom {
            factory: "postgres".into(),
            config: serde_json::Value::Null,
        };
        assert!(matches!(
            registry.create_store(&unknown).await,
            Err(Error::Config(_))
        ));
    }
}
