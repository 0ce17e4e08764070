//! Core traits for the provisioning core
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`DeviceDriver`]: Push configuration to routers and read their state
//! - [`ProvisioningStore`]: Persistent storage with conditional row updates

pub mod device_driver;
pub mod store;

pub use device_driver::{DeviceBinding, DeviceDriver, DeviceDriverFactory, DeviceState};
pub use store::{JobFilter, ProvisioningStore, ServiceFilter, StoreFactory};
