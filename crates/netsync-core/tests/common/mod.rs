//! Test doubles and common utilities for architecture contract tests
//!
//! This module provides a scripted device driver that records every call,
//! and a harness that assembles the core over it.

#![allow(dead_code)]

use async_trait::async_trait;
use netsync_core::error::{Error, Result};
use netsync_core::model::{
    CustomerId, CustomerService, PushParams, RouterId, ServiceId, Subnet, SyncAction,
};
use netsync_core::traits::{DeviceBinding, DeviceDriver, DeviceState, ProvisioningStore};
use netsync_core::{CoreStreams, MemoryStore, NetsyncConfig, NetsyncCore, NewService, NewSubnet};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What the next push does
#[derive(Debug, Clone)]
pub enum PushOutcome {
    Accept,
    Reject(&'static str),
    /// Fails with an error no retry would fix
    Broken(&'static str),
    /// Never completes on its own; only the push timeout ends it
    Hang,
}

/// One completed push
#[derive(Debug, Clone)]
pub struct PushRecord {
    pub router: RouterId,
    pub action: SyncAction,
    pub params: PushParams,
    pub started: Instant,
    pub finished: Instant,
    pub accepted: bool,
}

/// A DeviceDriver whose outcomes are scripted by the test
///
/// Outcomes are consumed in call order; once the script is empty every
/// push is accepted. Accepted pushes update a per-router binding table,
/// reported by `query_state` when state reporting is enabled.
pub struct ScriptedDriver {
    script: Mutex<VecDeque<PushOutcome>>,
    delay: Mutex<HashMap<RouterId, Duration>>,
    query_delay: Mutex<Option<Duration>>,
    pushes: Mutex<Vec<PushRecord>>,
    bindings: Mutex<HashMap<RouterId, BTreeMap<Ipv4Addr, Option<ServiceId>>>>,
    reports_state: bool,
    push_calls: AtomicUsize,
    query_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    router_in_flight: Mutex<HashMap<RouterId, usize>>,
    max_router_in_flight: AtomicUsize,
}

impl ScriptedDriver {
    /// Driver that accepts everything and cannot report state
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Driver that also reports its binding table from `query_state`
    pub fn with_state() -> Self {
        Self::build(true)
    }

    fn build(reports_state: bool) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(HashMap::new()),
            query_delay: Mutex::new(None),
            pushes: Mutex::new(Vec::new()),
            bindings: Mutex::new(HashMap::new()),
            reports_state,
            push_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            router_in_flight: Mutex::new(HashMap::new()),
            max_router_in_flight: AtomicUsize::new(0),
        }
    }

    /// Queue outcomes for the next pushes
    pub fn script(self, outcomes: impl IntoIterator<Item = PushOutcome>) -> Self {
        self.script.lock().unwrap().extend(outcomes);
        self
    }

    /// Make every push to `router` take `delay`
    pub fn slow(self, router: RouterId, delay: Duration) -> Self {
        self.delay.lock().unwrap().insert(router, delay);
        self
    }

    /// Make every `query_state` call take `delay`
    pub fn slow_queries(self, delay: Duration) -> Self {
        *self.query_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.pushes.lock().unwrap().clone()
    }

    /// Highest number of pushes in flight at once, across routers
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of pushes in flight at once to a single router
    pub fn max_router_in_flight(&self) -> usize {
        self.max_router_in_flight.load(Ordering::SeqCst)
    }

    /// Simulate an out-of-band change on the router
    pub fn remove_binding(&self, router: RouterId, address: Ipv4Addr) {
        if let Some(table) = self.bindings.lock().unwrap().get_mut(&router) {
            table.remove(&address);
        }
    }

    pub fn add_binding(&self, router: RouterId, address: Ipv4Addr, service: Option<ServiceId>) {
        self.bindings
            .lock()
            .unwrap()
            .entry(router)
            .or_default()
            .insert(address, service);
    }

    pub fn bound(&self, router: RouterId, address: Ipv4Addr) -> bool {
        self.bindings
            .lock()
            .unwrap()
            .get(&router)
            .is_some_and(|table| table.contains_key(&address))
    }

    fn enter(&self, router: RouterId) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut routers = self.router_in_flight.lock().unwrap();
        let count = routers.entry(router).or_default();
        *count += 1;
        self.max_router_in_flight.fetch_max(*count, Ordering::SeqCst);

        InFlight {
            driver: self,
            router,
        }
    }
}

/// Decrements the in-flight counters even when the push is cancelled
struct InFlight<'a> {
    driver: &'a ScriptedDriver,
    router: RouterId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.driver.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self
            .driver
            .router_in_flight
            .lock()
            .unwrap()
            .get_mut(&self.router)
        {
            *count -= 1;
        }
    }
}

#[async_trait]
impl DeviceDriver for ScriptedDriver {
    async fn push_config(&self, router: RouterId, action: SyncAction, params: &PushParams) -> Result<()> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PushOutcome::Accept);
        let delay = self.delay.lock().unwrap().get(&router).copied();

        let _guard = self.enter(router);
        let started = Instant::now();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = match outcome {
            PushOutcome::Accept => Ok(()),
            PushOutcome::Reject(reason) => Err(Error::device_rejected(router, reason)),
            PushOutcome::Broken(reason) => Err(Error::config(reason)),
            PushOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        };

        if result.is_ok()
            && let Some(address) = params.address
        {
            let mut bindings = self.bindings.lock().unwrap();
            let table = bindings.entry(router).or_default();
            match action {
                SyncAction::Provision => {
                    table.insert(address, params.service_id);
                }
                SyncAction::Deprovision | SyncAction::SuspendConfig => {
                    table.remove(&address);
                }
            }
        }

        self.pushes.lock().unwrap().push(PushRecord {
            router,
            action,
            params: params.clone(),
            started,
            finished: Instant::now(),
            accepted: result.is_ok(),
        });
        result
    }

    async fn query_state(&self, router: RouterId) -> Result<Option<DeviceState>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.query_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.reports_state {
            return Ok(None);
        }
        let bindings = self.bindings.lock().unwrap();
        Ok(Some(DeviceState {
            bindings: bindings
                .get(&router)
                .into_iter()
                .flatten()
                .map(|(address, service_id)| DeviceBinding {
                    address: *address,
                    service_id: *service_id,
                })
                .collect(),
        }))
    }

    fn driver_name(&self) -> &'static str {
        "scripted"
    }
}

/// Configuration with no retry delay and no periodic maintenance
pub fn fast_config() -> NetsyncConfig {
    let mut config = NetsyncConfig::new();
    config.reconciler.push_timeout_ms = 500;
    config.reconciler.retry_delay_secs = 0;
    config.reconciler.poll_interval_secs = 1;
    config.reconciler.drift_interval_secs = 0;
    config.reconciler.drain_timeout_secs = 5;
    config
}

/// The core assembled over a scripted driver
pub struct Harness {
    pub core: NetsyncCore,
    pub streams: CoreStreams,
    pub driver: Arc<ScriptedDriver>,
    pub store: Arc<dyn ProvisioningStore>,
}

pub fn harness(driver: ScriptedDriver) -> Harness {
    harness_with(fast_config(), Arc::new(MemoryStore::new()), driver)
}

pub fn harness_with(
    config: NetsyncConfig,
    store: Arc<dyn ProvisioningStore>,
    driver: ScriptedDriver,
) -> Harness {
    let driver = Arc::new(driver);
    let (core, streams) = NetsyncCore::new(config, Arc::clone(&store), driver.clone())
        .expect("core assembles");
    Harness {
        core,
        streams,
        driver,
        store,
    }
}

impl Harness {
    pub async fn subnet(&self, cidr: &str, router: RouterId) -> Subnet {
        self.core
            .subnets()
            .register_subnet(NewSubnet::new(cidr, router, format!("{} on {}", cidr, router)))
            .await
            .expect("subnet registers")
    }

    /// Provision a service without pushing anything
    pub async fn pending_service(&self, customer: u64, router: RouterId) -> CustomerService {
        self.core
            .lifecycle()
            .provision(NewService::new(CustomerId(customer), router))
            .await
            .expect("service provisions")
    }

    /// Provision a service and push its job
    pub async fn active_service(&self, customer: u64, router: RouterId) -> CustomerService {
        let service = self.pending_service(customer, router).await;
        self.core
            .reconciler()
            .drain_router(router)
            .await
            .expect("router drains");
        self.core
            .lifecycle()
            .get_service(service.id)
            .await
            .expect("service exists")
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
