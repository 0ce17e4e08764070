//! Minimal embedding example for netsync-core
//!
//! A host application owns the runtime, supplies its own device driver,
//! drives the lifecycle API and lets the reconciler push in the background.

use async_trait::async_trait;
use netsync_core::model::{CustomerId, PushParams, RouterId, SyncAction};
use netsync_core::traits::{DeviceBinding, DeviceState};
use netsync_core::{
    DeviceDriver, Error, MemoryStore, NetsyncConfig, NetsyncCore, NewService, NewSubnet, Result,
    SyncTarget,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

/// Lab router that rejects its first push, then behaves
struct FlakyLabRouter {
    pushes: AtomicUsize,
    bindings: Mutex<HashMap<RouterId, Vec<Ipv4Addr>>>,
}

impl FlakyLabRouter {
    fn new() -> Self {
        Self {
            pushes: AtomicUsize::new(0),
            bindings: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeviceDriver for FlakyLabRouter {
    async fn push_config(&self, router: RouterId, action: SyncAction, params: &PushParams) -> Result<()> {
        if self.pushes.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::device_rejected(router, "config session locked"));
        }

        let mut bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let entries = bindings.entry(router).or_default();
        if let Some(address) = params.address {
            entries.retain(|a| *a != address);
            if action == SyncAction::Provision {
                entries.push(address);
            }
        }
        Ok(())
    }

    async fn query_state(&self, router: RouterId) -> Result<Option<DeviceState>> {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Some(DeviceState {
            bindings: bindings
                .get(&router)
                .into_iter()
                .flatten()
                .map(|address| DeviceBinding {
                    address: *address,
                    service_id: None,
                })
                .collect(),
        }))
    }

    fn driver_name(&self) -> &'static str {
        "flaky_lab_router"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let mut config = NetsyncConfig::new();
    config.reconciler.retry_delay_secs = 1;
    config.reconciler.poll_interval_secs = 1;
    config.reconciler.drift_interval_secs = 0;

    let (core, streams) = NetsyncCore::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(FlakyLabRouter::new()),
    )?;

    let mut audit = streams.audit;
    tokio::spawn(async move {
        while let Some(entry) = audit.next().await {
            println!("audit #{} {:?} {:?}", entry.seq, entry.entity, entry.event);
        }
    });

    let router = RouterId(1);
    let subnet = core
        .subnets()
        .register_subnet(
            NewSubnet::new("100.64.0.0/29", router, "lab access").with_gateway(Ipv4Addr::new(100, 64, 0, 1)),
        )
        .await?;
    println!("registered {} ({})", subnet.cidr, subnet.id);

    let overlap = core.subnets().check_overlap("100.64.0.4/30", None).await?;
    println!("100.64.0.4/30 overlaps: {}", overlap.overlaps);

    let alice = core
        .lifecycle()
        .provision(NewService::new(CustomerId(1001), router))
        .await?;
    let bob = core
        .lifecycle()
        .provision(NewService::new(CustomerId(1002), router))
        .await?;
    println!("alice pending on {:?}, bob pending on {:?}", alice.address, bob.address);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let reconciler = core.reconciler().clone();
    let running = tokio::spawn(async move { reconciler.run_with_shutdown(Some(shutdown_rx)).await });

    // The first push fails and is retried after the one-second delay.
    tokio::time::sleep(Duration::from_secs(3)).await;

    core.lifecycle().suspend(bob.id, "non-payment", Some(30)).await?;
    core.reconciler()
        .enqueue_manual_sync(SyncTarget::Service(alice.id))
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let _ = shutdown_tx.send(());
    running.await??;

    for id in [alice.id, bob.id] {
        let service = core.lifecycle().get_service(id).await?;
        println!("{} is {} at {:?}", service.id, service.status, service.address);
    }

    let usage = core.pool().pool_usage(subnet.id).await?;
    println!(
        "pool: {} allocated, {} available, {} reserved",
        usage.allocated, usage.available, usage.reserved
    );

    let health = core.reconciler().sync_health(None).await?;
    println!("sync health: {:.1}% of {} job(s)", health.percentage, health.total);

    if let Some(checked) = core.reconciler().router_last_checked(router).await? {
        println!("{} last checked at {}", router, checked);
    }

    Ok(())
}
