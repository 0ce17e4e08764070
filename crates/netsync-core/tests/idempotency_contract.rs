//! Architectural Contract Test: State Model & Idempotency
//!
//! This test verifies that the state model survives restarts and that
//! repeating an operation does not repeat its effect.
//!
//! Constraints verified:
//! - Subnets, pools, services and jobs are persisted by the file store
//! - Pending jobs left by a stopped process are pushed after a restart
//! - A job already in sync is not pushed again after a restart
//! - Releasing an address that is already free changes nothing
//!
//! If this test fails, state management is broken.

mod common;

use common::*;
use netsync_core::model::{AddressStatus, RouterId, ServiceStatus, SyncStatus};
use netsync_core::traits::{JobFilter, ProvisioningStore};
use netsync_core::{FileStore, JobOutcome};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::assert_ok;

#[tokio::test]
async fn pending_jobs_resume_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let state_file = temp_dir.path().join("state.json");
    let router = RouterId(1);

    let (settled, waiting) = {
        let store = Arc::new(FileStore::new(&state_file).await.unwrap());
        let h = harness_with(fast_config(), store, ScriptedDriver::new());
        h.subnet("10.0.0.0/29", router).await;
        let settled = h.active_service(1, router).await;
        let waiting = h.pending_service(2, router).await;
        assert_ok!(h.store.flush().await);
        (settled, waiting)
    };

    // Restart: a fresh store over the same file, a fresh driver.
    let store = Arc::new(FileStore::new(&state_file).await.unwrap());
    let h = harness_with(fast_config(), store, ScriptedDriver::new());

    let subnets = h.core.subnets().list_subnets().await.unwrap();
    assert_eq!(subnets.len(), 1);
    let usage = h.core.pool().pool_usage(subnets[0].id).await.unwrap();
    assert_eq!(usage.allocated, 2);

    let outcomes = h.core.reconciler().run_pending().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], JobOutcome::Synced(_)));

    // Only the job left pending was pushed.
    let pushes = h.driver.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].params.service_id, Some(waiting.id));

    let settled = h.core.lifecycle().get_service(settled.id).await.unwrap();
    let waiting = h.core.lifecycle().get_service(waiting.id).await.unwrap();
    assert_eq!(settled.status, ServiceStatus::Active);
    assert_eq!(waiting.status, ServiceStatus::Active);
    assert_ne!(settled.address, waiting.address);
}

#[tokio::test]
async fn ids_keep_increasing_across_restarts() {
    let temp_dir = TempDir::new().unwrap();
    let state_file = temp_dir.path().join("state.json");
    let router = RouterId(1);

    let first = {
        let store = Arc::new(FileStore::new(&state_file).await.unwrap());
        let h = harness_with(fast_config(), store, ScriptedDriver::new());
        h.subnet("10.0.0.0/29", router).await;
        h.pending_service(1, router).await
    };

    let store = Arc::new(FileStore::new(&state_file).await.unwrap());
    let h = harness_with(fast_config(), store, ScriptedDriver::new());
    let second = h.pending_service(2, router).await;
    assert!(second.id > first.id);

    let jobs = h.core.reconciler().list_jobs(&JobFilter::all()).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.windows(2).all(|w| w[0].id < w[1].id));
}

#[tokio::test]
async fn checkpoints_and_audit_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let state_file = temp_dir.path().join("state.json");
    let router = RouterId(3);

    let audited = {
        let store = Arc::new(FileStore::new(&state_file).await.unwrap());
        let h = harness_with(fast_config(), store, ScriptedDriver::new());
        h.subnet("10.0.0.0/29", router).await;
        h.active_service(1, router).await;
        h.core.audit().entries(None).await.unwrap().len()
    };

    let store = Arc::new(FileStore::new(&state_file).await.unwrap());
    let h = harness_with(fast_config(), store, ScriptedDriver::new());
    assert_eq!(h.core.audit().entries(None).await.unwrap().len(), audited);

    let checkpoints = h.core.reconciler().router_checkpoints().await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].router_id, router);
    assert!(checkpoints[0].last_synced.is_some());

    let health = h.core.reconciler().sync_health(None).await.unwrap();
    assert_eq!(health.in_sync, 1);
    assert_eq!(health.percentage, 100.0);
}

#[tokio::test]
async fn repeated_release_is_a_no_op() {
    let router = RouterId(1);
    let h = harness(ScriptedDriver::new());
    let subnet = h.subnet("10.0.0.0/29", router).await;
    let service = h.active_service(1, router).await;
    let address = service.address.unwrap();

    h.core.lifecycle().cancel(service.id).await.unwrap();
    let after_cancel = h.core.pool().addresses(subnet.id).await.unwrap();
    let audit_before = h.core.audit().entries(None).await.unwrap().len();

    assert_ok!(h.core.pool().release(address).await);
    assert_ok!(h.core.pool().release(address).await);

    assert_eq!(h.core.pool().addresses(subnet.id).await.unwrap(), after_cancel);
    let row = after_cancel.iter().find(|r| r.address == address).unwrap();
    assert_eq!(row.status, AddressStatus::Available);
    assert_eq!(h.core.audit().entries(None).await.unwrap().len(), audit_before);

    let open = h
        .core
        .reconciler()
        .list_jobs(&JobFilter::all().status(SyncStatus::Pending))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
}
