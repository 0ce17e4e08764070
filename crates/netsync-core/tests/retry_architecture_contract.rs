//! Architectural Contract Test: Reconciler-Owned, Bounded Retries
//!
//! This test verifies that retry policy lives in the reconciler, is bounded,
//! and that only a privileged operator action can go past the bound.
//!
//! Constraints verified:
//! - A failing job is attempted exactly MAX_RETRIES times, then parked as
//!   out_of_sync with its retry count at the bound
//! - A parked job is never pushed again on its own
//! - An ordinary retry at the bound is refused; a force retry resets the
//!   counter and the job can then succeed
//! - A push that exceeds the timeout counts as a failed attempt
//! - Neither a manual sync nor a re-activation gets a parked job past the
//!   bound
//! - A failure no retry would fix parks the job after one attempt
//!
//! Architectural boundaries:
//! - ✅ RECONCILER: Owns retry counting, backoff and the bound
//! - ❌ DRIVER: Must NOT retry internally (only executes one push)
//!
//! If this test fails, someone has made retries unbounded, moved them into
//! the driver, or let an out-of-sync job slip back into the queue.

mod common;

use common::*;
use netsync_core::model::{RouterId, ServiceStatus, SyncStatus};
use netsync_core::traits::JobFilter;
use netsync_core::{Error, JobOutcome, MAX_RETRIES, ReconcilerEvent, Step, SyncTarget};

#[tokio::test]
async fn failing_job_is_parked_after_the_retry_bound() {
    let router = RouterId(1);
    let h = harness(ScriptedDriver::new().script([
        PushOutcome::Reject("session locked"),
        PushOutcome::Reject("session locked"),
        PushOutcome::Reject("session locked"),
    ]));
    h.subnet("10.0.0.0/29", router).await;
    let service = h.pending_service(1, router).await;

    let outcomes = h.core.reconciler().drain_router(router).await.unwrap();
    assert_eq!(outcomes.len(), 3);
    let job_id = match outcomes[2] {
        JobOutcome::OutOfSync(id) => id,
        ref other => panic!("third failure must park the job, got {:?}", other),
    };
    assert_eq!(
        outcomes[0],
        JobOutcome::RetryScheduled {
            job: job_id,
            retry_count: 1
        }
    );
    assert_eq!(
        outcomes[1],
        JobOutcome::RetryScheduled {
            job: job_id,
            retry_count: 2
        }
    );

    let job = h.core.reconciler().job_status(job_id).await.unwrap();
    assert_eq!(job.sync_status, SyncStatus::OutOfSync);
    assert_eq!(job.retry_count, MAX_RETRIES);
    assert!(job.message.as_deref().unwrap_or_default().contains("session locked"));
    assert_eq!(h.driver.push_calls(), 3);

    // Parked jobs are invisible to the worker.
    assert_eq!(h.core.reconciler().process_next(router).await.unwrap(), Step::Idle);
    assert_eq!(h.driver.push_calls(), 3);

    let service = h.core.lifecycle().get_service(service.id).await.unwrap();
    assert_eq!(service.status, ServiceStatus::Pending);
}

#[tokio::test]
async fn retry_at_the_bound_needs_force() {
    let router = RouterId(1);
    let h = harness(ScriptedDriver::new().script([
        PushOutcome::Reject("no route"),
        PushOutcome::Reject("no route"),
        PushOutcome::Reject("no route"),
    ]));
    h.subnet("10.0.0.0/29", router).await;
    let service = h.pending_service(1, router).await;
    h.core.reconciler().drain_router(router).await.unwrap();

    let parked = h
        .core
        .reconciler()
        .list_jobs(&JobFilter::all().status(SyncStatus::OutOfSync))
        .await
        .unwrap();
    assert_eq!(parked.len(), 1);
    let job_id = parked[0].id;

    let refused = h.core.reconciler().retry_job(job_id).await;
    assert!(
        matches!(refused, Err(Error::MaxRetriesExceeded { job, retry_count }) if job == job_id && retry_count == MAX_RETRIES)
    );

    let forced = h.core.reconciler().force_retry(job_id, "noc-oncall").await.unwrap();
    assert_eq!(forced.sync_status, SyncStatus::Pending);
    assert_eq!(forced.retry_count, 0);

    let step = h.core.reconciler().process_next(router).await.unwrap();
    assert_eq!(step, Step::Processed(JobOutcome::Synced(job_id)));

    let job = h.core.reconciler().job_status(job_id).await.unwrap();
    assert_eq!(job.sync_status, SyncStatus::InSync);
    assert!(job.last_synced.is_some());
    let service = h.core.lifecycle().get_service(service.id).await.unwrap();
    assert_eq!(service.status, ServiceStatus::Active);

    // Force retry is for parked jobs only.
    assert!(matches!(
        h.core.reconciler().force_retry(job_id, "noc-oncall").await,
        Err(Error::Conflict(_))
    ));
}

#[tokio::test]
async fn push_timeout_counts_as_a_failed_attempt() {
    let router = RouterId(1);
    let h = harness(ScriptedDriver::new().script([PushOutcome::Hang]));
    h.subnet("10.0.0.0/29", router).await;
    h.pending_service(1, router).await;

    let step = h.core.reconciler().process_next(router).await.unwrap();
    let job_id = match step {
        Step::Processed(JobOutcome::RetryScheduled { job, retry_count: 1 }) => job,
        other => panic!("timeout must count as one failure, got {:?}", other),
    };
    let job = h.core.reconciler().job_status(job_id).await.unwrap();
    assert!(job.message.as_deref().unwrap_or_default().contains("timed out"));

    let step = h.core.reconciler().process_next(router).await.unwrap();
    assert_eq!(step, Step::Processed(JobOutcome::Synced(job_id)));
    assert_eq!(h.core.reconciler().job_status(job_id).await.unwrap().retry_count, 0);
}

#[tokio::test]
async fn retry_delay_holds_the_job_back() {
    let router = RouterId(1);
    let mut config = fast_config();
    config.reconciler.retry_delay_secs = 60;
    let h = harness_with(
        config,
        std::sync::Arc::new(netsync_core::MemoryStore::new()),
        ScriptedDriver::new().script([PushOutcome::Reject("busy")]),
    );
    h.subnet("10.0.0.0/29", router).await;
    h.pending_service(1, router).await;

    assert!(matches!(
        h.core.reconciler().process_next(router).await.unwrap(),
        Step::Processed(JobOutcome::RetryScheduled { retry_count: 1, .. })
    ));
    match h.core.reconciler().process_next(router).await.unwrap() {
        Step::Waiting(delay) => assert!(delay.as_secs() > 50),
        other => panic!("job must back off, got {:?}", other),
    }
    assert_eq!(h.driver.push_calls(), 1);
}

#[tokio::test]
async fn failures_are_reported_as_events() {
    let router = RouterId(1);
    let mut h = harness(ScriptedDriver::new().script([
        PushOutcome::Reject("flap"),
        PushOutcome::Reject("flap"),
        PushOutcome::Reject("flap"),
    ]));
    h.subnet("10.0.0.0/29", router).await;
    h.pending_service(1, router).await;
    h.core.reconciler().drain_router(router).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = h.streams.events.try_recv() {
        events.push(event);
    }
    let retries = events
        .iter()
        .filter(|e| matches!(e, ReconcilerEvent::JobRetryScheduled { .. }))
        .count();
    assert_eq!(retries, 2);
    assert!(matches!(
        events.last(),
        Some(ReconcilerEvent::JobOutOfSync { router: r, error, .. }) if *r == router && error.contains("flap")
    ));
}

#[tokio::test]
async fn resync_and_reactivation_respect_the_bound() {
    let router = RouterId(1);
    let h = harness(ScriptedDriver::new().script([
        PushOutcome::Reject("auth failed"),
        PushOutcome::Reject("auth failed"),
        PushOutcome::Reject("auth failed"),
    ]));
    h.subnet("10.0.0.0/29", router).await;
    let service = h.pending_service(1, router).await;
    h.core.reconciler().drain_router(router).await.unwrap();
    let parked = h
        .core
        .reconciler()
        .list_jobs(&JobFilter::all().status(SyncStatus::OutOfSync))
        .await
        .unwrap()[0]
        .id;

    let resync = h
        .core
        .reconciler()
        .enqueue_manual_sync(SyncTarget::Service(service.id))
        .await;
    assert!(matches!(resync, Err(Error::MaxRetriesExceeded { job, .. }) if job == parked));

    let reactivate = h.core.lifecycle().activate(service.id).await;
    assert!(matches!(reactivate, Err(Error::MaxRetriesExceeded { job, .. }) if job == parked));

    // A router-wide sync skips the parked service instead of failing.
    let jobs = h
        .core
        .reconciler()
        .enqueue_manual_sync(SyncTarget::Router(router))
        .await
        .unwrap();
    assert!(jobs.is_empty());

    let job = h.core.reconciler().job_status(parked).await.unwrap();
    assert_eq!(job.sync_status, SyncStatus::OutOfSync);
    assert_eq!(job.retry_count, MAX_RETRIES);
    assert_eq!(h.core.reconciler().process_next(router).await.unwrap(), Step::Idle);
    assert_eq!(h.driver.push_calls(), 3);

    // After a forced retry the service can be re-synced again.
    h.core.reconciler().force_retry(parked, "noc-oncall").await.unwrap();
    h.core.reconciler().drain_router(router).await.unwrap();
    let jobs = h
        .core
        .reconciler()
        .enqueue_manual_sync(SyncTarget::Service(service.id))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn unfixable_failure_parks_after_one_attempt() {
    let router = RouterId(1);
    let h = harness(ScriptedDriver::new().script([PushOutcome::Broken("template missing")]));
    h.subnet("10.0.0.0/29", router).await;
    h.pending_service(1, router).await;

    let job_id = match h.core.reconciler().process_next(router).await.unwrap() {
        Step::Processed(JobOutcome::OutOfSync(job)) => job,
        other => panic!("job must be parked at once, got {:?}", other),
    };
    let job = h.core.reconciler().job_status(job_id).await.unwrap();
    assert_eq!(job.retry_count, 1);
    assert!(job.message.as_deref().unwrap_or_default().contains("template missing"));
    assert_eq!(h.core.reconciler().process_next(router).await.unwrap(), Step::Idle);

    // Attempts remain, so an ordinary retry is allowed.
    let retried = h.core.reconciler().retry_job(job_id).await.unwrap();
    assert_eq!(retried.retry_count, 2);
    assert_eq!(
        h.core.reconciler().process_next(router).await.unwrap(),
        Step::Processed(JobOutcome::Synced(job_id))
    );
}
