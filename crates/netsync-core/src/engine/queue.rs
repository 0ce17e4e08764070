//! Sync job queue
//!
//! Jobs live in the store; the queue only creates them, retires the ones a
//! newer desired state makes obsolete, and wakes the reconciler for the
//! target router. Enqueueing never waits on device I/O.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::audit::AuditLog;
use crate::error::{Error, Result};
use crate::model::{
    AddressId, AuditEvent, EntityRef, JobId, PushParams, RouterId, ServiceId, SyncAction, SyncJob,
    SyncStatus,
};
use crate::traits::{JobFilter, ProvisioningStore};

use super::MAX_RETRIES;

/// Router ids whose queue gained work
pub type Wakeups = mpsc::UnboundedReceiver<RouterId>;

/// Description of a job to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub router_id: RouterId,
    pub service_id: Option<ServiceId>,
    pub address_id: Option<AddressId>,
    pub action: SyncAction,
    pub params: PushParams,
}

/// Handle for creating sync jobs
///
/// Id reservation, insert and supersession run under one lock, so job ids
/// order jobs in the store the same way they were enqueued.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn ProvisioningStore>,
    audit: AuditLog,
    wake_tx: mpsc::UnboundedSender<RouterId>,
    insert_lock: Arc<Mutex<()>>,
}

impl JobQueue {
    /// Create a queue and the receiving end of its wakeups
    pub fn new(store: Arc<dyn ProvisioningStore>, audit: AuditLog) -> (Self, Wakeups) {
        let (wake_tx, wakeups) = mpsc::unbounded_channel();
        (
            Self {
                store,
                audit,
                wake_tx,
                insert_lock: Arc::new(Mutex::new(())),
            },
            wakeups,
        )
    }

    /// Create a pending job and retire older open jobs of the same service
    pub async fn enqueue(&self, job: NewJob) -> Result<SyncJob> {
        let _guard = self.insert_lock.lock().await;
        let job = self.insert(job, SyncStatus::Pending, None).await?;
        self.wake(job.router_id);
        Ok(job)
    }

    /// Like [`enqueue`](JobQueue::enqueue), unless the service's job for
    /// the same action is parked at the retry bound
    ///
    /// Re-pushing that action would be one more attempt past the bound.
    pub(crate) async fn enqueue_within_bound(&self, job: NewJob) -> Result<SyncJob> {
        let _guard = self.insert_lock.lock().await;
        if let Some(service) = job.service_id {
            self.check_retry_bound(service, job.action).await?;
        }
        let job = self.insert(job, SyncStatus::Pending, None).await?;
        self.wake(job.router_id);
        Ok(job)
    }

    /// `MaxRetriesExceeded` if `service` has an `action` job out of sync
    /// with every attempt used
    pub(crate) async fn check_retry_bound(&self, service: ServiceId, action: SyncAction) -> Result<()> {
        let parked = self
            .store
            .list_jobs(&JobFilter::all().service(service).status(SyncStatus::OutOfSync))
            .await?
            .into_iter()
            .find(|j| j.action == action && j.retry_count >= MAX_RETRIES);
        match parked {
            Some(job) => Err(Error::MaxRetriesExceeded {
                job: job.id,
                retry_count: job.retry_count,
            }),
            None => Ok(()),
        }
    }

    /// Create a job that is already `out_of_sync`
    ///
    /// Used for drift found outside the request path; the job waits for an
    /// operator retry instead of being pushed automatically.
    pub(crate) async fn raise_out_of_sync(&self, job: NewJob, message: String) -> Result<SyncJob> {
        let _guard = self.insert_lock.lock().await;
        self.insert(job, SyncStatus::OutOfSync, Some(message)).await
    }

    /// Nudge the reconciler to look at a router's queue
    pub(crate) fn wake(&self, router: RouterId) {
        // Nobody listening just means the reconciler is not running yet;
        // its startup scan finds the job.
        let _ = self.wake_tx.send(router);
    }

    /// Callers hold `insert_lock`
    async fn insert(
        &self,
        new: NewJob,
        status: SyncStatus,
        message: Option<String>,
    ) -> Result<SyncJob> {
        let job = SyncJob {
            id: JobId(self.store.next_id().await?),
            router_id: new.router_id,
            service_id: new.service_id,
            address_id: new.address_id,
            action: new.action,
            params: new.params,
            sync_status: status,
            retry_count: 0,
            created_at: Utc::now(),
            last_checked: None,
            last_synced: None,
            next_attempt_at: None,
            message,
        };
        self.store.insert_job(&job).await?;

        info!(job = %job.id, router = %job.router_id, action = %job.action, status = %status, "Enqueued sync job");
        self.audit
            .record(
                EntityRef::Job(job.id),
                AuditEvent::JobEnqueued { action: job.action },
            )
            .await;

        if let Some(service) = job.service_id {
            self.supersede(service, job.id).await?;
        }
        Ok(job)
    }

    /// Mark open jobs of `service` older than `by` as superseded
    async fn supersede(&self, service: ServiceId, by: JobId) -> Result<usize> {
        let stale = self
            .store
            .list_jobs(&JobFilter::all().service(service))
            .await?
            .into_iter()
            .filter(|j| {
                j.id < by && matches!(j.sync_status, SyncStatus::Pending | SyncStatus::OutOfSync)
            });

        let mut retired = 0;
        for job in stale {
            let expected = job.sync_status;
            let mut next = job;
            next.sync_status = SyncStatus::Superseded;
            next.next_attempt_at = None;
            next.message = Some(format!("superseded by {}", by));

            // Losing the race means the job finished first; leave it.
            if self.store.update_job(expected, &next).await? {
                debug!(job = %next.id, %by, "Superseded stale job");
                self.audit
                    .record(EntityRef::Job(next.id), AuditEvent::JobSuperseded { by })
                    .await;
                retired += 1;
            }
        }
        Ok(retired)
    }
}
