//! Sync reconciler
//!
//! The SyncReconciler is responsible for:
//! - Pushing pending sync jobs to routers through the DeviceDriver
//! - Bounding retries and recording every attempt on the job
//! - Promoting services once their provision job is in sync
//! - Sweeping routers for drift between recorded and actual state
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   wakeups   ┌────────────────┐
//! │ JobQueue         │────────────▶│ dispatcher     │◀── poll / maintenance ticks
//! │ (lifecycle, ops) │             └────────────────┘
//! └──────────────────┘                     │ one worker per router
//!          │                ┌──────────────┼──────────────┐
//!          ▼                ▼              ▼              ▼
//! ┌──────────────────┐  router-1       router-2  ...  router-n
//! │ ProvisioningStore│◀── FIFO: lowest pending job id first
//! └──────────────────┘       │
//!                            ▼
//!                    DeviceDriver::push_config (bounded by push timeout)
//! ```
//!
//! ## Job Flow
//!
//! 1. Worker picks the oldest pending job of its router
//! 2. If the job is backing off, the worker sleeps until it is due
//! 3. Push with timeout; a timeout counts as a failure
//! 4. Conditional write of the outcome (a job superseded mid-flight is
//!    discarded)
//! 5. On a synced provision job, confirm the service active
//!
//! Routers never wait on each other; jobs of one router never overtake
//! each other.

pub mod drift;
pub mod queue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLog;
use crate::config::ReconcilerConfig;
use crate::error::{Error, Result};
use crate::lifecycle::ServiceLifecycle;
use crate::model::{
    AuditEvent, EntityRef, JobId, RouterCheckpoint, RouterId, ServiceId, ServiceStatus,
    SyncAction, SyncJob, SyncStatus,
};
use crate::pool::IpPool;
use crate::traits::{DeviceDriver, JobFilter, ProvisioningStore, ServiceFilter};

use queue::{JobQueue, Wakeups};

pub use drift::DriftReport;

/// Attempts a job gets before it is parked as `out_of_sync`
pub const MAX_RETRIES: u32 = 3;

/// Events emitted by the SyncReconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilerEvent {
    /// Reconciler started
    Started { routers: usize },

    /// A job's push succeeded
    JobSynced { job: JobId, router: RouterId },

    /// A push failed and the job will be attempted again
    JobRetryScheduled {
        job: JobId,
        router: RouterId,
        retry_count: u32,
        error: String,
    },

    /// A push failed for the last allowed time
    JobOutOfSync {
        job: JobId,
        router: RouterId,
        error: String,
    },

    /// The job was superseded while its push was in flight
    JobDiscarded { job: JobId },

    /// The drift sweep raised out-of-sync jobs for a router
    DriftDetected { router: RouterId, raised: usize },

    /// Reconciler stopped
    Stopped { reason: String },
}

/// Outcome of one processed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Synced(JobId),
    RetryScheduled { job: JobId, retry_count: u32 },
    OutOfSync(JobId),
    Discarded(JobId),
}

/// Result of [`SyncReconciler::process_next`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// No pending job for the router
    Idle,
    /// The oldest pending job is backing off for this long
    Waiting(Duration),
    Processed(JobOutcome),
}

/// Target of a manual sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Router(RouterId),
    Service(ServiceId),
}

/// Share of jobs in sync over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHealth {
    pub total: usize,
    pub in_sync: usize,
    pub out_of_sync: usize,
    pub pending: usize,
    /// `in_sync / total` as a percentage; 100 when there are no jobs
    pub percentage: f64,
}

/// Core reconciliation loop
///
/// Cheap to clone; clones share the same workers and wakeup channel.
///
/// ## Lifecycle
///
/// 1. Create with [`SyncReconciler::new()`]
/// 2. Start with [`SyncReconciler::run()`] (or drive it by hand with
///    [`SyncReconciler::process_next()`] / [`SyncReconciler::run_pending()`])
/// 3. On shutdown, in-flight pushes finish (bounded by the drain timeout),
///    no new job is started, and the store is flushed
///
/// Maintenance (drift sweep, suspension expiry, address reclaim) runs as
/// its own task; a slow router query never holds up dispatch.
#[derive(Clone)]
pub struct SyncReconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn ProvisioningStore>,
    driver: Arc<dyn DeviceDriver>,
    queue: JobQueue,
    lifecycle: ServiceLifecycle,
    pool: IpPool,
    audit: AuditLog,
    config: ReconcilerConfig,
    wakeups: Mutex<Option<Wakeups>>,
    event_tx: mpsc::Sender<ReconcilerEvent>,
}

impl SyncReconciler {
    /// Create a new reconciler
    ///
    /// # Returns
    ///
    /// A tuple of (reconciler, event_receiver) where event_receiver yields
    /// reconciler events
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ProvisioningStore>,
        driver: Arc<dyn DeviceDriver>,
        queue: JobQueue,
        wakeups: Wakeups,
        lifecycle: ServiceLifecycle,
        pool: IpPool,
        audit: AuditLog,
        config: ReconcilerConfig,
    ) -> Result<(Self, mpsc::Receiver<ReconcilerEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);
        let inner = Inner {
            store,
            driver,
            queue,
            lifecycle,
            pool,
            audit,
            config,
            wakeups: Mutex::new(Some(wakeups)),
            event_tx: tx,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            rx,
        ))
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(&self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run until the given signal fires (or the sender is dropped)
    ///
    /// With `None` this behaves like [`run()`](SyncReconciler::run).
    pub async fn run_with_shutdown(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(&self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let mut wakeups = self
            .inner
            .wakeups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Other("reconciler is already running".to_string()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers: JoinSet<()> = JoinSet::new();
        // At most one maintenance pass at a time, off the dispatcher loop.
        let mut upkeep: JoinSet<()> = JoinSet::new();
        let mut notifiers: HashMap<RouterId, Arc<Notify>> = HashMap::new();

        let routers = match self.routers_with_pending().await {
            Ok(routers) => routers,
            Err(e) => {
                *self.inner.wakeups.lock().unwrap_or_else(|e| e.into_inner()) = Some(wakeups);
                return Err(e);
            }
        };
        info!(routers = routers.len(), driver = self.inner.driver.driver_name(), "Reconciler started");
        self.inner.emit(ReconcilerEvent::Started {
            routers: routers.len(),
        });
        for router in routers {
            self.wake_worker(router, &mut notifiers, &mut workers, &stop_rx);
        }

        let mut poll = tokio::time::interval(self.inner.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        poll.tick().await;

        let mut maintenance = self.inner.config.drift_interval().map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        let shutdown = shutdown_signal(shutdown_rx);
        tokio::pin!(shutdown);

        let reason = loop {
            tokio::select! {
                Some(router) = wakeups.recv() => {
                    self.wake_worker(router, &mut notifiers, &mut workers, &stop_rx);
                }

                _ = poll.tick() => {
                    match self.routers_with_pending().await {
                        Ok(routers) => {
                            for router in routers {
                                self.wake_worker(router, &mut notifiers, &mut workers, &stop_rx);
                            }
                        }
                        Err(e) => error!("Failed to scan for pending jobs: {}", e),
                    }
                }

                _ = tick(maintenance.as_mut()) => {
                    if upkeep.is_empty() {
                        let reconciler = self.clone();
                        upkeep.spawn(async move { reconciler.maintain().await });
                    } else {
                        debug!("Previous maintenance pass still running, tick skipped");
                    }
                }

                Some(joined) = upkeep.join_next(), if !upkeep.is_empty() => {
                    if let Err(e) = joined {
                        error!("Maintenance pass ended abnormally: {}", e);
                    }
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Router worker ended abnormally: {}", e);
                    }
                    // A crashed worker is respawned on its router's next wakeup.
                    notifiers.retain(|_, notify| Arc::strong_count(notify) > 1);
                }

                reason = &mut shutdown => {
                    info!("Shutdown signal received");
                    break reason;
                }
            }
        };

        // A maintenance pass holds no job; it is cut short, not drained.
        upkeep.shutdown().await;

        // Stop accepting: workers finish the job in hand, then exit.
        let _ = stop_tx.send(true);
        let drain = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(self.inner.config.drain_timeout(), drain)
            .await
            .is_err()
        {
            warn!(
                remaining = workers.len(),
                "Drain timeout elapsed, aborting in-flight pushes"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        // Allow the next run() to pick the channel back up.
        *self.inner.wakeups.lock().unwrap_or_else(|e| e.into_inner()) = Some(wakeups);

        self.inner.store.flush().await?;
        self.inner.emit(ReconcilerEvent::Stopped {
            reason: reason.to_string(),
        });
        info!("State flushed, reconciler stopped");
        Ok(())
    }

    fn wake_worker(
        &self,
        router: RouterId,
        notifiers: &mut HashMap<RouterId, Arc<Notify>>,
        workers: &mut JoinSet<()>,
        stop_rx: &watch::Receiver<bool>,
    ) {
        if let Some(notify) = notifiers.get(&router)
            && Arc::strong_count(notify) > 1
        {
            notify.notify_one();
            return;
        }

        debug!(%router, "Spawning router worker");
        let notify = Arc::new(Notify::new());
        notifiers.insert(router, Arc::clone(&notify));
        workers.spawn(Arc::clone(&self.inner).router_worker(router, notify, stop_rx.clone()));
    }

    async fn routers_with_pending(&self) -> Result<BTreeSet<RouterId>> {
        Ok(self
            .inner
            .store
            .list_jobs(&JobFilter::all().status(SyncStatus::Pending))
            .await?
            .into_iter()
            .map(|j| j.router_id)
            .collect())
    }

    async fn maintain(&self) {
        let now = Utc::now();
        if let Err(e) = self.sweep_drift().await {
            error!("Drift sweep failed: {}", e);
        }
        match self.inner.lifecycle.resume_expired(now).await {
            Ok(resumed) if !resumed.is_empty() => info!(count = resumed.len(), "Resumed expired suspensions"),
            Ok(_) => {}
            Err(e) => error!("Failed to resume expired suspensions: {}", e),
        }
        if let Err(e) = self.inner.pool.reclaim_released(now).await {
            error!("Failed to reclaim released addresses: {}", e);
        }
    }

    /// Process the oldest pending job of one router
    ///
    /// A job that is backing off blocks the jobs behind it; the router's
    /// queue is strictly FIFO.
    pub async fn process_next(&self, router: RouterId) -> Result<Step> {
        self.inner.process_next(router).await
    }

    /// Process a router's queue until it is empty or its head is backing off
    pub async fn drain_router(&self, router: RouterId) -> Result<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            match self.inner.process_next(router).await? {
                Step::Processed(outcome) => outcomes.push(outcome),
                Step::Idle | Step::Waiting(_) => return Ok(outcomes),
            }
        }
    }

    /// Drain every router with pending work, routers in parallel
    pub async fn run_pending(&self) -> Result<Vec<JobOutcome>> {
        let mut set = JoinSet::new();
        for router in self.routers_with_pending().await? {
            let this = self.clone();
            set.spawn(async move { this.drain_router(router).await });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            let drained = joined.map_err(|e| Error::Other(format!("router task failed: {}", e)))?;
            outcomes.extend(drained?);
        }
        Ok(outcomes)
    }

    /// Operator retry of an `out_of_sync` job
    ///
    /// Allowed while `retry_count` is below the bound; counts as one more
    /// attempt.
    ///
    /// # Errors
    ///
    /// - `Conflict`: the job is not `out_of_sync`
    /// - `MaxRetriesExceeded`: the job has used every attempt; only
    ///   [`force_retry`](SyncReconciler::force_retry) can revive it
    pub async fn retry_job(&self, id: JobId) -> Result<SyncJob> {
        let job = self.job_status(id).await?;
        if job.sync_status != SyncStatus::OutOfSync {
            return Err(Error::conflict(format!(
                "{} is {}, only out_of_sync jobs can be retried",
                id, job.sync_status
            )));
        }
        if job.retry_count >= MAX_RETRIES {
            return Err(Error::MaxRetriesExceeded {
                job: id,
                retry_count: job.retry_count,
            });
        }

        let mut next = job;
        next.retry_count += 1;
        next.sync_status = SyncStatus::Pending;
        next.next_attempt_at = None;
        let event = AuditEvent::JobRetried {
            retry_count: next.retry_count,
        };
        self.requeue(next, event).await
    }

    /// Privileged retry that resets the attempt counter
    pub async fn force_retry(&self, id: JobId, operator: &str) -> Result<SyncJob> {
        let job = self.job_status(id).await?;
        if job.sync_status != SyncStatus::OutOfSync {
            return Err(Error::conflict(format!(
                "{} is {}, only out_of_sync jobs can be force-retried",
                id, job.sync_status
            )));
        }

        let mut next = job;
        next.retry_count = 0;
        next.sync_status = SyncStatus::Pending;
        next.next_attempt_at = None;
        warn!(job = %id, %operator, "Forcing retry, attempt counter reset");
        self.requeue(next, AuditEvent::JobForceRetried {
            operator: operator.to_string(),
        })
        .await
    }

    async fn requeue(&self, job: SyncJob, event: AuditEvent) -> Result<SyncJob> {
        if !self
            .inner
            .store
            .update_job(SyncStatus::OutOfSync, &job)
            .await?
        {
            return Err(Error::conflict(format!("{} changed concurrently", job.id)));
        }

        info!(job = %job.id, retry_count = job.retry_count, "Job requeued");
        self.inner.audit.record(EntityRef::Job(job.id), event).await;
        self.inner.queue.wake(job.router_id);
        Ok(job)
    }

    /// Enqueue jobs that re-push the current desired state
    ///
    /// For a router: one job per non-cancelled service on it. A service
    /// whose job for the same action is parked at the retry bound is
    /// refused with `MaxRetriesExceeded` (skipped for a router target);
    /// [`force_retry`](SyncReconciler::force_retry) is the way past it.
    pub async fn enqueue_manual_sync(&self, target: SyncTarget) -> Result<Vec<SyncJob>> {
        let services = match target {
            SyncTarget::Service(id) => vec![self.inner.lifecycle.get_service(id).await?],
            SyncTarget::Router(router) => self
                .inner
                .lifecycle
                .list_services(&ServiceFilter::all().router(router))
                .await?
                .into_iter()
                .filter(|s| s.status != ServiceStatus::Cancelled)
                .collect(),
        };

        let mut jobs = Vec::with_capacity(services.len());
        for service in &services {
            let job = self.inner.lifecycle.sync_job_for(service).await?;
            match self.inner.queue.enqueue_within_bound(job).await {
                Ok(job) => jobs.push(job),
                Err(e @ Error::MaxRetriesExceeded { .. })
                    if matches!(target, SyncTarget::Router(_)) =>
                {
                    warn!(service = %service.id, "Skipping service in manual sync: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        info!(?target, jobs = jobs.len(), "Manual sync enqueued");
        Ok(jobs)
    }

    pub async fn job_status(&self, id: JobId) -> Result<SyncJob> {
        self.inner
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        self.inner.store.list_jobs(filter).await
    }

    /// In-sync share of jobs checked (or created) within the window
    ///
    /// `None` uses the configured health window. Superseded jobs are not
    /// counted.
    pub async fn sync_health(&self, window: Option<Duration>) -> Result<SyncHealth> {
        let window = window.unwrap_or_else(|| self.inner.config.health_window());
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));

        let mut health = SyncHealth {
            total: 0,
            in_sync: 0,
            out_of_sync: 0,
            pending: 0,
            percentage: 100.0,
        };
        for job in self.inner.store.list_jobs(&JobFilter::all()).await? {
            let seen = job.last_checked.unwrap_or(job.created_at);
            if since.is_some_and(|since| seen < since) {
                continue;
            }
            match job.sync_status {
                SyncStatus::InSync => health.in_sync += 1,
                SyncStatus::OutOfSync => health.out_of_sync += 1,
                SyncStatus::Pending => health.pending += 1,
                SyncStatus::Superseded => continue,
            }
            health.total += 1;
        }
        if health.total > 0 {
            health.percentage = health.in_sync as f64 * 100.0 / health.total as f64;
        }
        Ok(health)
    }

    /// When the reconciler last talked to a router
    pub async fn router_last_checked(&self, router: RouterId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .store
            .get_checkpoint(router)
            .await?
            .and_then(|c| c.last_checked))
    }

    pub async fn router_checkpoints(&self) -> Result<Vec<RouterCheckpoint>> {
        self.inner.store.list_checkpoints().await
    }
}

impl Inner {
    async fn router_worker(
        self: Arc<Self>,
        router: RouterId,
        notify: Arc<Notify>,
        mut stop: watch::Receiver<bool>,
    ) {
        debug!(%router, "Router worker started");
        loop {
            if *stop.borrow() {
                break;
            }

            let wait = match self.process_next(router).await {
                Ok(Step::Processed(_)) => continue,
                Ok(Step::Waiting(delay)) => Some(delay),
                Ok(Step::Idle) => None,
                Err(e) => {
                    error!(%router, "Failed to process job: {}", e);
                    Some(self.config.retry_delay().max(Duration::from_secs(1)))
                }
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = sleep_for(wait) => {}
                _ = stop.changed() => break,
            }
        }
        debug!(%router, "Router worker stopped");
    }

    async fn process_next(&self, router: RouterId) -> Result<Step> {
        let head = self
            .store
            .list_jobs(&JobFilter::all().router(router).status(SyncStatus::Pending))
            .await?
            .into_iter()
            .next();

        let Some(job) = head else {
            return Ok(Step::Idle);
        };

        let now = Utc::now();
        if let Some(due) = job.next_attempt_at
            && due > now
        {
            let delay = (due - now).to_std().unwrap_or_default();
            return Ok(Step::Waiting(delay));
        }

        self.attempt(job).await.map(Step::Processed)
    }

    async fn attempt(&self, job: SyncJob) -> Result<JobOutcome> {
        let router = job.router_id;
        debug!(job = %job.id, %router, action = %job.action, "Pushing");

        let timeout = self.config.push_timeout();
        let pushed = match tokio::time::timeout(
            timeout,
            self.driver.push_config(router, job.action, &job.params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::DeviceTimeout {
                router,
                after: timeout,
            }),
        };

        let now = Utc::now();
        let mut next = job.clone();
        next.last_checked = Some(now);

        let outcome = match &pushed {
            Ok(()) => {
                next.sync_status = SyncStatus::InSync;
                next.last_synced = Some(now);
                next.retry_count = 0;
                next.next_attempt_at = None;
                next.message = None;
                JobOutcome::Synced(job.id)
            }
            Err(e) => {
                next.retry_count = (job.retry_count + 1).min(MAX_RETRIES);
                next.message = Some(e.to_string());
                if e.is_retryable() && next.retry_count < MAX_RETRIES {
                    next.sync_status = SyncStatus::Pending;
                    next.next_attempt_at = chrono::Duration::from_std(self.config.retry_delay())
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay));
                    JobOutcome::RetryScheduled {
                        job: job.id,
                        retry_count: next.retry_count,
                    }
                } else {
                    next.sync_status = SyncStatus::OutOfSync;
                    next.next_attempt_at = None;
                    JobOutcome::OutOfSync(job.id)
                }
            }
        };

        if !self.store.update_job(SyncStatus::Pending, &next).await? {
            info!(job = %job.id, %router, "Job superseded during push, discarding result");
            self.emit(ReconcilerEvent::JobDiscarded { job: job.id });
            return Ok(JobOutcome::Discarded(job.id));
        }

        self.checkpoint(router, now, pushed.is_ok()).await?;

        let attempt = AuditEvent::SyncAttempt {
            success: pushed.is_ok(),
            retry_count: next.retry_count,
            status: next.sync_status,
        };
        match &pushed {
            Ok(()) => self.audit.record(EntityRef::Job(job.id), attempt).await,
            Err(e) => {
                self.audit
                    .record_with(EntityRef::Job(job.id), attempt, e.to_string())
                    .await
            }
        }

        match (&outcome, pushed) {
            (JobOutcome::Synced(_), _) => {
                info!(job = %job.id, %router, action = %job.action, "Job in sync");
                self.emit(ReconcilerEvent::JobSynced { job: job.id, router });
                if job.action == SyncAction::Provision
                    && let Some(service) = job.service_id
                {
                    self.lifecycle.confirm_provisioned(service, job.id).await?;
                }
            }
            (JobOutcome::RetryScheduled { retry_count, .. }, Err(e)) => {
                warn!(job = %job.id, %router, retry_count, "Push failed, will retry: {}", e);
                self.emit(ReconcilerEvent::JobRetryScheduled {
                    job: job.id,
                    router,
                    retry_count: *retry_count,
                    error: e.to_string(),
                });
            }
            (JobOutcome::OutOfSync(_), Err(e)) => {
                error!(job = %job.id, %router, retry_count = next.retry_count, "Push failed, job out of sync: {}", e);
                self.emit(ReconcilerEvent::JobOutOfSync {
                    job: job.id,
                    router,
                    error: e.to_string(),
                });
            }
            _ => {}
        }

        Ok(outcome)
    }

    async fn checkpoint(&self, router: RouterId, at: DateTime<Utc>, synced: bool) -> Result<()> {
        let mut checkpoint = self
            .store
            .get_checkpoint(router)
            .await?
            .unwrap_or(RouterCheckpoint {
                router_id: router,
                last_checked: None,
                last_synced: None,
            });
        checkpoint.last_checked = Some(at);
        if synced {
            checkpoint.last_synced = Some(at);
        }
        self.store.put_checkpoint(&checkpoint).await
    }

    /// Emit a reconciler event
    fn emit(&self, event: ReconcilerEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves with a description of whatever asked the loop to stop
async fn shutdown_signal(shutdown_rx: Option<oneshot::Receiver<()>>) -> &'static str {
    match shutdown_rx {
        // A dropped sender also stops the loop.
        Some(rx) => {
            let _ = rx.await;
            "Shutdown signal"
        }
        None => os_signal().await,
    }
}

#[cfg(unix)]
async fn os_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = tokio::signal::ctrl_c() => "SIGINT",
        },
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn os_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
