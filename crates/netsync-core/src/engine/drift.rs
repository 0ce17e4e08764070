//! Drift sweep
//!
//! Compares what the store says each router should carry with what the
//! router reports, and raises `out_of_sync` jobs for the differences. The
//! raised jobs are not pushed automatically; they surface on the job status
//! query and wait for an operator retry.
//!
//! Anything with an open (pending or out-of-sync) job is left alone: it is
//! already being reconciled through the normal path.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use super::queue::NewJob;
use super::{ReconcilerEvent, SyncReconciler};
use crate::error::Result;
use crate::model::{
    AuditEvent, EntityRef, JobId, PushParams, RouterId, ServiceId, ServiceStatus, SyncAction,
    SyncStatus,
};
use crate::traits::{DeviceState, JobFilter, ServiceFilter};

/// Summary of one drift sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Routers whose state was read and compared
    pub routers_checked: usize,
    /// Routers whose driver could not report state
    pub routers_skipped: usize,
    /// Jobs raised as `out_of_sync`
    pub raised: Vec<JobId>,
}

impl SyncReconciler {
    /// Sweep every known router for drift
    pub async fn sweep_drift(&self) -> Result<DriftReport> {
        let inner = &self.inner;
        let mut routers: BTreeSet<RouterId> = inner
            .store
            .list_subnets()
            .await?
            .into_iter()
            .map(|s| s.router_id)
            .collect();
        routers.extend(
            inner
                .store
                .list_services(&ServiceFilter::all())
                .await?
                .into_iter()
                .filter(|s| !s.status.is_terminal())
                .map(|s| s.router_id),
        );

        let mut report = DriftReport::default();
        for router in routers {
            match self.sweep_router(router).await? {
                Some(raised) => {
                    report.routers_checked += 1;
                    if !raised.is_empty() {
                        inner.emit(ReconcilerEvent::DriftDetected {
                            router,
                            raised: raised.len(),
                        });
                    }
                    report.raised.extend(raised);
                }
                None => report.routers_skipped += 1,
            }
        }

        debug!(
            checked = report.routers_checked,
            skipped = report.routers_skipped,
            raised = report.raised.len(),
            "Drift sweep finished"
        );
        Ok(report)
    }

    /// Compare one router; `None` when its state could not be read
    async fn sweep_router(&self, router: RouterId) -> Result<Option<Vec<JobId>>> {
        let Some(state) = self.query_state(router).await else {
            return Ok(None);
        };

        let inner = &self.inner;
        let services = inner
            .store
            .list_services(&ServiceFilter::all().router(router))
            .await?;
        let jobs = inner
            .store
            .list_jobs(&JobFilter::all().router(router))
            .await?;

        let open = |status: SyncStatus| matches!(status, SyncStatus::Pending | SyncStatus::OutOfSync);
        let open_services: HashSet<ServiceId> = jobs
            .iter()
            .filter(|j| open(j.sync_status))
            .filter_map(|j| j.service_id)
            .collect();
        let open_addresses: HashSet<Ipv4Addr> = jobs
            .iter()
            .filter(|j| open(j.sync_status))
            .filter_map(|j| j.params.address)
            .collect();
        let expected: HashSet<Ipv4Addr> = services
            .iter()
            .filter(|s| matches!(s.status, ServiceStatus::Active | ServiceStatus::Pending))
            .filter_map(|s| s.address)
            .collect();

        let mut raised = Vec::new();

        for service in services.iter().filter(|s| s.status == ServiceStatus::Active) {
            let Some(address) = service.address else {
                continue;
            };
            if open_services.contains(&service.id) {
                continue;
            }
            let settled = jobs
                .iter()
                .rev()
                .find(|j| j.service_id == Some(service.id) && j.sync_status != SyncStatus::Superseded)
                .is_some_and(|j| j.sync_status == SyncStatus::InSync);
            if !settled {
                continue;
            }

            let detail = match state.binding_for(address) {
                None => format!("{} missing on {}", address, router),
                Some(binding) => match binding.service_id {
                    Some(other) if other != service.id => {
                        format!("{} on {} is bound to {}, expected {}", address, router, other, service.id)
                    }
                    _ => continue,
                },
            };

            warn!(service = %service.id, %router, "Drift detected: {}", detail);
            let job = inner.lifecycle.sync_job_for(service).await?;
            let job = inner.queue.raise_out_of_sync(job, detail.clone()).await?;
            inner
                .audit
                .record(EntityRef::Service(service.id), AuditEvent::DriftDetected { detail })
                .await;
            raised.push(job.id);
        }

        for binding in &state.bindings {
            if expected.contains(&binding.address) || open_addresses.contains(&binding.address) {
                continue;
            }

            let detail = format!("stray binding {} on {}", binding.address, router);
            warn!(%router, "Drift detected: {}", detail);

            let row = inner.store.find_address(binding.address).await?;
            let job = NewJob {
                router_id: router,
                service_id: None,
                address_id: row.map(|r| r.id),
                action: SyncAction::Deprovision,
                params: PushParams {
                    service_id: binding.service_id,
                    address: Some(binding.address),
                    ..PushParams::default()
                },
            };
            let job = inner.queue.raise_out_of_sync(job, detail.clone()).await?;
            inner
                .audit
                .record(EntityRef::Router(router), AuditEvent::DriftDetected { detail })
                .await;
            raised.push(job.id);
        }

        inner.checkpoint(router, Utc::now(), false).await?;
        if !raised.is_empty() {
            info!(%router, raised = raised.len(), "Raised out-of-sync jobs");
        }
        Ok(Some(raised))
    }

    async fn query_state(&self, router: RouterId) -> Option<DeviceState> {
        let timeout = self.inner.config.push_timeout();
        match tokio::time::timeout(timeout, self.inner.driver.query_state(router)).await {
            Ok(Ok(Some(state))) => Some(state),
            Ok(Ok(None)) => {
                debug!(%router, driver = self.inner.driver.driver_name(), "Driver cannot report state, skipping");
                None
            }
            Ok(Err(e)) => {
                warn!(%router, "Failed to query router state: {}", e);
                None
            }
            Err(_) => {
                warn!(%router, ?timeout, "Router state query timed out");
                None
            }
        }
    }
}
