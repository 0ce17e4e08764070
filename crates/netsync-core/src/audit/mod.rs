//! Append-only audit log
//!
//! Every component records state transitions and sync attempts here.
//! Recording is fire-and-forget: a failing store or a full mirror channel is
//! logged and never fails the transition that produced the entry.
//!
//! Entries are persisted through the [`ProvisioningStore`] and mirrored on a
//! bounded channel for embedders that want to stream them (reporting,
//! websocket feeds, log shipping).

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{AuditEvent, AuditLogEntry, EntityRef};
use crate::traits::ProvisioningStore;

/// Stream of mirrored audit entries
pub type AuditStream = ReceiverStream<AuditLogEntry>;

/// Handle used by every component to append audit entries
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn ProvisioningStore>,
    mirror_tx: mpsc::Sender<AuditLogEntry>,
}

impl AuditLog {
    /// Create an audit log and the stream its entries are mirrored on
    pub fn new(store: Arc<dyn ProvisioningStore>, capacity: usize) -> (Self, AuditStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                store,
                mirror_tx: tx,
            },
            ReceiverStream::new(rx),
        )
    }

    /// Append an entry without a message
    pub async fn record(&self, entity: EntityRef, event: AuditEvent) {
        self.append(entity, event, None).await;
    }

    /// Append an entry with a free-form message
    pub async fn record_with(&self, entity: EntityRef, event: AuditEvent, message: impl Into<String>) {
        self.append(entity, event, Some(message.into())).await;
    }

    async fn append(&self, entity: EntityRef, event: AuditEvent, message: Option<String>) {
        let entry = match self.persist(entity, event, message).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(?entity, "Failed to persist audit entry: {}", e);
                return;
            }
        };

        debug!(seq = entry.seq, ?entity, "audit");

        // The entry is already persisted; only the live mirror can lose it.
        match self.mirror_tx.try_send(entry) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Audit channel full, dropping mirrored entry. Consider increasing event_channel_capacity.");
            }
        }
    }

    async fn persist(
        &self,
        entity: EntityRef,
        event: AuditEvent,
        message: Option<String>,
    ) -> Result<AuditLogEntry> {
        let entry = AuditLogEntry {
            seq: self.store.next_id().await?,
            at: Utc::now(),
            entity,
            event,
            message,
        };
        self.store.append_audit(&entry).await?;
        Ok(entry)
    }

    /// Persisted entries, optionally for one entity
    pub async fn entries(&self, entity: Option<EntityRef>) -> Result<Vec<AuditLogEntry>> {
        self.store.list_audit(entity).await
    }
}
