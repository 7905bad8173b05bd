use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::gateway::{PersistenceGateway, RemoteError};
use crate::metrics::EngineMetrics;
use crate::registry::RegistryError;
use crate::session::GroupEditorSession;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    /// Local state is not savable; nothing was sent.
    #[error("validation failed: {0}")]
    Validation(#[from] RegistryError),
    #[error("remote save failed: {0}")]
    Remote(#[from] RemoteError),
}

/// How a [`SharedSession::reorder_groups`] call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "order", rename_all = "snake_case")]
pub enum OrderOutcome {
    /// The backend holds this order.
    Saved(Vec<String>),
    /// A newer reorder was issued and writes its own order.
    Superseded,
}

/// How a [`SharedSession::save_all`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// The backend holds the session content at `revision`, which is current.
    Saved { revision: u64 },
    /// A newer save was issued; this call's result was discarded.
    Superseded,
    /// Edits kept landing during the save and the resave budget ran out.
    Dirty { saved: u64, current: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveStatus {
    pub last_saved_revision: Option<u64>,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_saved_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub last_error: Option<String>,
}

struct SharedSessionInner {
    session: RwLock<GroupEditorSession>,
    gateway: Arc<dyn PersistenceGateway>,
    metrics: EngineMetrics,
    save_lock: Mutex<()>,
    save_ticket: AtomicU64,
    order_lock: Mutex<()>,
    order_ticket: AtomicU64,
    status: RwLock<SaveStatus>,
    max_resave_attempts: u32,
}

/// Editing session shared between tasks, with remote save coordination.
///
/// Saves are serialised and tagged with a ticket; only the latest ticket's
/// result is reported, so the last save issued is the one that wins.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<SharedSessionInner>,
}

impl SharedSession {
    pub fn new(
        session: GroupEditorSession,
        gateway: Arc<dyn PersistenceGateway>,
        metrics: EngineMetrics,
        config: &SessionConfig,
    ) -> Self {
        let session = session.with_metrics(metrics.clone());
        Self {
            inner: Arc::new(SharedSessionInner {
                session: RwLock::new(session),
                gateway,
                metrics,
                save_lock: Mutex::new(()),
                save_ticket: AtomicU64::new(0),
                order_lock: Mutex::new(()),
                order_ticket: AtomicU64::new(0),
                status: RwLock::new(SaveStatus::default()),
                max_resave_attempts: config.max_resave_attempts,
            }),
        }
    }

    pub async fn read<F, R>(&self, view: F) -> R
    where
        F: FnOnce(&GroupEditorSession) -> R,
    {
        let guard = self.inner.session.read().await;
        view(&guard)
    }

    pub async fn update<F, R>(&self, apply: F) -> R
    where
        F: FnOnce(&mut GroupEditorSession) -> R,
    {
        let mut guard = self.inner.session.write().await;
        apply(&mut guard)
    }

    pub async fn revision(&self) -> u64 {
        self.inner.session.read().await.revision()
    }

    pub async fn save_status(&self) -> SaveStatus {
        self.inner.status.read().await.clone()
    }

    /// Persist every group with replace-all semantics.
    pub async fn save_all(&self) -> Result<SaveOutcome, SaveError> {
        // Fail fast on invalid state before taking a ticket.
        self.read(|s| s.save_payload().map(|_| ())).await?;

        let ticket = self.inner.save_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let _serial = self.inner.save_lock.lock().await;
        if self.is_superseded(ticket) {
            return Ok(self.superseded(ticket));
        }

        let mut attempts = 0;
        loop {
            let (payload, revision) = self
                .read(|s| s.save_payload().map(|p| (p, s.revision())))
                .await?;

            self.inner.status.write().await.in_flight = true;
            let groups = payload.len();
            let result = self
                .timed("save_all", self.inner.gateway.save_all(payload))
                .await;
            let current = self.revision().await;

            let mut status = self.inner.status.write().await;
            status.in_flight = false;
            if let Err(err) = result {
                status.last_error = Some(err.to_string());
                drop(status);
                if self.is_superseded(ticket) {
                    return Ok(self.superseded(ticket));
                }
                warn!(error = %err, revision, "save failed");
                return Err(err.into());
            }
            status.last_saved_revision = Some(revision);
            status.last_saved_at = Some(Utc::now());
            status.last_error = None;
            drop(status);

            if self.is_superseded(ticket) {
                return Ok(self.superseded(ticket));
            }
            if current == revision {
                info!(revision, groups, "groups saved");
                return Ok(SaveOutcome::Saved { revision });
            }
            if attempts >= self.inner.max_resave_attempts {
                warn!(saved = revision, current, "edits outpaced saving; giving up");
                return Ok(SaveOutcome::Dirty {
                    saved: revision,
                    current,
                });
            }
            attempts += 1;
            debug!(saved = revision, current, attempts, "content changed during save; saving again");
        }
    }

    /// Apply a new group order locally and persist it straight away.
    ///
    /// Order saves are serialised like full saves: a call whose ticket has
    /// been superseded by the time it may send skips the request, and one
    /// superseded while in flight reports [`OrderOutcome::Superseded`]. The
    /// newest order is therefore always the last one written. A failed order
    /// save keeps the local order.
    pub async fn reorder_groups<S: AsRef<str>>(
        &self,
        new_order: &[S],
    ) -> Result<OrderOutcome, RemoteError> {
        // Ticket under the write lock so ticket order equals local apply order.
        let (names, ticket) = self
            .update(|s| {
                let names = s.reorder_groups(new_order);
                let ticket = self.inner.order_ticket.fetch_add(1, Ordering::SeqCst) + 1;
                (names, ticket)
            })
            .await;

        let _serial = self.inner.order_lock.lock().await;
        if self.is_order_superseded(ticket) {
            return Ok(self.order_superseded(ticket));
        }

        let result = self
            .timed("save_order", self.inner.gateway.save_order(names.clone()))
            .await;
        if self.is_order_superseded(ticket) {
            return Ok(self.order_superseded(ticket));
        }
        result?;
        debug!(ticket, groups = names.len(), "group order saved");
        Ok(OrderOutcome::Saved(names))
    }

    /// Persist one group through the incremental endpoint.
    pub async fn upsert_group_remote(&self, name: &str) -> Result<(), SaveError> {
        let payload = self.read(|s| s.group_payload(name)).await?;
        self.timed("upsert_group", self.inner.gateway.upsert_group(payload))
            .await?;
        info!(group = name, "group saved");
        Ok(())
    }

    /// Delete a group remotely, then locally once the backend has accepted it.
    /// The local delete follows the group's id, so a rename landing while the
    /// request is in flight does not leave it behind.
    pub async fn delete_group_remote(&self, name: &str) -> Result<(), SaveError> {
        let id = self
            .read(|s| s.registry().id_of(name))
            .await
            .ok_or_else(|| RegistryError::UnknownGroup(name.to_string()))?;
        self.timed("delete_group", self.inner.gateway.delete_group(name))
            .await?;

        if !self.update(|s| s.delete_group_by_id(id)).await {
            debug!(group = name, "group already removed locally");
        }
        Ok(())
    }

    fn is_superseded(&self, ticket: u64) -> bool {
        self.inner.save_ticket.load(Ordering::SeqCst) != ticket
    }

    fn is_order_superseded(&self, ticket: u64) -> bool {
        self.inner.order_ticket.load(Ordering::SeqCst) != ticket
    }

    fn order_superseded(&self, ticket: u64) -> OrderOutcome {
        self.inner.metrics.inc_superseded();
        debug!(ticket, "order save superseded by a newer reorder");
        OrderOutcome::Superseded
    }

    fn superseded(&self, ticket: u64) -> SaveOutcome {
        self.inner.metrics.inc_superseded();
        debug!(ticket, "save superseded by a newer request");
        SaveOutcome::Superseded
    }

    async fn timed<F>(&self, op: &str, request: F) -> Result<(), RemoteError>
    where
        F: Future<Output = Result<(), RemoteError>>,
    {
        let started = Instant::now();
        let result = request.await;
        self.inner
            .metrics
            .observe_request(op, started.elapsed(), result.is_ok());
        result
    }
}
