use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{CatalogSnapshot, GroupPayload, PersistenceGateway, RemoteError};

/// A request observed by [`MemoryGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    FetchCatalog,
    FetchGroups,
    SaveAll(Vec<GroupPayload>),
    SaveOrder(Vec<String>),
    Upsert(GroupPayload),
    Delete(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    catalog: CatalogSnapshot,
    groups: Vec<GroupPayload>,
    calls: Vec<GatewayCall>,
    failures: Vec<RemoteError>,
    delays: VecDeque<Duration>,
}

/// In-process stand-in for the remote API with the same replace-all
/// semantics. Useful for offline sessions and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<MemoryState>>,
    latency: Option<Duration>,
}

impl MemoryGateway {
    pub fn new(catalog: CatalogSnapshot, groups: Vec<GroupPayload>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                catalog,
                groups,
                ..MemoryState::default()
            })),
            latency: None,
        }
    }

    /// Delay every write request by `latency` before applying it.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a one-off delay for the next write request, taking precedence
    /// over the fixed latency. Queued delays are used in order.
    pub async fn delay_next(&self, delay: Duration) {
        self.state.lock().await.delays.push_back(delay);
    }

    /// Queue a failure; the next request of any kind returns it.
    pub async fn fail_next(&self, error: RemoteError) {
        self.state.lock().await.failures.push(error);
    }

    pub async fn stored_groups(&self) -> Vec<GroupPayload> {
        self.state.lock().await.groups.clone()
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn save_all_calls(&self) -> Vec<Vec<GroupPayload>> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::SaveAll(groups) => Some(groups.clone()),
                _ => None,
            })
            .collect()
    }

    async fn delay(&self) {
        let queued = self.state.lock().await.delays.pop_front();
        if let Some(delay) = queued.or(self.latency) {
            sleep(delay).await;
        }
    }

    async fn record(&self, call: GatewayCall) -> Result<(), RemoteError> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        if state.failures.is_empty() {
            Ok(())
        } else {
            Err(state.failures.remove(0))
        }
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, RemoteError> {
        self.record(GatewayCall::FetchCatalog).await?;
        Ok(self.state.lock().await.catalog.clone())
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupPayload>, RemoteError> {
        self.record(GatewayCall::FetchGroups).await?;
        Ok(self.state.lock().await.groups.clone())
    }

    async fn save_all(&self, groups: Vec<GroupPayload>) -> Result<(), RemoteError> {
        self.delay().await;
        self.record(GatewayCall::SaveAll(groups.clone())).await?;
        self.state.lock().await.groups = groups;
        Ok(())
    }

    async fn save_order(&self, names: Vec<String>) -> Result<(), RemoteError> {
        self.delay().await;
        self.record(GatewayCall::SaveOrder(names.clone())).await?;
        let mut state = self.state.lock().await;
        let mut remaining = std::mem::take(&mut state.groups);
        let mut ordered = Vec::with_capacity(remaining.len());
        for name in &names {
            if let Some(pos) = remaining.iter().position(|g| &g.name == name) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.extend(remaining);
        state.groups = ordered;
        Ok(())
    }

    async fn upsert_group(&self, group: GroupPayload) -> Result<(), RemoteError> {
        self.delay().await;
        self.record(GatewayCall::Upsert(group.clone())).await?;
        let mut state = self.state.lock().await;
        match state.groups.iter().position(|g| g.name == group.name) {
            Some(pos) => state.groups[pos] = group,
            None => state.groups.push(group),
        }
        Ok(())
    }

    async fn delete_group(&self, name: &str) -> Result<(), RemoteError> {
        self.delay().await;
        self.record(GatewayCall::Delete(name.to_string())).await?;
        self.state.lock().await.groups.retain(|g| g.name != name);
        Ok(())
    }
}
