use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::gateway::{HttpGateway, PersistenceGateway};
use crate::metrics::EngineMetrics;
use crate::session::GroupEditorSession;
use crate::state::SharedSession;

/// Shared context for opening grouping sessions against one backend.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<EngineConfig>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub metrics: EngineMetrics,
}

impl AppContext {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn PersistenceGateway>,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            metrics,
        }
    }

    /// Wire an HTTP gateway for the configured API.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let gateway = HttpGateway::new(&config.api)?;
        let metrics = EngineMetrics::new().context("failed to register engine metrics")?;
        Ok(Self::new(config, Arc::new(gateway), metrics))
    }

    /// Fetch the catalog and the stored groups, and start an editing session
    /// over them.
    pub async fn open_session(&self) -> Result<SharedSession> {
        let (catalog, groups) = tokio::try_join!(
            self.gateway.fetch_catalog(),
            self.gateway.fetch_groups()
        )
        .context("failed to load grouping state")?;

        let session = GroupEditorSession::from_payloads(catalog.into_catalog(), groups)
            .context("stored groups are inconsistent")?;
        info!(
            metrics = session.catalog().len(),
            groups = session.registry().len(),
            "grouping session opened"
        );

        Ok(SharedSession::new(
            session,
            Arc::clone(&self.gateway),
            self.metrics.clone(),
            &self.config.session,
        ))
    }
}

/// Install a compact `tracing` subscriber honouring `RUST_LOG`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("metric_groups=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .try_init();
}
