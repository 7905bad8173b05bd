//! Boundary to the remote grouping API.
//!
//! The engine only ever sends complete, validated snapshots through
//! [`PersistenceGateway::save_all`]; ordering changes go through the lighter
//! [`PersistenceGateway::save_order`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{Metric, MetricCatalog};
use crate::registry::{Group, GroupRegistry, RegistryError};

pub mod http;
pub mod memory;

pub use http::HttpGateway;
pub use memory::{GatewayCall, MemoryGateway};

/// Failure talking to the remote API. Local state is never rolled back on
/// these; the caller may retry the same save.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("backend rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },
}

/// Group as exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPayload {
    pub name: String,
    #[serde(default)]
    pub manual_list: Vec<String>,
    #[serde(default)]
    pub auto_rules: Vec<String>,
}

impl GroupPayload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manual_list: Vec::new(),
            auto_rules: Vec::new(),
        }
    }
}

impl From<&Group> for GroupPayload {
    fn from(group: &Group) -> Self {
        Self {
            name: group.name().to_string(),
            manual_list: group.manual_list().to_vec(),
            auto_rules: group.rules().to_vec(),
        }
    }
}

/// Full ordered snapshot of a registry.
pub fn snapshot(registry: &GroupRegistry) -> Vec<GroupPayload> {
    registry.iter().map(GroupPayload::from).collect()
}

/// Rebuild a registry from fetched payloads, keeping their order.
pub fn registry_from_payloads(groups: Vec<GroupPayload>) -> Result<GroupRegistry, RegistryError> {
    GroupRegistry::from_parts(
        groups
            .into_iter()
            .map(|g| (g.name, g.manual_list, g.auto_rules)),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Metrics context of a custom time series group. Only metric names and
/// descriptions feed the engine; dimensions are carried for callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
}

impl CatalogSnapshot {
    pub fn into_catalog(self) -> MetricCatalog {
        MetricCatalog::new(self.metrics)
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, RemoteError>;

    async fn fetch_groups(&self) -> Result<Vec<GroupPayload>, RemoteError>;

    /// Replace the complete remote group list atomically.
    async fn save_all(&self, groups: Vec<GroupPayload>) -> Result<(), RemoteError>;

    async fn save_order(&self, names: Vec<String>) -> Result<(), RemoteError>;

    /// Create or update a single group by name.
    async fn upsert_group(&self, group: GroupPayload) -> Result<(), RemoteError>;

    async fn delete_group(&self, name: &str) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_backend_field_names() {
        let payload = GroupPayload {
            name: "go".into(),
            manual_list: vec!["http_requests_total".into()],
            auto_rules: vec!["^go_".into()],
        };
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "name": "go",
                "manual_list": ["http_requests_total"],
                "auto_rules": ["^go_"],
            })
        );
    }

    #[test]
    fn missing_lists_default_to_empty() {
        let payload: GroupPayload = serde_json::from_str(r#"{"name":"bare"}"#).expect("parse");
        assert!(payload.manual_list.is_empty());
        assert!(payload.auto_rules.is_empty());
    }

    #[test]
    fn catalog_snapshot_ignores_extra_fields() {
        let raw = r#"{
            "metrics": [
                {"name": "go_heap_bytes", "description": "heap", "type": "metric", "unit": "bytes"},
                {"name": "go_requests_total"}
            ],
            "dimensions": [{"name": "instance", "common": true}]
        }"#;
        let snapshot: CatalogSnapshot = serde_json::from_str(raw).expect("parse");
        let catalog = snapshot.into_catalog();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.get("go_heap_bytes").and_then(Metric::description),
            Some("heap")
        );
    }

    #[test]
    fn registry_round_trips_through_payloads() {
        let payloads = vec![
            GroupPayload {
                name: "b".into(),
                manual_list: vec!["x".into()],
                auto_rules: vec![],
            },
            GroupPayload {
                name: "a".into(),
                manual_list: vec![],
                auto_rules: vec!["^y".into()],
            },
        ];
        let registry = registry_from_payloads(payloads.clone()).expect("load");
        assert_eq!(snapshot(&registry), payloads);
    }
}
