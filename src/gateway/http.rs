use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use super::{CatalogSnapshot, GroupPayload, PersistenceGateway, RemoteError};
use crate::config::ApiConfig;

const CATALOG_PATH: &str = "custom_report/get_custom_ts_fields/";
const GROUP_LIST_PATH: &str = "custom_report/custom_ts_grouping_rule_list/";
const SAVE_ALL_PATH: &str = "custom_report/modify_custom_ts_grouping_rule_list/";
const UPSERT_PATH: &str = "custom_report/create_or_update_grouping_rule/";
const DELETE_PATH: &str = "custom_report/delete_grouping_rule/";
const ORDER_PATH: &str = "custom_report/update_grouping_rule_order/";

/// Standard response wrapper of the monitoring API.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "default_result")]
    result: bool,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

fn default_result() -> bool {
    true
}

/// [`PersistenceGateway`] backed by the monitoring REST API, scoped to one
/// business and one custom time series group.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    bk_biz_id: i64,
    time_series_group_id: i64,
}

impl HttpGateway {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(2)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bk_biz_id: config.bk_biz_id,
            time_series_group_id: config.time_series_group_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).query(&[
            ("bk_biz_id", self.bk_biz_id),
            ("time_series_group_id", self.time_series_group_id),
        ])
    }

    fn post(&self, path: &str, mut body: Value) -> RequestBuilder {
        if let Value::Object(map) = &mut body {
            map.insert("bk_biz_id".into(), json!(self.bk_biz_id));
            map.insert(
                "time_series_group_id".into(),
                json!(self.time_series_group_id),
            );
        }
        self.client.post(self.url(path)).json(&body)
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<Option<T>, RemoteError> {
        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "grouping API returned error status");
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))?;

        if !envelope.result {
            return Err(RemoteError::Rejected {
                code: envelope.code.unwrap_or_default(),
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(envelope.data)
    }

    /// Send a write request whose response data is irrelevant.
    async fn send_ack(request: RequestBuilder) -> Result<(), RemoteError> {
        Self::send::<Value>(request).await.map(|_| ())
    }
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    #[instrument(skip(self), fields(ts_group = self.time_series_group_id))]
    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, RemoteError> {
        let snapshot: Option<CatalogSnapshot> = Self::send(self.get(CATALOG_PATH)).await?;
        let snapshot = snapshot.unwrap_or_default();
        info!(metrics = snapshot.metrics.len(), "fetched metric catalog");
        Ok(snapshot)
    }

    #[instrument(skip(self), fields(ts_group = self.time_series_group_id))]
    async fn fetch_groups(&self) -> Result<Vec<GroupPayload>, RemoteError> {
        let groups: Option<Vec<GroupPayload>> = Self::send(self.get(GROUP_LIST_PATH)).await?;
        let groups = groups.unwrap_or_default();
        info!(groups = groups.len(), "fetched grouping rules");
        Ok(groups)
    }

    #[instrument(skip(self, groups), fields(ts_group = self.time_series_group_id, groups = groups.len()))]
    async fn save_all(&self, groups: Vec<GroupPayload>) -> Result<(), RemoteError> {
        Self::send_ack(self.post(SAVE_ALL_PATH, json!({ "group_list": groups }))).await
    }

    #[instrument(skip(self, names), fields(ts_group = self.time_series_group_id))]
    async fn save_order(&self, names: Vec<String>) -> Result<(), RemoteError> {
        Self::send_ack(self.post(ORDER_PATH, json!({ "group_names": names }))).await
    }

    #[instrument(skip(self, group), fields(ts_group = self.time_series_group_id, group = %group.name))]
    async fn upsert_group(&self, group: GroupPayload) -> Result<(), RemoteError> {
        let body = json!({
            "name": group.name,
            "manual_list": group.manual_list,
            "auto_rules": group.auto_rules,
        });
        Self::send_ack(self.post(UPSERT_PATH, body)).await
    }

    #[instrument(skip(self), fields(ts_group = self.time_series_group_id))]
    async fn delete_group(&self, name: &str) -> Result<(), RemoteError> {
        Self::send_ack(self.post(DELETE_PATH, json!({ "name": name }))).await
    }
}
