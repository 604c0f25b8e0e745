use std::collections::BTreeMap;

use anyhow::Result;
use evex_core::{EnhancedEvent, Sink};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::{self, HttpPool};
use crate::layout;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebhookConfig {
    pub endpoint: String,
    /// Header values may contain `{{ path }}` placeholders.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// POSTs each event as JSON to a fixed endpoint.
pub struct WebhookSink {
    cfg: WebhookConfig,
    pool: HttpPool,
}

impl WebhookSink {
    pub fn new(cfg: WebhookConfig) -> Result<Self> {
        let pool = HttpPool::new(http::seconds(cfg.timeout_seconds), None)?;
        Ok(Self { cfg, pool })
    }
}

#[async_trait::async_trait]
impl Sink for WebhookSink {
    async fn send(&self, event: &EnhancedEvent) -> Result<()> {
        let json = event.to_json();
        let body = match &self.cfg.layout {
            Some(l) => layout::render(l, &json),
            None => json.clone(),
        };
        let resp = self
            .pool
            .client()?
            .post(&self.cfg.endpoint)
            .headers(http::headers(&self.cfg.headers, &json)?)
            .json(&body)
            .send()
            .await?;
        http::expect_success(resp, "webhook").await?;
        Ok(())
    }

    async fn close(&self) { self.pool.close(); }
}
