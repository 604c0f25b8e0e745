use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use evex_core::{EnhancedEvent, Sink};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::http::{self, HttpPool};
use crate::layout;

/// Incoming webhooks answer 200 even when throttled; the body says so.
const RATE_LIMITED: &str = "Microsoft Teams endpoint returned HTTP error 429";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TeamsConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Posts a MessageCard summary to a Teams incoming webhook.
pub struct TeamsSink {
    cfg: TeamsConfig,
    pool: HttpPool,
}

fn field<'a>(payload: &'a Value, key: &str) -> std::borrow::Cow<'a, str> {
    evex_core::path::lookup_str(payload, key).unwrap_or_default()
}

impl TeamsSink {
    pub fn new(cfg: TeamsConfig) -> Result<Self> {
        let pool = HttpPool::new(http::seconds(cfg.timeout_seconds), None)?;
        Ok(Self { cfg, pool })
    }

    pub(crate) fn card(&self, event: &EnhancedEvent) -> Value {
        let payload = layout::payload(self.cfg.layout.as_ref(), event);
        let text = format!(
            "Event: {}\n\nStatus: {}\n\nMetadata: {}",
            field(&payload, "message"),
            field(&payload, "reason"),
            field(&payload, "metadata"),
        );
        json!({
            "@type": "MessageCard",
            "@context": "https://schema.org/extensions",
            "summary": "event",
            "text": text,
        })
    }
}

#[async_trait::async_trait]
impl Sink for TeamsSink {
    async fn send(&self, event: &EnhancedEvent) -> Result<()> {
        let json = event.to_json();
        let resp = self
            .pool
            .client()?
            .post(&self.cfg.endpoint)
            .headers(http::headers(&self.cfg.headers, &json)?)
            .json(&self.card(event))
            .send()
            .await?;
        let body = http::expect_success(resp, "teams").await?;
        if body.contains(RATE_LIMITED) {
            return Err(anyhow!("teams rate limited: {body}"));
        }
        Ok(())
    }

    async fn close(&self) { self.pool.close(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_summarises_message_and_reason() {
        let sink = TeamsSink::new(TeamsConfig { endpoint: "http://teams".into(), ..Default::default() }).unwrap();
        let mut ev = EnhancedEvent::default();
        ev.record.message = "Started container".into();
        ev.record.reason = "Started".into();
        ev.record.metadata.name = "web-0.17a".into();
        let card = sink.card(&ev);
        let text = card["text"].as_str().unwrap();
        assert!(text.starts_with("Event: Started container\n\nStatus: Started\n\nMetadata: {"));
        assert!(text.contains("web-0.17a"));
        assert_eq!(card["summary"], "event");
    }
}
