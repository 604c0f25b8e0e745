use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Utc;
use evex_core::{EnhancedEvent, Sink};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::http::{self, HttpPool, TlsConfig};
use crate::layout;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LokiConfig {
    /// Push endpoint, e.g. `http://loki:3100/loki/api/v1/push`.
    pub url: String,
    /// Stream labels; values may contain `{{ path }}` placeholders.
    #[serde(default)]
    pub stream_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// Pushes each event as a single log line into a Loki stream.
pub struct LokiSink {
    cfg: LokiConfig,
    pool: HttpPool,
}

impl LokiSink {
    pub fn new(cfg: LokiConfig) -> Result<Self> {
        let pool = HttpPool::new(http::seconds(cfg.timeout_seconds), cfg.tls.as_ref())?;
        Ok(Self { cfg, pool })
    }

    pub(crate) fn push_body(&self, json: &Value, now_nanos: i64) -> Result<Value> {
        let labels: BTreeMap<&str, String> = self
            .cfg
            .stream_labels
            .iter()
            .map(|(k, v)| (k.as_str(), layout::render_str(v, json)))
            .collect();
        let line = match &self.cfg.layout {
            Some(l) => serde_json::to_string(&layout::render(l, json))?,
            None => serde_json::to_string(json)?,
        };
        Ok(json!({
            "streams": [{
                "stream": labels,
                "values": [[now_nanos.to_string(), line]],
            }]
        }))
    }
}

#[async_trait::async_trait]
impl Sink for LokiSink {
    async fn send(&self, event: &EnhancedEvent) -> Result<()> {
        let json = event.to_json();
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let body = self.push_body(&json, now)?;
        let mut req = self
            .pool
            .client()?
            .post(&self.cfg.url)
            .headers(http::headers(&self.cfg.headers, &json)?)
            .json(&body);
        if let (Some(user), Some(pass)) = (&self.cfg.username, &self.cfg.password) {
            if !user.is_empty() {
                req = req.basic_auth(user, Some(pass));
            }
        }
        http::expect_success(req.send().await?, "loki").await?;
        Ok(())
    }

    async fn close(&self) { self.pool.close(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_body_templates_stream_labels() {
        let cfg: LokiConfig = serde_yaml::from_str(
            r#"
url: http://loki:3100/loki/api/v1/push
streamLabels:
  source: kubernetes-event-exporter
  namespace: "{{ metadata.namespace }}"
layout:
  msg: "{{ message }}"
"#,
        )
        .unwrap();
        let sink = LokiSink::new(cfg).unwrap();
        let ev = json!({"message": "pulled", "metadata": {"namespace": "prod"}});
        let body = sink.push_body(&ev, 42).unwrap();
        assert_eq!(
            body,
            json!({
                "streams": [{
                    "stream": {"namespace": "prod", "source": "kubernetes-event-exporter"},
                    "values": [["42", "{\"msg\":\"pulled\"}"]]
                }]
            })
        );
    }

    fn with_tls(tls: TlsConfig) -> Result<LokiSink> {
        LokiSink::new(LokiConfig { url: "https://loki.internal/loki/api/v1/push".into(), tls: Some(tls), ..Default::default() })
    }

    #[test]
    fn unreadable_ca_file_fails_construction() {
        let err = with_tls(TlsConfig { ca_file: Some("/nonexistent/evex/ca.pem".into()), ..Default::default() }).err().unwrap();
        assert!(format!("{err:#}").contains("CA file"), "{err:#}");
    }

    #[test]
    fn non_pem_ca_file_fails_construction() {
        let path = std::env::temp_dir().join(format!("evex-loki-ca-{}.txt", std::process::id()));
        std::fs::write(&path, b"not a certificate").unwrap();
        let res = with_tls(TlsConfig { ca_file: Some(path.clone()), ..Default::default() });
        std::fs::remove_file(&path).unwrap();
        assert!(format!("{:#}", res.err().unwrap()).contains("not PEM"));
    }

    #[test]
    fn tls_block_parses_from_yaml() {
        let cfg: LokiConfig = serde_yaml::from_str(
            "url: https://loki.internal/push\ntls: {caFile: /etc/ssl/loki-ca.pem, insecureSkipVerify: false}",
        )
        .unwrap();
        let tls = cfg.tls.unwrap();
        assert_eq!(tls.ca_file.as_deref(), Some(std::path::Path::new("/etc/ssl/loki-ca.pem")));
        assert!(!tls.insecure_skip_verify);
        assert!(with_tls(TlsConfig { insecure_skip_verify: true, ..Default::default() }).is_ok());
    }
}
