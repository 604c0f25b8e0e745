use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, ClientBuilder, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::layout;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side TLS for endpoints behind a private CA or requiring mTLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM bundle trusted in addition to the built-in roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Client certificate (PEM); requires `keyFile`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {what} {}", path.display()))?;
    if !String::from_utf8_lossy(&pem).contains("-----BEGIN ") {
        bail!("{what} {} is not PEM encoded", path.display());
    }
    Ok(pem)
}

impl TlsConfig {
    fn apply(&self, mut builder: ClientBuilder) -> Result<ClientBuilder> {
        if let Some(ca) = &self.ca_file {
            let pem = read_pem(ca, "CA file")?;
            let cert = Certificate::from_pem(&pem).with_context(|| format!("parsing CA file {}", ca.display()))?;
            builder = builder.add_root_certificate(cert);
        }
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                let mut pem = read_pem(cert, "client certificate")?;
                pem.push(b'\n');
                pem.extend(read_pem(key, "client key")?);
                let identity = Identity::from_pem(&pem).context("loading client certificate and key")?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => bail!("tls certFile and keyFile must be set together"),
        }
        if self.insecure_skip_verify {
            warn!("TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }
}

/// Shared HTTP client released on close; sends after close fail.
pub(crate) struct HttpPool {
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpPool {
    pub(crate) fn new(timeout: Option<Duration>, tls: Option<&TlsConfig>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout.unwrap_or(DEFAULT_TIMEOUT));
        if let Some(tls) = tls {
            builder = tls.apply(builder).context("setting up TLS")?;
        }
        let client = builder.build().context("building http client")?;
        Ok(Self { client: RwLock::new(Some(client)) })
    }

    pub(crate) fn client(&self) -> Result<reqwest::Client> {
        let guard = self.client.read().unwrap_or_else(|p| p.into_inner());
        guard.clone().ok_or_else(|| anyhow!("sink closed"))
    }

    pub(crate) fn close(&self) {
        self.client.write().unwrap_or_else(|p| p.into_inner()).take();
    }
}

/// Configured headers with placeholders expanded against the event.
pub(crate) fn headers(configured: &BTreeMap<String, String>, event: &Value) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(configured.len());
    for (name, template) in configured {
        let name = HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("invalid header name {name:?}"))?;
        let value = HeaderValue::from_str(&layout::render_str(template, event))
            .with_context(|| format!("invalid value for header {name}"))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Non-2xx responses become errors carrying the response body.
pub(crate) async fn expect_success(resp: reqwest::Response, what: &str) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("{what} returned {status}: {body}"));
    }
    Ok(body)
}

pub(crate) fn seconds(v: Option<u64>) -> Option<Duration> {
    v.filter(|s| *s > 0).map(Duration::from_secs)
}
