//! evex sinks: where routed events go.
//!
//! [`Receivers`] binds names to [`Sink`] adapters and delivers each routed
//! event on its own task. Adapters are built from [`ReceiverConfig`].

#![forbid(unsafe_code)]

mod http;
pub mod layout;
mod loki;
mod registry;
mod stdout;
mod teams;
mod webhook;

pub use http::TlsConfig;
pub use loki::{LokiConfig, LokiSink};
pub use registry::{Receivers, RegistryOptions};
pub use stdout::{StdoutConfig, StdoutSink};
pub use teams::{TeamsConfig, TeamsSink};
pub use webhook::{WebhookConfig, WebhookSink};

use std::sync::Arc;

use anyhow::{anyhow, Result};
use evex_core::Sink;
use serde::{Deserialize, Serialize};

/// One named destination; exactly one adapter block must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReceiverConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<StdoutConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loki: Option<LokiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<TeamsConfig>,
}

impl ReceiverConfig {
    fn configured(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.stdout.is_some() { kinds.push("stdout"); }
        if self.webhook.is_some() { kinds.push("webhook"); }
        if self.loki.is_some() { kinds.push("loki"); }
        if self.teams.is_some() { kinds.push("teams"); }
        kinds
    }

    /// Adapter kind, or an error unless exactly one is configured.
    pub fn kind(&self) -> Result<&'static str> {
        match self.configured().as_slice() {
            [one] => Ok(one),
            [] => Err(anyhow!("receiver {:?} has no sink configured", self.name)),
            many => Err(anyhow!("receiver {:?} configures several sinks: {}", self.name, many.join(", "))),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn Sink>> {
        self.kind()?;
        if let Some(c) = &self.stdout { return Ok(Arc::new(StdoutSink::new(c.clone()))); }
        if let Some(c) = &self.webhook { return Ok(Arc::new(WebhookSink::new(c.clone())?)); }
        if let Some(c) = &self.loki { return Ok(Arc::new(LokiSink::new(c.clone())?)); }
        if let Some(c) = &self.teams { return Ok(Arc::new(TeamsSink::new(c.clone())?)); }
        Err(anyhow!("receiver {:?} has no sink configured", self.name))
    }
}
