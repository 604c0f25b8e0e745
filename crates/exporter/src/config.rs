use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use evex_core::counters::DEFAULT_PREFIX;
use evex_kubehub::WatcherConfig;
use evex_route::{Route, RouteSpec};
use evex_sinks::{ReceiverConfig, RegistryOptions};
use serde::{Deserialize, Serialize};

fn default_max_event_age() -> u64 { 5 }
fn default_cache_size() -> usize { 1024 }
fn default_prefix() -> String { DEFAULT_PREFIX.to_string() }
fn default_stop_timeout() -> u64 { 10 }
fn default_max_inflight() -> usize { 64 }

/// Exporter configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Empty watches every namespace.
    #[serde(default)]
    pub namespace: String,
    /// 0 keeps events of any age.
    #[serde(default = "default_max_event_age")]
    pub max_event_age_seconds: u64,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default)]
    pub omit_lookup: bool,
    #[serde(default = "default_prefix")]
    pub metrics_name_prefix: String,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
    /// 0 leaves sends unbounded at the registry level.
    #[serde(default)]
    pub send_timeout_seconds: u64,
    #[serde(default = "default_max_inflight")]
    pub max_inflight_per_receiver: usize,
    #[serde(default)]
    pub route: RouteSpec,
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            max_event_age_seconds: default_max_event_age(),
            cache_size: default_cache_size(),
            omit_lookup: false,
            metrics_name_prefix: default_prefix(),
            stop_timeout_seconds: default_stop_timeout(),
            send_timeout_seconds: 0,
            max_inflight_per_receiver: default_max_inflight(),
            route: RouteSpec::default(),
            receivers: Vec::new(),
        }
    }
}

/// Replace `${NAME}` with the variable's value (empty when unset).
/// A bare `$` is left alone so regex anchors survive.
pub fn expand_env(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else { break };
        out.push_str(&rest[..start]);
        let name = &rest[start + 2..start + 2 + len];
        out.push_str(&lookup(name).unwrap_or_default());
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    out
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let expanded = expand_env(text, |name| std::env::var(name).ok());
        serde_yaml::from_str(&expanded).context("parsing configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Check receivers and compile the route tree. Every receiver the tree
    /// names must be declared.
    pub fn validate(&self) -> Result<Route> {
        let mut names: HashSet<&str> = HashSet::new();
        for r in &self.receivers {
            if r.name.is_empty() {
                bail!("receiver without a name");
            }
            if !names.insert(r.name.as_str()) {
                bail!("duplicate receiver name {:?}", r.name);
            }
            r.kind()?;
        }
        let route = Route::compile(&self.route).context("compiling route")?;
        check_references(&route, |name| names.contains(name))?;
        Ok(route)
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            namespace: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
            max_event_age: Some(self.max_event_age_seconds).filter(|s| *s > 0).map(Duration::from_secs),
            omit_lookup: self.omit_lookup,
            cache_size: self.cache_size,
            stop_timeout: Duration::from_secs(self.stop_timeout_seconds),
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            max_inflight_per_receiver: self.max_inflight_per_receiver,
            send_timeout: Some(self.send_timeout_seconds).filter(|s| *s > 0).map(Duration::from_secs),
        }
    }
}

pub(crate) fn check_references(route: &Route, known: impl Fn(&str) -> bool) -> Result<()> {
    let unknown: Vec<String> = route.receivers().into_iter().filter(|n| !known(n.as_str())).collect();
    if !unknown.is_empty() {
        bail!("route references unknown receivers: {}", unknown.join(", "));
    }
    Ok(())
}
