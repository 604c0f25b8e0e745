//! evex exporter: turns a configuration document into a running pipeline.
//!
//! watcher -> router -> receivers. The registry and router are built first and
//! can be exercised without a cluster; [`Exporter::start`] adds the watcher.

#![forbid(unsafe_code)]

pub mod config;

pub use config::Config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use evex_core::{EventHandler, ExporterMetrics, ReceiverRegistry};
use evex_kubehub::EventWatcher;
use evex_route::{Route, Router};
use evex_sinks::Receivers;
use tracing::{info, warn};

/// Registry plus router, sharing one set of counters.
pub struct Pipeline {
    receivers: Arc<Receivers>,
    router: Arc<Router>,
    metrics: Arc<ExporterMetrics>,
}

impl Pipeline {
    /// Validate `cfg` and build every declared receiver.
    pub fn from_config(cfg: &Config, metrics: Arc<ExporterMetrics>) -> Result<Self> {
        let route = cfg.validate()?;
        let mut receivers = Receivers::new(cfg.registry_options(), Arc::clone(&metrics));
        for r in &cfg.receivers {
            let sink = r.build().with_context(|| format!("building receiver {:?}", r.name))?;
            receivers.register(&r.name, sink)?;
            info!(receiver = %r.name, kind = r.kind()?, "receiver ready");
        }
        Self::from_parts(route, receivers, metrics)
    }

    /// Wire an already populated registry; the route may only name its receivers.
    pub fn from_parts(route: Route, receivers: Receivers, metrics: Arc<ExporterMetrics>) -> Result<Self> {
        config::check_references(&route, |name| receivers.contains(name))?;
        let receivers = Arc::new(receivers);
        let registry: Arc<dyn ReceiverRegistry> = Arc::clone(&receivers) as Arc<dyn ReceiverRegistry>;
        let router = Arc::new(Router::new(route, registry));
        Ok(Self { receivers, router, metrics })
    }

    pub fn router(&self) -> &Arc<Router> { &self.router }

    pub fn receivers(&self) -> &Arc<Receivers> { &self.receivers }

    pub fn metrics(&self) -> &Arc<ExporterMetrics> { &self.metrics }

    pub fn handler(&self) -> EventHandler { self.router.handler() }

    /// Swap in the route from `cfg`. Receivers are fixed for the process
    /// lifetime, so the new tree may only reference ones already registered.
    /// On error the current tree keeps serving.
    pub fn reload_route(&self, cfg: &Config) -> Result<()> {
        let route = Route::compile(&cfg.route).context("compiling route")?;
        config::check_references(&route, |name| self.receivers.contains(name))?;
        self.router.reload(route);
        Ok(())
    }

    /// Wait for in-flight deliveries, then close every receiver.
    pub async fn close(&self) {
        self.receivers.close().await;
    }
}

/// A running exporter.
pub struct Exporter {
    pipeline: Pipeline,
    watcher: EventWatcher,
    config_path: Option<PathBuf>,
}

impl Exporter {
    pub fn start(client: kube::Client, cfg: &Config, config_path: Option<PathBuf>) -> Result<Self> {
        let metrics = Arc::new(ExporterMetrics::new(&cfg.metrics_name_prefix));
        metrics.publish_build_info();
        let pipeline = Pipeline::from_config(cfg, Arc::clone(&metrics))?;
        let wcfg = cfg.watcher_config();
        let mut watcher = EventWatcher::new(client, &wcfg, metrics, pipeline.handler());
        watcher.start();
        info!(
            ns = wcfg.namespace.as_deref().unwrap_or("*"),
            max_age = ?wcfg.max_event_age,
            omit_lookup = wcfg.omit_lookup,
            receivers = pipeline.receivers.names().len(),
            "exporter started"
        );
        Ok(Self { pipeline, watcher, config_path })
    }

    pub fn pipeline(&self) -> &Pipeline { &self.pipeline }

    /// Re-read the configuration file and swap the route tree.
    pub fn reload_route(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            warn!("no configuration file to reload from");
            return Ok(());
        };
        let cfg = Config::load(path)?;
        self.pipeline.reload_route(&cfg)
    }

    /// Stop watching first so nothing new is routed, then drain delivery.
    pub async fn shutdown(mut self) {
        self.watcher.stop().await;
        self.pipeline.close().await;
        let s = self.pipeline.metrics.snapshot();
        info!(
            processed = s.events_processed,
            discarded = s.events_discarded,
            send_errors = s.send_errors,
            watch_errors = s.watch_errors,
            "exporter stopped"
        );
    }
}
