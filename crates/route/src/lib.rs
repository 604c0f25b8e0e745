//! evex route: rule tree deciding which receivers get an event.
//!
//! Each node is evaluated depth first:
//! - any matching `drop` rule discards the event for the node and its subtree;
//! - every `match` rule must hold (an empty list always holds);
//! - on a match the node's receivers are sent the event and every child is
//!   evaluated independently, so sibling branches can all fire.
//!
//! A [`Router`] serves one immutable tree and swaps in a rebuilt one on reload.

#![forbid(unsafe_code)]

mod rule;

pub use rule::{ExactMatch, Matcher, MatcherSpec, RegexMatch, Rule, RuleSpec};

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use evex_core::{EnhancedEvent, EventHandler, ReceiverRegistry};
use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::rule::EventView;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid pattern for {field}: {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
}

/// Route node as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop: Vec<RuleSpec>,
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<RuleSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receivers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteSpec>,
}

/// Compiled, immutable route node.
#[derive(Debug, Clone, Default)]
pub struct Route {
    drop: Vec<Rule>,
    matchers: Vec<Rule>,
    /// Node receivers followed by receivers named on match rules, deduplicated.
    targets: Vec<String>,
    routes: Vec<Route>,
}

impl Route {
    pub fn compile(spec: &RouteSpec) -> Result<Self, RouteError> {
        let drop = spec.drop.iter().map(Rule::compile).collect::<Result<Vec<_>, _>>()?;
        let matchers = spec.match_.iter().map(Rule::compile).collect::<Result<Vec<_>, _>>()?;
        let mut targets: Vec<String> = Vec::new();
        let named = spec.receivers.iter().map(String::as_str).chain(matchers.iter().filter_map(Rule::receiver));
        for name in named {
            if !name.is_empty() && !targets.iter().any(|t| t == name) {
                targets.push(name.to_string());
            }
        }
        let routes = spec.routes.iter().map(Route::compile).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { drop, matchers, targets, routes })
    }

    /// Receivers this node sends to when it matches.
    pub fn targets(&self) -> &[String] { &self.targets }

    pub fn children(&self) -> &[Route] { &self.routes }

    /// Every receiver name referenced anywhere in the tree.
    pub fn receivers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_receivers(&mut out);
        out
    }

    fn collect_receivers(&self, out: &mut BTreeSet<String>) {
        out.extend(self.targets.iter().cloned());
        for child in &self.routes {
            child.collect_receivers(out);
        }
    }

    /// Walk the tree for one event, dispatching to `registry` on every match.
    pub fn process_event(&self, event: &Arc<EnhancedEvent>, registry: &dyn ReceiverRegistry) {
        let view = EventView::new(event);
        self.walk(&view, event, registry);
    }

    fn walk(&self, view: &EventView<'_>, event: &Arc<EnhancedEvent>, registry: &dyn ReceiverRegistry) {
        if self.drop.iter().any(|r| r.matches_view(view)) {
            trace!(name = %event.record.metadata.name, "event dropped by route");
            return;
        }
        if !self.matchers.iter().all(|r| r.matches_view(view)) {
            return;
        }
        for target in &self.targets {
            trace!(receiver = %target, name = %event.record.metadata.name, "routing event");
            registry.send_event(target, event);
        }
        for child in &self.routes {
            child.walk(view, event, registry);
        }
    }
}

/// Routes events through the current tree generation.
pub struct Router {
    route: ArcSwap<Route>,
    registry: Arc<dyn ReceiverRegistry>,
}

impl Router {
    pub fn new(route: Route, registry: Arc<dyn ReceiverRegistry>) -> Self {
        Self { route: ArcSwap::from_pointee(route), registry }
    }

    pub fn process_event(&self, event: &Arc<EnhancedEvent>) {
        let route = self.route.load();
        route.process_event(event, self.registry.as_ref());
    }

    /// Replace the whole tree. Traversals already running finish on the old one.
    pub fn reload(&self, route: Route) {
        let receivers = route.receivers().len();
        self.route.store(Arc::new(route));
        info!(receivers, "route tree reloaded");
    }

    pub fn current(&self) -> Arc<Route> { self.route.load_full() }

    pub fn registry(&self) -> &Arc<dyn ReceiverRegistry> { &self.registry }

    /// Adapter for the watcher's handler slot.
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let router = Arc::clone(self);
        Arc::new(move |ev: EnhancedEvent| router.process_event(&Arc::new(ev)))
    }
}
