//! Predicates over an enriched event.
//!
//! Every field set on a rule must match (AND). Matchers are either literal
//! (`{exact: ...}`) or regular expressions searched anywhere in the value
//! (plain strings and `{regex: ...}`).

use std::collections::BTreeMap;

use evex_core::{path, EnhancedEvent};
use once_cell::unsync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::RouteError;

/// `{exact: ...}`; no other keys allowed alongside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExactMatch {
    pub exact: String,
}

/// `{regex: ...}`; no other keys allowed alongside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegexMatch {
    pub regex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum MatcherSpec {
    Pattern(String),
    Exact(ExactMatch),
    Regex(RegexMatch),
}

impl MatcherSpec {
    pub fn exact(value: impl Into<String>) -> Self { Self::Exact(ExactMatch { exact: value.into() }) }
    pub fn regex(pattern: impl Into<String>) -> Self { Self::Regex(RegexMatch { regex: pattern.into() }) }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleSpec {
    /// Involved object labels, key -> matcher.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, MatcherSpec>,
    /// Involved object annotations, key -> matcher.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, MatcherSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MatcherSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<MatcherSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MatcherSpec>,
    /// Namespace of the event itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<MatcherSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<MatcherSpec>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<MatcherSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<MatcherSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<MatcherSpec>,
    /// Dotted paths into the serialized event, path -> matcher.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, MatcherSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn compile(field: &str, spec: &MatcherSpec) -> Result<Self, RouteError> {
        let pattern = match spec {
            MatcherSpec::Exact(m) => return Ok(Matcher::Exact(m.exact.clone())),
            MatcherSpec::Pattern(p) | MatcherSpec::Regex(RegexMatch { regex: p }) => p,
        };
        Regex::new(pattern)
            .map(Matcher::Pattern)
            .map_err(|source| RouteError::InvalidPattern { field: field.to_string(), source })
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::Exact(want) => want == value,
            Matcher::Pattern(re) => re.is_match(value),
        }
    }
}

/// One enriched event plus its JSON form, serialized only if a rule asks for a path.
pub(crate) struct EventView<'a> {
    pub(crate) event: &'a EnhancedEvent,
    json: OnceCell<serde_json::Value>,
}

impl<'a> EventView<'a> {
    pub(crate) fn new(event: &'a EnhancedEvent) -> Self {
        Self { event, json: OnceCell::new() }
    }

    fn json(&self) -> &serde_json::Value {
        self.json.get_or_init(|| self.event.to_json())
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    labels: Vec<(String, Matcher)>,
    annotations: Vec<(String, Matcher)>,
    message: Option<Matcher>,
    api_version: Option<Matcher>,
    kind: Option<Matcher>,
    namespace: Option<Matcher>,
    reason: Option<Matcher>,
    type_: Option<Matcher>,
    component: Option<Matcher>,
    host: Option<Matcher>,
    fields: Vec<(String, Matcher)>,
    min_count: Option<i32>,
    receiver: Option<String>,
}

fn compile_opt(field: &str, spec: &Option<MatcherSpec>) -> Result<Option<Matcher>, RouteError> {
    spec.as_ref().map(|s| Matcher::compile(field, s)).transpose()
}

fn compile_map(field: &str, specs: &BTreeMap<String, MatcherSpec>) -> Result<Vec<(String, Matcher)>, RouteError> {
    specs
        .iter()
        .map(|(k, s)| Matcher::compile(&format!("{field}.{k}"), s).map(|m| (k.clone(), m)))
        .collect()
}

fn opt_matches(m: &Option<Matcher>, value: &str) -> bool {
    m.as_ref().map(|m| m.is_match(value)).unwrap_or(true)
}

impl Rule {
    pub fn compile(spec: &RuleSpec) -> Result<Self, RouteError> {
        Ok(Self {
            labels: compile_map("labels", &spec.labels)?,
            annotations: compile_map("annotations", &spec.annotations)?,
            message: compile_opt("message", &spec.message)?,
            api_version: compile_opt("apiVersion", &spec.api_version)?,
            kind: compile_opt("kind", &spec.kind)?,
            namespace: compile_opt("namespace", &spec.namespace)?,
            reason: compile_opt("reason", &spec.reason)?,
            type_: compile_opt("type", &spec.type_)?,
            component: compile_opt("component", &spec.component)?,
            host: compile_opt("host", &spec.host)?,
            fields: compile_map("fields", &spec.fields)?,
            min_count: spec.min_count,
            receiver: spec.receiver.clone().filter(|r| !r.is_empty()),
        })
    }

    pub fn receiver(&self) -> Option<&str> { self.receiver.as_deref() }

    pub fn matches(&self, ev: &EnhancedEvent) -> bool {
        self.matches_view(&EventView::new(ev))
    }

    pub(crate) fn matches_view(&self, view: &EventView<'_>) -> bool {
        let ev = view.event;
        let rec = &ev.record;
        let io = &ev.involved_object;

        let scalars_ok = opt_matches(&self.message, &rec.message)
            && opt_matches(&self.api_version, &io.reference.api_version)
            && opt_matches(&self.kind, &io.reference.kind)
            && opt_matches(&self.namespace, rec.metadata.namespace.as_deref().unwrap_or(""))
            && opt_matches(&self.reason, &rec.reason)
            && opt_matches(&self.type_, &rec.type_)
            && opt_matches(&self.component, rec.source.component.as_deref().unwrap_or(""))
            && opt_matches(&self.host, rec.source.host.as_deref().unwrap_or(""));
        if !scalars_ok {
            return false;
        }
        if let Some(min) = self.min_count {
            if rec.effective_count() < min {
                return false;
            }
        }
        let labels_ok = self.labels.iter().all(|(k, m)| io.labels.get(k).map(|v| m.is_match(v)).unwrap_or(false));
        let annos_ok = self.annotations.iter().all(|(k, m)| io.annotations.get(k).map(|v| m.is_match(v)).unwrap_or(false));
        if !(labels_ok && annos_ok) {
            return false;
        }
        self.fields
            .iter()
            .all(|(p, m)| path::lookup_str(view.json(), p).map(|v| m.is_match(&v)).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evex_core::{EventSeries, ObjectRef, RawEvent};

    fn event() -> EnhancedEvent {
        let mut raw = RawEvent::default();
        raw.record.reason = "BackOff".into();
        raw.record.message = "Back-off restarting failed container".into();
        raw.record.type_ = "Warning".into();
        raw.record.count = 3;
        raw.record.metadata.namespace = Some("prod".into());
        raw.record.source.component = Some("kubelet".into());
        raw.involved_object = ObjectRef { api_version: "v1".into(), kind: "Pod".into(), namespace: Some("prod".into()), name: "web-1".into(), ..Default::default() };
        let mut meta = evex_core::ObjectMetadata::default();
        meta.labels.insert("app".into(), "web".into());
        meta.annotations.insert("team".into(), "payments".into());
        EnhancedEvent::with_metadata(raw, meta)
    }

    fn pat(s: &str) -> MatcherSpec { MatcherSpec::Pattern(s.into()) }

    #[test]
    fn empty_rule_matches_everything() {
        let r = Rule::compile(&RuleSpec::default()).unwrap();
        assert!(r.matches(&event()));
    }

    #[test]
    fn all_fields_must_match() {
        let spec = RuleSpec { kind: Some(pat("Pod")), reason: Some(pat("Back")), type_: Some(pat("Warning")), ..Default::default() };
        assert!(Rule::compile(&spec).unwrap().matches(&event()));
        let spec = RuleSpec { kind: Some(pat("Pod")), reason: Some(pat("^Failed$")), ..Default::default() };
        assert!(!Rule::compile(&spec).unwrap().matches(&event()));
    }

    #[test]
    fn exact_versus_pattern() {
        let exact = RuleSpec { reason: Some(MatcherSpec::exact("Back")), ..Default::default() };
        assert!(!Rule::compile(&exact).unwrap().matches(&event()));
        let exact = RuleSpec { reason: Some(MatcherSpec::exact("BackOff")), ..Default::default() };
        assert!(Rule::compile(&exact).unwrap().matches(&event()));
        let re = RuleSpec { reason: Some(MatcherSpec::regex("^Back")), ..Default::default() };
        assert!(Rule::compile(&re).unwrap().matches(&event()));
    }

    #[test]
    fn labels_and_annotations_require_key() {
        let mut spec = RuleSpec::default();
        spec.labels.insert("app".into(), pat("^web$"));
        spec.annotations.insert("team".into(), pat("pay"));
        assert!(Rule::compile(&spec).unwrap().matches(&event()));
        spec.labels.insert("tier".into(), pat(".*"));
        assert!(!Rule::compile(&spec).unwrap().matches(&event()));
    }

    #[test]
    fn namespace_component_and_min_count() {
        let spec = RuleSpec { namespace: Some(pat("^prod$")), component: Some(pat("kubelet")), min_count: Some(3), ..Default::default() };
        assert!(Rule::compile(&spec).unwrap().matches(&event()));
        let spec = RuleSpec { min_count: Some(4), ..Default::default() };
        assert!(!Rule::compile(&spec).unwrap().matches(&event()));
        let mut ev = event();
        ev.record.series = Some(EventSeries { count: 10, last_observed_time: None });
        assert!(Rule::compile(&spec).unwrap().matches(&ev));
    }

    #[test]
    fn field_paths_resolve_against_event_json() {
        let mut spec = RuleSpec::default();
        spec.fields.insert("involvedObject.name".into(), pat("^web-"));
        spec.fields.insert("involvedObject.labels[app]".into(), MatcherSpec::exact("web"));
        assert!(Rule::compile(&spec).unwrap().matches(&event()));
        spec.fields.insert("involvedObject.missing".into(), pat(".*"));
        assert!(!Rule::compile(&spec).unwrap().matches(&event()));
    }

    #[test]
    fn invalid_pattern_names_the_field() {
        let mut spec = RuleSpec::default();
        spec.labels.insert("app".into(), pat("(unclosed"));
        let err = Rule::compile(&spec).unwrap_err();
        assert!(err.to_string().contains("labels.app"), "{err}");
    }

    #[test]
    fn matcher_forms_parse_and_mixed_forms_are_rejected() {
        let rule: RuleSpec = serde_yaml::from_str("reason: Back.*\ntype: {exact: Warning}\nkind: {regex: '^Pod$'}").unwrap();
        assert_eq!(rule.reason, Some(pat("Back.*")));
        assert_eq!(rule.type_, Some(MatcherSpec::exact("Warning")));
        assert_eq!(rule.kind, Some(MatcherSpec::regex("^Pod$")));

        assert!(serde_yaml::from_str::<RuleSpec>("reason: {exact: a, regex: b}").is_err());
        assert!(serde_yaml::from_str::<RuleSpec>("reason: {exact: a, ignoreCase: true}").is_err());
    }
}
