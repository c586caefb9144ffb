//! Maps raw StatsD metric names onto Prometheus names and labels.
//!
//! Mappings come from a YAML file: an ordered list of glob (or regex)
//! patterns, each with a name template, label templates, and per-mapping
//! overrides for timer handling, buckets/quantiles and TTL. The first
//! matching mapping wins. A bounded LRU cache keyed by `name|kind` sits in
//! front of the scan and remembers misses too.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::event::{EventKind, Labels};
use crate::telemetry::Telemetry;

mod cache;
use cache::LookupCache;

/// Errors loading or compiling a mapping configuration.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The config file could not be read.
    #[error("failed to read mapping config {path:?}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid YAML for the expected schema.
    #[error("failed to parse mapping config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A match pattern did not compile.
    #[error("invalid match pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },
}

/// How a timer event is exported.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TimerType {
    /// Export as a quantile summary.
    Summary,
    /// Export as a bucketed histogram.
    Histogram,
}

/// What to do with events matching a mapping.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Translate and record the event.
    #[default]
    Map,
    /// Discard the event.
    Drop,
}

/// Pattern syntax for a mapping's `match` field.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// `*` matches one dot-separated component and captures it.
    Glob,
    /// The pattern is a raw regular expression.
    Regex,
}

/// A summary quantile target from the config file.
///
/// The `error` objective is accepted for compatibility; the sketch backing
/// summaries provides a global relative-error bound instead of per-quantile
/// objectives.
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectiveConfig {
    /// Quantile in `[0, 1]`.
    pub quantile: f64,
    /// Allowed error for this quantile.
    #[serde(default)]
    pub error: f64,
}

/// Fallbacks applied when a mapping (or no mapping) leaves a knob unset.
#[derive(Clone, Debug)]
pub struct Defaults {
    /// Timer handling when neither mapping nor config says otherwise.
    pub timer_type: TimerType,
    /// Histogram buckets, in seconds.
    pub buckets: Vec<f64>,
    /// Summary quantiles.
    pub quantiles: Vec<f64>,
    /// Series TTL; zero never expires.
    pub ttl: Duration,
    /// Pattern syntax for mappings that do not pick one.
    pub match_type: MatchType,
}

impl Default for Defaults {
    fn default() -> Defaults {
        Defaults {
            timer_type: TimerType::Summary,
            buckets: vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            quantiles: vec![0.5, 0.9, 0.99],
            ttl: Duration::ZERO,
            match_type: MatchType::Glob,
        }
    }
}

/// One compiled mapping rule.
#[derive(Debug)]
pub struct Mapping {
    pattern: Regex,
    raw_match: String,
    name_template: String,
    label_templates: Vec<(String, String)>,
    /// Record or drop matching events.
    pub action: ActionType,
    /// Timer handling override.
    pub timer_type: Option<TimerType>,
    /// Histogram bucket override.
    pub buckets: Option<Vec<f64>>,
    /// Summary quantile override.
    pub quantiles: Option<Vec<f64>>,
    /// TTL for series produced by this mapping; zero never expires.
    pub ttl: Duration,
    /// Help text override.
    pub help: Option<String>,
}

/// The outcome of a mapper lookup, shared via the cache.
#[derive(Debug)]
pub struct LookupResult {
    /// The winning mapping, or `None` when nothing matched.
    pub mapping: Option<Arc<Mapping>>,
    /// The expanded metric name (meaningful only when `mapping` is set).
    pub name: String,
    /// Labels to merge into the event's own.
    pub labels: Labels,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    mappings: Vec<RawMapping>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    timer_type: Option<TimerType>,
    buckets: Option<Vec<f64>>,
    quantiles: Option<Vec<ObjectiveConfig>>,
    ttl: Option<u64>,
    match_type: Option<MatchType>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMapping {
    #[serde(rename = "match")]
    match_pattern: String,
    match_type: Option<MatchType>,
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    timer_type: Option<TimerType>,
    buckets: Option<Vec<f64>>,
    quantiles: Option<Vec<ObjectiveConfig>>,
    ttl: Option<u64>,
    #[serde(default)]
    action: ActionType,
    help: Option<String>,
}

/// A compiled, immutable set of mappings plus its defaults. Swapped
/// atomically on reload.
#[derive(Debug)]
pub struct MappingSet {
    mappings: Vec<Arc<Mapping>>,
    defaults: Defaults,
    fingerprint: u64,
}

impl MappingSet {
    /// The fallback settings of this set.
    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }
}

impl Default for MappingSet {
    fn default() -> MappingSet {
        MappingSet { mappings: Vec::new(), defaults: Defaults::default(), fingerprint: 0 }
    }
}

/// Thread-safe mapping lookup with hot-reload support.
pub struct MetricMapper {
    active: RwLock<Arc<MappingSet>>,
    cache: LookupCache,
    telemetry: Arc<Telemetry>,
}

impl MetricMapper {
    /// Creates a mapper with no mappings and a cache bounded to
    /// `cache_entries`.
    pub fn new(cache_entries: usize, telemetry: Arc<Telemetry>) -> MetricMapper {
        MetricMapper {
            active: RwLock::new(Arc::new(MappingSet::default())),
            cache: LookupCache::new(cache_entries),
            telemetry,
        }
    }

    /// Loads (or reloads) the mapping file.
    ///
    /// Returns `Ok(false)` without touching the active mappings when the
    /// file content is unchanged since the last load.
    pub fn load_file(&self, path: &Path) -> Result<bool, MappingError> {
        let content = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.load_str(&content)
    }

    /// Loads mappings from a YAML string; see [`MetricMapper::load_file`].
    pub fn load_str(&self, content: &str) -> Result<bool, MappingError> {
        let mut hasher = FnvHasher::default();
        hasher.write(content.as_bytes());
        let fingerprint = hasher.finish();
        if self.active.read().fingerprint == fingerprint {
            return Ok(false);
        }

        let raw: RawConfig = serde_yaml::from_str(content)?;
        let compiled = compile(raw, fingerprint)?;
        *self.active.write() = Arc::new(compiled);
        self.cache.clear(&self.telemetry);
        Ok(true)
    }

    /// The active mapping set; cheap to take per event.
    pub fn snapshot(&self) -> Arc<MappingSet> {
        self.active.read().clone()
    }

    /// Finds the mapping decision for `(name, kind)`, consulting the cache
    /// first.
    pub fn lookup(&self, name: &str, kind: EventKind) -> Arc<LookupResult> {
        let key = format!("{name}|{}", kind.as_str());
        if let Some(result) = self.cache.get(&key, &self.telemetry) {
            return result;
        }

        let active = self.active.read().clone();
        let result = Arc::new(scan(&active, name));
        self.cache.put(key, result.clone(), &self.telemetry);
        result
    }

    /// Writes the compiled patterns as a DOT digraph, for debugging.
    pub fn dump_patterns(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        let active = self.active.read().clone();
        writeln!(writer, "digraph mappings {{")?;
        writeln!(writer, "  rankdir=LR;")?;
        writeln!(writer, "  root [shape=point];")?;
        for (i, mapping) in active.mappings.iter().enumerate() {
            writeln!(
                writer,
                "  m{i} [label=\"{}\"];",
                mapping.raw_match.replace('"', "\\\"")
            )?;
            writeln!(writer, "  root -> m{i};")?;
            let target = match mapping.action {
                ActionType::Drop => "(drop)".to_string(),
                ActionType::Map => mapping.name_template.replace('"', "\\\""),
            };
            writeln!(writer, "  n{i} [shape=box, label=\"{target}\"];")?;
            writeln!(writer, "  m{i} -> n{i};")?;
        }
        writeln!(writer, "}}")
    }
}

fn compile(raw: RawConfig, fingerprint: u64) -> Result<MappingSet, MappingError> {
    let base = Defaults::default();
    let defaults = Defaults {
        timer_type: raw.defaults.timer_type.unwrap_or(base.timer_type),
        buckets: raw.defaults.buckets.unwrap_or(base.buckets),
        quantiles: raw
            .defaults
            .quantiles
            .map(|objectives| objectives.iter().map(|o| o.quantile).collect())
            .unwrap_or(base.quantiles),
        ttl: raw.defaults.ttl.map_or(base.ttl, Duration::from_secs),
        match_type: raw.defaults.match_type.unwrap_or(base.match_type),
    };

    let mut mappings = Vec::with_capacity(raw.mappings.len());
    for mapping in raw.mappings {
        let match_type = mapping.match_type.unwrap_or(defaults.match_type);
        let pattern_str = match match_type {
            MatchType::Glob => translate_glob(&mapping.match_pattern),
            MatchType::Regex => mapping.match_pattern.clone(),
        };
        let pattern = Regex::new(&pattern_str).map_err(|source| MappingError::Pattern {
            pattern: mapping.match_pattern.clone(),
            source,
        })?;

        mappings.push(Arc::new(Mapping {
            pattern,
            raw_match: mapping.match_pattern,
            name_template: mapping.name,
            label_templates: mapping.labels.into_iter().collect(),
            action: mapping.action,
            timer_type: mapping.timer_type,
            buckets: mapping.buckets,
            quantiles: mapping
                .quantiles
                .map(|objectives| objectives.iter().map(|o| o.quantile).collect()),
            ttl: mapping.ttl.map_or(defaults.ttl, Duration::from_secs),
            help: mapping.help,
        }));
    }

    Ok(MappingSet { mappings, defaults, fingerprint })
}

fn scan(set: &MappingSet, name: &str) -> LookupResult {
    for mapping in &set.mappings {
        let Some(captures) = mapping.pattern.captures(name) else {
            continue;
        };

        let mut expanded_name = String::new();
        captures.expand(&mapping.name_template, &mut expanded_name);

        let mut labels = Labels::new();
        for (label, template) in &mapping.label_templates {
            let mut value = String::new();
            captures.expand(template, &mut value);
            labels.insert(label.clone(), value);
        }

        return LookupResult { mapping: Some(mapping.clone()), name: expanded_name, labels };
    }

    LookupResult { mapping: None, name: String::new(), labels: Labels::new() }
}

// Translates a StatsD glob into an anchored regex where each `*` matches one
// dot-separated component and captures it for `$n` expansion.
fn translate_glob(pattern: &str) -> String {
    let mut translated = String::with_capacity(pattern.len() + 16);
    translated.push('^');
    for c in pattern.chars() {
        if c == '*' {
            translated.push_str("([^.]*)");
        } else {
            let mut buf = [0u8; 4];
            translated.push_str(&regex::escape(c.encode_utf8(&mut buf)));
        }
    }
    translated.push('$');
    translated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn mapper(config: &str) -> MetricMapper {
        let telemetry = Arc::new(Telemetry::register(&Registry::new()).unwrap());
        let mapper = MetricMapper::new(100, telemetry);
        mapper.load_str(config).unwrap();
        mapper
    }

    #[test]
    fn test_glob_translation() {
        assert_eq!(translate_glob("a.*.c"), "^a\\.([^.]*)\\.c$");
        assert_eq!(translate_glob("plain"), "^plain$");
    }

    #[test]
    fn test_glob_match_and_expansion() {
        let mapper = mapper(
            r#"
mappings:
  - match: "test.dispatcher.*.*"
    name: "dispatcher_events_total"
    labels:
      processor: "$1"
      action: "$2"
"#,
        );

        let result = mapper.lookup("test.dispatcher.foo.succeeded", EventKind::Counter);
        assert!(result.mapping.is_some());
        assert_eq!(result.name, "dispatcher_events_total");
        assert_eq!(result.labels.get("processor").map(String::as_str), Some("foo"));
        assert_eq!(result.labels.get("action").map(String::as_str), Some("succeeded"));

        // A star never crosses a dot boundary.
        let result = mapper.lookup("test.dispatcher.foo.bar.succeeded", EventKind::Counter);
        assert!(result.mapping.is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let mapper = mapper(
            r#"
mappings:
  - match: "a.*"
    name: "first"
  - match: "a.b"
    name: "second"
"#,
        );

        let result = mapper.lookup("a.b", EventKind::Counter);
        assert_eq!(result.name, "first");
    }

    #[test]
    fn test_regex_match_type() {
        let mapper = mapper(
            r#"
mappings:
  - match: "^client\\.(.+)\\.latency$"
    match_type: regex
    name: "client_latency"
    labels:
      client: "$1"
"#,
        );

        let result = mapper.lookup("client.shiny.latency", EventKind::Timer);
        assert_eq!(result.name, "client_latency");
        assert_eq!(result.labels.get("client").map(String::as_str), Some("shiny"));
    }

    #[test]
    fn test_drop_action_and_overrides() {
        let mapper = mapper(
            r#"
defaults:
  ttl: 60
mappings:
  - match: "noisy.*"
    name: ""
    action: drop
  - match: "timed.*"
    name: "timed"
    timer_type: histogram
    buckets: [0.1, 1.0]
    ttl: 300
"#,
        );

        let dropped = mapper.lookup("noisy.thing", EventKind::Counter);
        assert_eq!(dropped.mapping.as_ref().unwrap().action, ActionType::Drop);

        let timed = mapper.lookup("timed.thing", EventKind::Timer);
        let mapping = timed.mapping.as_ref().unwrap();
        assert_eq!(mapping.timer_type, Some(TimerType::Histogram));
        assert_eq!(mapping.buckets.as_deref(), Some(&[0.1, 1.0][..]));
        assert_eq!(mapping.ttl, Duration::from_secs(300));

        // Mappings without their own ttl inherit the default.
        assert_eq!(dropped.mapping.as_ref().unwrap().ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_cache_counts_hits_and_misses() {
        let telemetry = Arc::new(Telemetry::register(&Registry::new()).unwrap());
        let mapper = MetricMapper::new(100, telemetry.clone());
        mapper.load_str("mappings: []").unwrap();

        mapper.lookup("nothing.matches", EventKind::Counter);
        mapper.lookup("nothing.matches", EventKind::Counter);
        assert_eq!(telemetry.cache.misses.get(), 1.0);
        assert_eq!(telemetry.cache.hits.get(), 1.0);
        assert_eq!(telemetry.cache.size.get(), 1.0);

        // The same name under a different kind is a separate entry.
        mapper.lookup("nothing.matches", EventKind::Timer);
        assert_eq!(telemetry.cache.misses.get(), 2.0);
    }

    #[test]
    fn test_reload_skips_unchanged_content() {
        let mapper = mapper("mappings: []");
        assert!(!mapper.load_str("mappings: []").unwrap());
        assert!(mapper.load_str("mappings:\n  - match: \"a.*\"\n    name: \"a\"").unwrap());
    }

    #[test]
    fn test_reload_clears_cache() {
        let telemetry = Arc::new(Telemetry::register(&Registry::new()).unwrap());
        let mapper = MetricMapper::new(100, telemetry.clone());
        mapper.load_str("mappings: []").unwrap();
        mapper.lookup("a.b", EventKind::Counter);
        assert_eq!(telemetry.cache.size.get(), 1.0);

        mapper.load_str("mappings:\n  - match: \"a.*\"\n    name: \"mapped\"").unwrap();
        assert_eq!(telemetry.cache.size.get(), 0.0);
        let result = mapper.lookup("a.b", EventKind::Counter);
        assert_eq!(result.name, "mapped");
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let telemetry = Arc::new(Telemetry::register(&Registry::new()).unwrap());
        let mapper = MetricMapper::new(100, telemetry);
        let err = mapper
            .load_str("mappings:\n  - match: \"([\"\n    match_type: regex\n    name: \"x\"")
            .unwrap_err();
        assert!(matches!(err, MappingError::Pattern { .. }));
    }

    #[test]
    fn test_dump_patterns() {
        let mapper = mapper(
            r#"
mappings:
  - match: "a.*"
    name: "a_total"
"#,
        );
        let mut out = Vec::new();
        mapper.dump_patterns(&mut out).unwrap();
        let dot = String::from_utf8(out).unwrap();
        assert!(dot.starts_with("digraph mappings {"));
        assert!(dot.contains("a.*"));
        assert!(dot.contains("a_total"));
    }
}
