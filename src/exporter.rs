//! Routes parsed events into the registry and evicts idle series.
//!
//! The exporter is shared by all event-handler workers. Each event is run
//! through the mapper, translated to its Prometheus name and label set, and
//! applied to the matching family. Every successful observation refreshes a
//! label-set record; a periodic sweep drops series whose TTL has elapsed
//! since the last observation.

use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHasher;
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use tracing::{debug, warn};

use crate::event::{Event, Events, Labels};
use crate::formatting::escape_metric_name;
use crate::mapper::{ActionType, MetricMapper, TimerType};
use crate::registry::Registry;
use crate::telemetry::Telemetry;

const DEFAULT_HELP: &str = "Metric autogenerated by statsd_exporter.";

const RECORD_SHARDS: usize = 16;

struct LabelSetRecord {
    labels: Labels,
    last_registered_at: Instant,
    ttl: Duration,
}

// Sharded by fnv(name) so ingest workers refreshing different names do not
// serialize on one lock.
struct RecordStore {
    shards: Vec<Mutex<HashMap<String, HashMap<u64, LabelSetRecord>>>>,
}

impl RecordStore {
    fn new() -> RecordStore {
        RecordStore { shards: (0..RECORD_SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard(&self, name: &str) -> &Mutex<HashMap<String, HashMap<u64, LabelSetRecord>>> {
        let mut hasher = FnvHasher::default();
        hasher.write(name.as_bytes());
        &self.shards[(hasher.finish() % RECORD_SHARDS as u64) as usize]
    }

    fn save(&self, name: &str, labels: &Labels, ttl: Duration, now: Instant) {
        let mut shard = self.shard(name).lock();
        let by_fingerprint = shard.entry(name.to_string()).or_default();
        let record = by_fingerprint
            .entry(fingerprint(name, labels))
            .or_insert_with(|| LabelSetRecord { labels: labels.clone(), last_registered_at: now, ttl });
        record.last_registered_at = now;
        record.ttl = ttl;
    }

    fn take_expired(&self, now: Instant) -> Vec<(String, Labels)> {
        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|name, by_fingerprint| {
                by_fingerprint.retain(|_, record| {
                    if record.ttl.is_zero()
                        || now.duration_since(record.last_registered_at) < record.ttl
                    {
                        return true;
                    }
                    expired.push((name.clone(), record.labels.clone()));
                    false
                });
                !by_fingerprint.is_empty()
            });
        }
        expired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().values().map(HashMap::len).sum::<usize>()).sum()
    }
}

// One fnv hash over the name and the sorted label pairs. Built per call; a
// shared hasher would race across workers.
fn fingerprint(name: &str, labels: &Labels) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name.as_bytes());
    for (key, value) in labels {
        hasher.write(&[0xff]);
        hasher.write(key.as_bytes());
        hasher.write(&[0xfe]);
        hasher.write(value.as_bytes());
    }
    hasher.finish()
}

/// The event dispatcher and staleness sweeper.
pub struct Exporter {
    registry: Arc<Registry>,
    mapper: Arc<MetricMapper>,
    telemetry: Arc<Telemetry>,
    records: RecordStore,
    clock: Clock,
    conflicts_logged: Mutex<HashSet<String>>,
}

impl Exporter {
    /// Creates an exporter over the given registry and mapper.
    pub fn new(
        registry: Arc<Registry>,
        mapper: Arc<MetricMapper>,
        telemetry: Arc<Telemetry>,
    ) -> Exporter {
        Exporter::with_clock(registry, mapper, telemetry, Clock::new())
    }

    /// Like [`Exporter::new`] with an explicit time source, so tests can
    /// drive the TTL sweeper with a mock clock.
    pub fn with_clock(
        registry: Arc<Registry>,
        mapper: Arc<MetricMapper>,
        telemetry: Arc<Telemetry>,
        clock: Clock,
    ) -> Exporter {
        Exporter {
            registry,
            mapper,
            telemetry,
            records: RecordStore::new(),
            clock,
            conflicts_logged: Mutex::new(HashSet::new()),
        }
    }

    /// Applies a batch of events in order.
    pub fn handle_events(&self, events: Events) {
        for event in events {
            self.handle_event(event);
        }
    }

    /// Applies one event according to the configured mapping.
    pub fn handle_event(&self, event: Event) {
        self.telemetry.events.inc();

        let kind = event.kind();
        let lookup = self.mapper.lookup(event.name(), kind);
        let mappings = self.mapper.snapshot();
        let defaults = mappings.defaults();

        if let Some(mapping) = &lookup.mapping {
            if mapping.action == ActionType::Drop {
                self.telemetry.event_stats.dropped.inc();
                return;
            }
        }

        let (name, labels, ttl) = match &lookup.mapping {
            Some(mapping) => {
                let mut labels = event.labels().clone();
                for (key, value) in &lookup.labels {
                    labels.insert(key.clone(), value.clone());
                }
                (escape_metric_name(&lookup.name), labels, mapping.ttl)
            }
            None => {
                self.telemetry.events_unmapped.inc();
                (escape_metric_name(event.name()), event.labels().clone(), defaults.ttl)
            }
        };
        let help = lookup
            .mapping
            .as_ref()
            .and_then(|mapping| mapping.help.as_deref())
            .unwrap_or(DEFAULT_HELP);

        let outcome = match &event {
            Event::Counter { value, .. } => {
                if *value < 0.0 {
                    debug!(metric = %name, value, "counter must be non-negative");
                    self.telemetry.event_stats.illegal_negative_counter.inc();
                    return;
                }
                self.registry.get_counter(&name, &labels, help).map(|counter| counter.add(*value))
            }
            Event::Gauge { value, relative, .. } => {
                self.registry.get_gauge(&name, &labels, help).map(|gauge| {
                    if *relative {
                        gauge.add(*value);
                    } else {
                        gauge.set(*value);
                    }
                })
            }
            Event::Timer { value_ms, .. } => {
                // StatsD reports milliseconds, Prometheus expects seconds.
                let seconds = value_ms / 1000.0;
                let timer_type = lookup
                    .mapping
                    .as_ref()
                    .and_then(|mapping| mapping.timer_type)
                    .unwrap_or(defaults.timer_type);
                match timer_type {
                    TimerType::Histogram => {
                        let buckets = lookup
                            .mapping
                            .as_ref()
                            .and_then(|mapping| mapping.buckets.as_deref())
                            .unwrap_or(&defaults.buckets);
                        self.registry
                            .get_histogram(&name, &labels, help, buckets)
                            .map(|histogram| histogram.observe(seconds))
                    }
                    TimerType::Summary => {
                        let quantiles = lookup
                            .mapping
                            .as_ref()
                            .and_then(|mapping| mapping.quantiles.as_deref())
                            .unwrap_or(&defaults.quantiles);
                        self.registry
                            .get_summary(&name, &labels, help, quantiles)
                            .map(|summary| summary.observe(seconds))
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.save_label_values(&name, &labels, ttl);
                self.telemetry.event_stats.handled(kind).inc();
            }
            Err(error) => {
                if self.conflicts_logged.lock().insert(name.clone()) {
                    warn!(
                        metric = %name,
                        %error,
                        "inconsistent with an earlier registration; dropping event. \
                         A mapping change may require a restart"
                    );
                }
                self.telemetry.conflicting_events.for_kind(kind).inc();
            }
        }
    }

    fn save_label_values(&self, name: &str, labels: &Labels, ttl: Duration) {
        self.records.save(name, labels, ttl, self.clock.now());
    }

    /// Removes every series whose TTL has elapsed since its last
    /// observation. Called once per sweeper tick.
    pub fn remove_stale_metrics(&self) {
        let now = self.clock.now();
        for (name, labels) in self.records.take_expired(now) {
            debug!(metric = %name, "removing stale series");
            self.registry.delete(&name, &labels);
        }
    }

    /// Drains the events channel until every sender is gone.
    pub async fn run_worker(self: Arc<Self>, events: flume::Receiver<Events>) {
        while let Ok(batch) = events.recv_async().await {
            self.handle_events(batch);
        }
        debug!("events channel closed, worker exiting");
    }

    /// Runs the staleness sweep on a steady one-second cadence.
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.remove_stale_metrics();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn setup(config: &str) -> (Arc<Registry>, Arc<Telemetry>, Exporter, Arc<quanta::Mock>) {
        let registry = Arc::new(Registry::new());
        let telemetry = Arc::new(Telemetry::register(&registry).unwrap());
        let mapper = Arc::new(MetricMapper::new(1000, telemetry.clone()));
        mapper.load_str(config).unwrap();
        let (clock, mock) = Clock::mock();
        let exporter = Exporter::with_clock(registry.clone(), mapper, telemetry.clone(), clock);
        (registry, telemetry, exporter, mock)
    }

    fn counter_event(name: &str, value: f64) -> Event {
        Event::Counter { name: name.into(), value, labels: Labels::new() }
    }

    #[test]
    fn test_counter_sums() {
        let (registry, telemetry, exporter, _) = setup("mappings: []");
        exporter.handle_event(counter_event("foo", 2.0));
        exporter.handle_event(counter_event("foo", 3.0));

        assert!(registry.render().contains("\nfoo 5\n"));
        assert_eq!(telemetry.event_stats.handled(EventKind::Counter).get(), 2.0);
        assert_eq!(telemetry.events.get(), 2.0);
        assert_eq!(telemetry.events_unmapped.get(), 2.0);
    }

    #[test]
    fn test_gauge_set_then_add() {
        let (registry, _, exporter, _) = setup("mappings: []");
        exporter.handle_event(Event::Gauge {
            name: "bar".into(),
            value: 3.0,
            relative: false,
            labels: Labels::new(),
        });
        exporter.handle_event(Event::Gauge {
            name: "bar".into(),
            value: 1.0,
            relative: true,
            labels: Labels::new(),
        });

        assert!(registry.render().contains("\nbar 4\n"));
    }

    #[test]
    fn test_timer_defaults_to_summary_in_seconds() {
        let (registry, _, exporter, _) = setup("mappings: []");
        exporter.handle_event(Event::Timer {
            name: "t".into(),
            value_ms: 200.0,
            labels: Labels::new(),
        });

        let body = registry.render();
        assert!(body.contains("t_sum 0.2\n"));
        assert!(body.contains("t_count 1\n"));
    }

    #[test]
    fn test_timer_histogram_mapping() {
        let config = r#"
mappings:
  - match: "timed.*"
    name: "timed_seconds"
    timer_type: histogram
    buckets: [0.1, 1.0]
"#;
        let (registry, _, exporter, _) = setup(config);
        exporter.handle_event(Event::Timer {
            name: "timed.thing".into(),
            value_ms: 50.0,
            labels: Labels::new(),
        });

        let body = registry.render();
        assert!(body.contains("timed_seconds_bucket{le=\"0.1\"} 1\n"));
        assert!(body.contains("timed_seconds_count 1\n"));
    }

    #[test]
    fn test_negative_counter_is_rejected() {
        let (registry, telemetry, exporter, _) = setup("mappings: []");
        exporter.handle_event(counter_event("neg", -5.0));

        assert!(!registry.render().contains("\nneg "));
        assert_eq!(telemetry.event_stats.illegal_negative_counter.get(), 1.0);
        assert_eq!(exporter.records.len(), 0);
    }

    #[test]
    fn test_mapping_renames_and_merges_labels() {
        let config = r#"
mappings:
  - match: "test.dispatcher.*"
    name: "dispatcher_events_total"
    labels:
      action: "$1"
"#;
        let (registry, telemetry, exporter, _) = setup(config);
        let labels: Labels = [("region".to_string(), "us".to_string())].into_iter().collect();
        exporter.handle_event(Event::Counter {
            name: "test.dispatcher.succeeded".into(),
            value: 1.0,
            labels,
        });

        let body = registry.render();
        assert!(body.contains("dispatcher_events_total{action=\"succeeded\",region=\"us\"} 1\n"));
        assert_eq!(telemetry.events_unmapped.get(), 0.0);
    }

    #[test]
    fn test_unmapped_name_is_escaped() {
        let (registry, _, exporter, _) = setup("mappings: []");
        exporter.handle_event(counter_event("9x.y", 1.0));
        assert!(registry.render().contains("\n_9x_y 1\n"));
    }

    #[test]
    fn test_drop_action_is_counted() {
        let config = r#"
mappings:
  - match: "noisy.*"
    name: ""
    action: drop
"#;
        let (registry, telemetry, exporter, _) = setup(config);
        exporter.handle_event(counter_event("noisy.thing", 1.0));

        assert_eq!(telemetry.event_stats.dropped.get(), 1.0);
        assert!(!registry.render().contains("noisy"));
    }

    #[test]
    fn test_conflicting_registration_drops_event() {
        let (registry, telemetry, exporter, _) = setup("mappings: []");
        exporter.handle_event(counter_event("shared", 1.0));
        exporter.handle_event(Event::Gauge {
            name: "shared".into(),
            value: 2.0,
            relative: false,
            labels: Labels::new(),
        });

        assert_eq!(telemetry.conflicting_events.for_kind(EventKind::Gauge).get(), 1.0);
        assert!(registry.render().contains("\nshared 1\n"));
    }

    #[test]
    fn test_ttl_eviction() {
        let config = r#"
mappings:
  - match: "short.*"
    name: "short_lived"
    ttl: 1
"#;
        let (registry, _, exporter, mock) = setup(config);
        exporter.handle_event(counter_event("short.a", 1.0));
        assert!(registry.render().contains("short_lived 1\n"));

        mock.increment(Duration::from_secs(2));
        exporter.remove_stale_metrics();

        assert!(!registry.render().contains("short_lived 1\n"));
        assert_eq!(exporter.records.len(), 0);
    }

    #[test]
    fn test_observation_refreshes_ttl() {
        let config = r#"
mappings:
  - match: "short.*"
    name: "short_lived"
    ttl: 1
"#;
        let (registry, _, exporter, mock) = setup(config);
        exporter.handle_event(counter_event("short.a", 1.0));

        mock.increment(Duration::from_millis(600));
        exporter.handle_event(counter_event("short.a", 1.0));
        mock.increment(Duration::from_millis(600));
        exporter.remove_stale_metrics();

        assert!(registry.render().contains("short_lived 2\n"));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let (registry, _, exporter, mock) = setup("mappings: []");
        exporter.handle_event(counter_event("forever", 1.0));

        mock.increment(Duration::from_secs(3600));
        exporter.remove_stale_metrics();

        assert!(registry.render().contains("\nforever 1\n"));
    }

    #[test]
    fn test_fingerprint_distinguishes_label_sets() {
        let a: Labels = [("x".to_string(), "1".to_string())].into_iter().collect();
        let b: Labels = [("x".to_string(), "2".to_string())].into_iter().collect();
        assert_ne!(fingerprint("m", &a), fingerprint("m", &b));
        assert_eq!(fingerprint("m", &a), fingerprint("m", &a.clone()));
    }
}
