//! The exporter's own health metrics.
//!
//! Every series is registered up front with its fixed label children, so the
//! ingest hot path only ever touches pre-resolved atomic handles.

use std::sync::Arc;

use crate::event::{EventKind, Labels};
use crate::registry::{Registry, RegistryError};
use crate::storage::{AtomicCounter, AtomicGauge};

/// Per-kind counters for handled events (`event_stats_total{kind}`).
pub struct EventStats {
    counter: Arc<AtomicCounter>,
    gauge: Arc<AtomicCounter>,
    timer: Arc<AtomicCounter>,
    /// Events discarded because their mapping action was `drop`.
    pub dropped: Arc<AtomicCounter>,
    /// Counter events rejected for carrying a negative value.
    pub illegal_negative_counter: Arc<AtomicCounter>,
}

impl EventStats {
    /// The handled-event counter for `kind`.
    pub fn handled(&self, kind: EventKind) -> &AtomicCounter {
        match kind {
            EventKind::Counter => &self.counter,
            EventKind::Gauge => &self.gauge,
            EventKind::Timer => &self.timer,
        }
    }
}

/// Per-kind counters for events rejected by the registry
/// (`conflicting_event_stats_total{kind}`).
pub struct ConflictingEventStats {
    counter: Arc<AtomicCounter>,
    gauge: Arc<AtomicCounter>,
    timer: Arc<AtomicCounter>,
}

impl ConflictingEventStats {
    /// The conflict counter for `kind`.
    pub fn for_kind(&self, kind: EventKind) -> &AtomicCounter {
        match kind {
            EventKind::Counter => &self.counter,
            EventKind::Gauge => &self.gauge,
            EventKind::Timer => &self.timer,
        }
    }
}

/// Per-reason counters for rejected samples (`sample_errors_total{reason}`).
pub struct SampleErrors {
    /// Line was empty, had no `:`, or was not valid UTF-8.
    pub malformed_line: Arc<AtomicCounter>,
    /// Sample had the wrong `|`-arity or an empty modifier.
    pub malformed_component: Arc<AtomicCounter>,
    /// Sample value failed float parsing.
    pub malformed_value: Arc<AtomicCounter>,
    /// `@` modifier on a type that does not allow one.
    pub illegal_sample_factor: Arc<AtomicCounter>,
    /// Unparseable sampling rate or unknown modifier.
    pub invalid_sample_factor: Arc<AtomicCounter>,
    /// Unsupported sample type (StatsD sets).
    pub illegal_event: Arc<AtomicCounter>,
}

/// Outcome counters for mapping-config loads (`config_loads_total{result}`).
pub struct ConfigLoads {
    /// Config parsed and applied.
    pub success: Arc<AtomicCounter>,
    /// Config failed to parse or compile; previous config kept.
    pub failure: Arc<AtomicCounter>,
    /// Config content unchanged; reload skipped.
    pub skipped: Arc<AtomicCounter>,
}

/// Mapping-cache bookkeeping.
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: Arc<AtomicCounter>,
    /// Lookups that had to consult the mapping patterns.
    pub misses: Arc<AtomicCounter>,
    /// Current number of cached entries.
    pub size: Arc<AtomicGauge>,
}

/// Kernel UDP socket-buffer gauges shipped from procfs.
pub struct UdpBufferStats {
    /// Bytes queued on IPv4 UDP sockets.
    pub queued_udp: Arc<AtomicGauge>,
    /// Bytes queued on IPv6 UDP sockets.
    pub queued_udp6: Arc<AtomicGauge>,
    /// Datagrams dropped on IPv4 UDP sockets.
    pub dropped_udp: Arc<AtomicCounter>,
    /// Datagrams dropped on IPv6 UDP sockets.
    pub dropped_udp6: Arc<AtomicCounter>,
}

/// Handles for every self-metric, shared across the pipeline.
pub struct Telemetry {
    /// Events pulled off the events channel.
    pub events: Arc<AtomicCounter>,
    /// Events whose name matched no mapping.
    pub events_unmapped: Arc<AtomicCounter>,
    /// Handled events by kind.
    pub event_stats: EventStats,
    /// Registry conflicts by kind.
    pub conflicting_events: ConflictingEventStats,
    /// Samples seen on ingest lines.
    pub samples_received: Arc<AtomicCounter>,
    /// Rejected samples by reason.
    pub sample_errors: SampleErrors,
    /// Lines seen across both listeners.
    pub lines_received: Arc<AtomicCounter>,
    /// DogStatsD tag sections processed.
    pub tags_received: Arc<AtomicCounter>,
    /// DogStatsD tags dropped as malformed.
    pub tag_errors: Arc<AtomicCounter>,
    /// Datagrams read from the UDP socket.
    pub udp_packets: Arc<AtomicCounter>,
    /// TCP ingest connections accepted.
    pub tcp_connections: Arc<AtomicCounter>,
    /// TCP reads failed with something other than EOF.
    pub tcp_errors: Arc<AtomicCounter>,
    /// TCP lines discarded for exceeding the length bound.
    pub tcp_line_too_long: Arc<AtomicCounter>,
    /// Mapping-config load outcomes.
    pub config_loads: ConfigLoads,
    /// Mapping-cache bookkeeping.
    pub cache: CacheStats,
    /// Kernel UDP buffer state.
    pub udp_buffers: UdpBufferStats,
}

const NAMESPACE: &str = "statsd_exporter";

impl Telemetry {
    /// Registers every self-metric with `registry` and returns the handles.
    pub fn register(registry: &Registry) -> Result<Telemetry, RegistryError> {
        let build_info = labeled_gauge(
            registry,
            "build_info",
            "version",
            env!("CARGO_PKG_VERSION"),
            "Build information for this statsd_exporter binary.",
        )?;
        build_info.set(1.0);

        Ok(Telemetry {
            events: counter(registry, "events_total", "The total number of StatsD events seen.")?,
            events_unmapped: counter(
                registry,
                "events_unmapped_total",
                "The total number of StatsD events no mapping was found for.",
            )?,
            event_stats: EventStats {
                counter: event_stat(registry, "counter")?,
                gauge: event_stat(registry, "gauge")?,
                timer: event_stat(registry, "timer")?,
                dropped: event_stat(registry, "dropped")?,
                illegal_negative_counter: event_stat(registry, "illegal_negative_counter")?,
            },
            conflicting_events: ConflictingEventStats {
                counter: conflicting_event_stat(registry, "counter")?,
                gauge: conflicting_event_stat(registry, "gauge")?,
                timer: conflicting_event_stat(registry, "timer")?,
            },
            samples_received: counter(
                registry,
                "samples_received_total",
                "The total number of StatsD samples received.",
            )?,
            sample_errors: SampleErrors {
                malformed_line: sample_error(registry, "malformed_line")?,
                malformed_component: sample_error(registry, "malformed_component")?,
                malformed_value: sample_error(registry, "malformed_value")?,
                illegal_sample_factor: sample_error(registry, "illegal_sample_factor")?,
                invalid_sample_factor: sample_error(registry, "invalid_sample_factor")?,
                illegal_event: sample_error(registry, "illegal_event")?,
            },
            lines_received: counter(
                registry,
                "lines_received_total",
                "The total number of StatsD lines received.",
            )?,
            tags_received: counter(
                registry,
                "tags_received_total",
                "The total number of DogStatsD tags processed.",
            )?,
            tag_errors: counter(
                registry,
                "tag_errors_total",
                "The number of DogStatsD tags that could not be parsed.",
            )?,
            udp_packets: counter(
                registry,
                "udp_packets_total",
                "The total number of StatsD packets received over UDP.",
            )?,
            tcp_connections: counter(
                registry,
                "tcp_connections_total",
                "The total number of TCP connections handled.",
            )?,
            tcp_errors: counter(
                registry,
                "tcp_errors_total",
                "The number of errors encountered reading from TCP.",
            )?,
            tcp_line_too_long: counter(
                registry,
                "tcp_line_too_long_total",
                "The number of lines discarded due to being too long.",
            )?,
            config_loads: ConfigLoads {
                success: config_load(registry, "success")?,
                failure: config_load(registry, "failure")?,
                skipped: config_load(registry, "skipped")?,
            },
            cache: CacheStats {
                hits: cache_request(registry, "hit")?,
                misses: cache_request(registry, "miss")?,
                size: gauge(
                    registry,
                    "cache_size",
                    "The current number of entries in the mapping cache.",
                )?,
            },
            udp_buffers: UdpBufferStats {
                queued_udp: udp_buffer_queued(registry, "udp")?,
                queued_udp6: udp_buffer_queued(registry, "udp6")?,
                dropped_udp: udp_buffer_dropped(registry, "udp")?,
                dropped_udp6: udp_buffer_dropped(registry, "udp6")?,
            },
        })
    }
}

fn qualified(name: &str) -> String {
    format!("{NAMESPACE}_{name}")
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<Arc<AtomicCounter>, RegistryError> {
    registry.get_counter(&qualified(name), &Labels::new(), help)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Arc<AtomicGauge>, RegistryError> {
    registry.get_gauge(&qualified(name), &Labels::new(), help)
}

fn labeled_counter(
    registry: &Registry,
    name: &str,
    label: &str,
    value: &str,
    help: &str,
) -> Result<Arc<AtomicCounter>, RegistryError> {
    let labels: Labels = [(label.to_string(), value.to_string())].into_iter().collect();
    registry.get_counter(&qualified(name), &labels, help)
}

fn labeled_gauge(
    registry: &Registry,
    name: &str,
    label: &str,
    value: &str,
    help: &str,
) -> Result<Arc<AtomicGauge>, RegistryError> {
    let labels: Labels = [(label.to_string(), value.to_string())].into_iter().collect();
    registry.get_gauge(&qualified(name), &labels, help)
}

fn event_stat(registry: &Registry, kind: &str) -> Result<Arc<AtomicCounter>, RegistryError> {
    labeled_counter(
        registry,
        "event_stats_total",
        "kind",
        kind,
        "The total number of StatsD events handled, by kind.",
    )
}

fn conflicting_event_stat(
    registry: &Registry,
    kind: &str,
) -> Result<Arc<AtomicCounter>, RegistryError> {
    labeled_counter(
        registry,
        "conflicting_event_stats_total",
        "kind",
        kind,
        "The total number of StatsD events discarded due to registration conflicts, by kind.",
    )
}

fn sample_error(registry: &Registry, reason: &str) -> Result<Arc<AtomicCounter>, RegistryError> {
    labeled_counter(
        registry,
        "sample_errors_total",
        "reason",
        reason,
        "The total number of rejected StatsD samples, by reason.",
    )
}

fn config_load(registry: &Registry, result: &str) -> Result<Arc<AtomicCounter>, RegistryError> {
    labeled_counter(
        registry,
        "config_loads_total",
        "result",
        result,
        "The number of mapping-config reloads, by outcome.",
    )
}

fn cache_request(registry: &Registry, result: &str) -> Result<Arc<AtomicCounter>, RegistryError> {
    labeled_counter(
        registry,
        "cache_requests_total",
        "result",
        result,
        "The counter of mapping cache hits and misses.",
    )
}

fn udp_buffer_queued(registry: &Registry, label: &str) -> Result<Arc<AtomicGauge>, RegistryError> {
    labeled_gauge(
        registry,
        "udp_buffer_queued",
        "label",
        label,
        "Bytes queued in kernel UDP socket buffers.",
    )
}

fn udp_buffer_dropped(
    registry: &Registry,
    label: &str,
) -> Result<Arc<AtomicCounter>, RegistryError> {
    labeled_counter(
        registry,
        "udp_buffer_dropped_total",
        "label",
        label,
        "Datagrams dropped at the kernel UDP socket buffer.",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_render() {
        let registry = Registry::new();
        let telemetry = Telemetry::register(&registry).unwrap();

        telemetry.events.inc();
        telemetry.event_stats.handled(EventKind::Counter).inc();
        telemetry.sample_errors.malformed_value.inc();

        let body = registry.render();
        assert!(body.contains("statsd_exporter_events_total 1\n"));
        assert!(body.contains("statsd_exporter_event_stats_total{kind=\"counter\"} 1\n"));
        assert!(body.contains("statsd_exporter_sample_errors_total{reason=\"malformed_value\"} 1\n"));
        assert!(body.contains("statsd_exporter_build_info{version=\""));
    }

    #[test]
    fn test_register_is_idempotent_per_registry() {
        let registry = Registry::new();
        Telemetry::register(&registry).unwrap();
        // A second registration resolves the same families and children.
        Telemetry::register(&registry).unwrap();
    }
}
