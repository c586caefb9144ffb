//! The typed events produced by the line parser and consumed by the exporter.

use std::collections::BTreeMap;

/// Label name/value pairs attached to an event.
///
/// Kept sorted by name so that label-name lists and fingerprints are
/// independent of insertion order.
pub type Labels = BTreeMap<String, String>;

/// A single parsed StatsD observation.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A counter increment. The value is non-negative after sampling-rate
    /// scaling has been applied by the parser.
    Counter {
        /// Raw metric name from the wire.
        name: String,
        /// Amount to add to the series.
        value: f64,
        /// Inline DogStatsD labels.
        labels: Labels,
    },
    /// A gauge set or delta.
    Gauge {
        /// Raw metric name from the wire.
        name: String,
        /// Either the absolute value or the signed delta.
        value: f64,
        /// When true, `value` is added to the gauge instead of replacing it.
        relative: bool,
        /// Inline DogStatsD labels.
        labels: Labels,
    },
    /// A single timing observation, in milliseconds.
    Timer {
        /// Raw metric name from the wire.
        name: String,
        /// Duration in milliseconds.
        value_ms: f64,
        /// Inline DogStatsD labels.
        labels: Labels,
    },
}

/// A batch of events parsed from one packet or line.
pub type Events = Vec<Event>;

impl Event {
    /// The raw metric name the client sent.
    pub fn name(&self) -> &str {
        match self {
            Event::Counter { name, .. } => name,
            Event::Gauge { name, .. } => name,
            Event::Timer { name, .. } => name,
        }
    }

    /// The event's labels.
    pub fn labels(&self) -> &Labels {
        match self {
            Event::Counter { labels, .. } => labels,
            Event::Gauge { labels, .. } => labels,
            Event::Timer { labels, .. } => labels,
        }
    }

    /// The kind of the event, as used in mapper cache keys and the
    /// `event_stats` self-metric.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Counter { .. } => EventKind::Counter,
            Event::Gauge { .. } => EventKind::Gauge,
            Event::Timer { .. } => EventKind::Timer,
        }
    }
}

/// The three kinds of event the pipeline routes on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// Monotone counter increments (`|c`).
    Counter,
    /// Gauge sets and deltas (`|g`).
    Gauge,
    /// Timing observations (`|ms`, `|h`).
    Timer,
}

impl EventKind {
    /// The label value used for this kind in self-metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Counter => "counter",
            EventKind::Gauge => "gauge",
            EventKind::Timer => "timer",
        }
    }
}
