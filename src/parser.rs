//! Parses StatsD/DogStatsD wire lines into [`Event`]s.
//!
//! One UDP datagram may carry several newline-separated lines, and one line
//! may carry several `:`-separated samples (unless DogStatsD tags are
//! present, which switch the line to single-sample mode). Every malformed
//! construct is counted and skipped at the smallest possible granularity:
//! a bad sample never takes down its line, a bad tag never takes down its
//! sample.

use tracing::debug;

use crate::event::{Event, Events, Labels};
use crate::formatting::escape_metric_name;
use crate::telemetry::Telemetry;

/// Splits a datagram payload on newlines and parses each line.
///
/// Empty segments (such as the one after a trailing newline) are skipped
/// without being counted as lines.
pub fn packet_to_events(telemetry: &Telemetry, packet: &[u8]) -> Events {
    let mut events = Events::new();
    let mut offset = 0;
    while offset < packet.len() {
        let rest = &packet[offset..];
        let line = match memchr::memchr(b'\n', rest) {
            Some(pos) => {
                offset += pos + 1;
                &rest[..pos]
            }
            None => {
                offset = packet.len();
                rest
            }
        };
        if line.is_empty() {
            continue;
        }
        telemetry.lines_received.inc();
        match std::str::from_utf8(line) {
            Ok(line) => events.extend(line_to_events(telemetry, line)),
            Err(_) => {
                telemetry.sample_errors.malformed_line.inc();
                debug!("non-UTF-8 line from StatsD");
            }
        }
    }
    events
}

/// Parses one StatsD line into zero or more events.
pub fn line_to_events(telemetry: &Telemetry, line: &str) -> Events {
    let mut events = Events::new();

    let Some((metric, rest)) = line.split_once(':') else {
        telemetry.sample_errors.malformed_line.inc();
        debug!(line, "bad line from StatsD");
        return events;
    };
    if metric.is_empty() {
        telemetry.sample_errors.malformed_line.inc();
        debug!(line, "bad line from StatsD");
        return events;
    }

    // DogStatsD tags switch the line to single-sample mode; otherwise each
    // further `:` starts another sample.
    let samples: Vec<&str> =
        if rest.contains("|#") { vec![rest] } else { rest.split(':').collect() };

    'samples: for sample in samples {
        telemetry.samples_received.inc();
        let components: Vec<&str> = sample.split('|').collect();
        if components.len() < 2 || components.len() > 4 {
            telemetry.sample_errors.malformed_component.inc();
            debug!(line, "bad component on line");
            continue;
        }
        let (value_str, stat_type) = (components[0], components[1]);

        let relative = value_str.starts_with('+') || value_str.starts_with('-');
        let Ok(mut value) = value_str.parse::<f64>() else {
            telemetry.sample_errors.malformed_value.inc();
            debug!(line, value = value_str, "bad value on line");
            continue;
        };

        let mut multiply_events = 1usize;
        let mut labels = Labels::new();

        if components.len() >= 3 {
            if components[2..].iter().any(|component| component.is_empty()) {
                telemetry.sample_errors.malformed_component.inc();
                debug!(line, "empty component on line");
                continue 'samples;
            }

            for component in &components[2..] {
                match component.as_bytes().first() {
                    Some(b'@') => {
                        if stat_type != "c" && stat_type != "ms" {
                            telemetry.sample_errors.illegal_sample_factor.inc();
                            debug!(line, "sampling factor on non-counter, non-timer metric");
                            continue;
                        }
                        let mut rate = component[1..].parse::<f64>().unwrap_or_else(|_| {
                            telemetry.sample_errors.invalid_sample_factor.inc();
                            debug!(line, "invalid sampling factor");
                            0.0
                        });
                        if rate == 0.0 {
                            rate = 1.0;
                        }
                        if stat_type == "c" {
                            value /= rate;
                        } else {
                            // Reconstruct the client-side down-sampled
                            // distribution by replicating the observation.
                            multiply_events = (1.0 / rate) as usize;
                        }
                    }
                    Some(b'#') => {
                        labels = parse_dogstatsd_tags(telemetry, component);
                    }
                    _ => {
                        telemetry.sample_errors.invalid_sample_factor.inc();
                        debug!(line, "invalid sampling factor or tag section");
                    }
                }
            }
        }

        for _ in 0..multiply_events {
            match build_event(stat_type, metric, value, relative, &labels) {
                Some(event) => events.push(event),
                None => {
                    telemetry.sample_errors.illegal_event.inc();
                    debug!(line, stat_type, "could not build event");
                }
            }
        }
    }

    events
}

fn build_event(
    stat_type: &str,
    name: &str,
    value: f64,
    relative: bool,
    labels: &Labels,
) -> Option<Event> {
    match stat_type {
        "c" => Some(Event::Counter { name: name.to_string(), value, labels: labels.clone() }),
        "g" => Some(Event::Gauge {
            name: name.to_string(),
            value,
            relative,
            labels: labels.clone(),
        }),
        "ms" | "h" => {
            Some(Event::Timer { name: name.to_string(), value_ms: value, labels: labels.clone() })
        }
        // StatsD sets ("s") and unknown types are unsupported.
        _ => None,
    }
}

fn parse_dogstatsd_tags(telemetry: &Telemetry, component: &str) -> Labels {
    let mut labels = Labels::new();
    telemetry.tags_received.inc();
    // Each tag may repeat its own leading '#', so strip it per tag.
    for tag in component.split(',') {
        let tag = tag.strip_prefix('#').unwrap_or(tag);
        let Some((key, value)) = tag.split_once(':') else {
            telemetry.tag_errors.inc();
            debug!(tag, "malformed DogStatsD tag");
            continue;
        };
        if key.is_empty() || value.is_empty() {
            telemetry.tag_errors.inc();
            debug!(tag, "malformed or empty DogStatsD tag");
            continue;
        }
        labels.insert(escape_metric_name(key), value.to_string());
    }
    labels
}
