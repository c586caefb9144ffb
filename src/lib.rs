//! Translates StatsD metric lines into Prometheus time series.
//!
//! Client applications push StatsD datagrams over UDP (or newline-delimited
//! lines over TCP); the exporter parses them into typed events, applies the
//! configured name/label mappings, aggregates them into counter, gauge,
//! summary and histogram families, and serves the result in the Prometheus
//! exposition format on an HTTP scrape endpoint.
//!
//! The pipeline is strictly one-way:
//!
//! ```text
//! wire bytes -> listener -> parser -> events channel -> exporter
//!     -> mapper lookup (cached) -> registry (counter|gauge|summary|histogram)
//!                                      ^
//!                             ttl sweeper (periodic)
//! ```
//!
//! Everything is best-effort: malformed input is counted and dropped, never
//! fatal. Series carrying a TTL are evicted once they go quiet.

pub mod event;
pub mod exporter;
pub mod formatting;
pub mod http;
pub mod listener;
pub mod mapper;
pub mod parser;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod udp_buffer;

pub use self::event::{Event, Events};
pub use self::exporter::Exporter;
pub use self::mapper::MetricMapper;
pub use self::registry::{Registry, RegistryError};
pub use self::telemetry::Telemetry;
