//! The typed registry of exported metric families.
//!
//! Each of the four Prometheus families (counter, gauge, summary, histogram)
//! has a table keyed by metric name. A name is bound to exactly one family
//! and one sorted list of label names for the life of the process; an event
//! that would re-register a name with a different family or label set gets a
//! [`RegistryError`] back, which the dispatcher counts as a conflict and
//! drops.
//!
//! Within a family, each distinct label-value tuple is one child time
//! series. Children are created on first observation and removed by the TTL
//! sweeper through [`Registry::delete`].

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use thiserror::Error;

use crate::event::Labels;
use crate::formatting::{write_help_line, write_metric_line, write_type_line};
use crate::storage::{AtomicCounter, AtomicGauge, HistogramHandle, SummaryHandle};

/// Conflicts detected while resolving a series.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The name is already bound to a different metric family.
    #[error("metric {name:?} is already registered as a {existing} metric")]
    KindMismatch {
        /// The conflicting metric name.
        name: String,
        /// The family the name was first registered with.
        existing: &'static str,
    },

    /// The name was first registered with a different set of label names.
    #[error("metric {name:?} is registered with label names {expected:?}, event has {got:?}")]
    LabelNamesMismatch {
        /// The conflicting metric name.
        name: String,
        /// Label names fixed at first registration.
        expected: Vec<String>,
        /// Label names carried by the rejected event.
        got: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FamilyKind {
    Counter,
    Gauge,
    Summary,
    Histogram,
}

impl FamilyKind {
    fn as_str(self) -> &'static str {
        match self {
            FamilyKind::Counter => "counter",
            FamilyKind::Gauge => "gauge",
            FamilyKind::Summary => "summary",
            FamilyKind::Histogram => "histogram",
        }
    }
}

/// One metric family: its help text, the label names fixed at first
/// registration, and one child per label-value tuple.
struct Family<H> {
    help: String,
    label_names: Vec<String>,
    make_child: Box<dyn Fn() -> H + Send + Sync>,
    children: RwLock<IndexMap<Vec<String>, Arc<H>>>,
}

impl<H> Family<H> {
    fn new(
        help: &str,
        labels: &Labels,
        make_child: Box<dyn Fn() -> H + Send + Sync>,
    ) -> Family<H> {
        Family {
            help: help.to_string(),
            label_names: labels.keys().cloned().collect(),
            make_child,
            children: RwLock::new(IndexMap::new()),
        }
    }

    fn label_values(&self, name: &str, labels: &Labels) -> Result<Vec<String>, RegistryError> {
        if !labels.keys().eq(self.label_names.iter()) {
            return Err(RegistryError::LabelNamesMismatch {
                name: name.to_string(),
                expected: self.label_names.clone(),
                got: labels.keys().cloned().collect(),
            });
        }
        Ok(labels.values().cloned().collect())
    }

    fn get_or_create(&self, name: &str, labels: &Labels) -> Result<Arc<H>, RegistryError> {
        let values = self.label_values(name, labels)?;
        if let Some(child) = self.children.read().get(&values) {
            return Ok(child.clone());
        }
        let mut children = self.children.write();
        let child = children.entry(values).or_insert_with(|| Arc::new((self.make_child)()));
        Ok(child.clone())
    }

    fn delete(&self, labels: &Labels) -> bool {
        if !labels.keys().eq(self.label_names.iter()) {
            return false;
        }
        let values: Vec<String> = labels.values().cloned().collect();
        self.children.write().shift_remove(&values).is_some()
    }

    fn snapshot(&self) -> Vec<(Vec<String>, Arc<H>)> {
        self.children.read().iter().map(|(values, child)| (values.clone(), child.clone())).collect()
    }
}

type FamilyTable<H> = RwLock<HashMap<String, Arc<Family<H>>>>;

/// The registry of all exported series, shared by ingest workers, the
/// sweeper, and the scrape endpoint.
#[derive(Default)]
pub struct Registry {
    names: RwLock<HashMap<String, FamilyKind>>,
    counters: FamilyTable<AtomicCounter>,
    gauges: FamilyTable<AtomicGauge>,
    summaries: FamilyTable<SummaryHandle>,
    histograms: FamilyTable<HistogramHandle>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    fn get_in<H>(
        &self,
        table: &FamilyTable<H>,
        kind: FamilyKind,
        name: &str,
        labels: &Labels,
        help: &str,
        make_child: impl FnOnce() -> Box<dyn Fn() -> H + Send + Sync>,
    ) -> Result<Arc<H>, RegistryError> {
        let family = table.read().get(name).cloned();
        let family = match family {
            Some(family) => family,
            None => {
                self.claim_name(name, kind)?;
                let mut families = table.write();
                families
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Family::new(help, labels, make_child())))
                    .clone()
            }
        };
        family.get_or_create(name, labels)
    }

    // Binds `name` to `kind`, or reports which family already owns it.
    fn claim_name(&self, name: &str, kind: FamilyKind) -> Result<(), RegistryError> {
        let mut names = self.names.write();
        match names.get(name) {
            Some(existing) if *existing != kind => Err(RegistryError::KindMismatch {
                name: name.to_string(),
                existing: existing.as_str(),
            }),
            _ => {
                names.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Resolves (or creates) a counter series.
    pub fn get_counter(
        &self,
        name: &str,
        labels: &Labels,
        help: &str,
    ) -> Result<Arc<AtomicCounter>, RegistryError> {
        self.get_in(&self.counters, FamilyKind::Counter, name, labels, help, || {
            Box::new(AtomicCounter::default)
        })
    }

    /// Resolves (or creates) a gauge series.
    pub fn get_gauge(
        &self,
        name: &str,
        labels: &Labels,
        help: &str,
    ) -> Result<Arc<AtomicGauge>, RegistryError> {
        self.get_in(&self.gauges, FamilyKind::Gauge, name, labels, help, || {
            Box::new(AtomicGauge::default)
        })
    }

    /// Resolves (or creates) a summary series. The quantile list is fixed
    /// when the family is first registered.
    pub fn get_summary(
        &self,
        name: &str,
        labels: &Labels,
        help: &str,
        quantiles: &[f64],
    ) -> Result<Arc<SummaryHandle>, RegistryError> {
        self.get_in(&self.summaries, FamilyKind::Summary, name, labels, help, || {
            let quantiles = Arc::new(quantiles.to_vec());
            Box::new(move || SummaryHandle::new(quantiles.clone()))
        })
    }

    /// Resolves (or creates) a histogram series. The bucket bounds are fixed
    /// when the family is first registered.
    pub fn get_histogram(
        &self,
        name: &str,
        labels: &Labels,
        help: &str,
        buckets: &[f64],
    ) -> Result<Arc<HistogramHandle>, RegistryError> {
        self.get_in(&self.histograms, FamilyKind::Histogram, name, labels, help, || {
            let buckets = buckets.to_vec();
            Box::new(move || HistogramHandle::new(&buckets))
        })
    }

    /// Removes the series for `(name, labels)` from whichever family holds
    /// it. The family registration itself stays; only the child is dropped.
    pub fn delete(&self, name: &str, labels: &Labels) {
        if let Some(family) = self.counters.read().get(name) {
            family.delete(labels);
        }
        if let Some(family) = self.gauges.read().get(name) {
            family.delete(labels);
        }
        if let Some(family) = self.summaries.read().get(name) {
            family.delete(labels);
        }
        if let Some(family) = self.histograms.read().get(name) {
            family.delete(labels);
        }
    }

    /// Renders all families in the Prometheus text exposition format.
    ///
    /// Families are emitted in name order; children in creation order.
    pub fn render(&self) -> String {
        let mut output = String::new();

        for (name, family) in sorted_families(&self.counters) {
            write_help_line(&mut output, &name, &family.help);
            write_type_line(&mut output, &name, "counter");
            for (values, child) in family.snapshot() {
                write_metric_line(
                    &mut output,
                    &name,
                    None,
                    &family.label_names,
                    &values,
                    None,
                    child.get(),
                );
            }
            output.push('\n');
        }

        for (name, family) in sorted_families(&self.gauges) {
            write_help_line(&mut output, &name, &family.help);
            write_type_line(&mut output, &name, "gauge");
            for (values, child) in family.snapshot() {
                write_metric_line(
                    &mut output,
                    &name,
                    None,
                    &family.label_names,
                    &values,
                    None,
                    child.get(),
                );
            }
            output.push('\n');
        }

        for (name, family) in sorted_families(&self.summaries) {
            write_help_line(&mut output, &name, &family.help);
            write_type_line(&mut output, &name, "summary");
            for (values, child) in family.snapshot() {
                for q in child.quantiles() {
                    let estimate = child.quantile(*q).unwrap_or(0.0);
                    write_metric_line(
                        &mut output,
                        &name,
                        None,
                        &family.label_names,
                        &values,
                        Some(("quantile", &q.to_string())),
                        estimate,
                    );
                }
                write_metric_line(
                    &mut output,
                    &name,
                    Some("sum"),
                    &family.label_names,
                    &values,
                    None,
                    child.sum(),
                );
                write_metric_line(
                    &mut output,
                    &name,
                    Some("count"),
                    &family.label_names,
                    &values,
                    None,
                    child.count(),
                );
            }
            output.push('\n');
        }

        for (name, family) in sorted_families(&self.histograms) {
            write_help_line(&mut output, &name, &family.help);
            write_type_line(&mut output, &name, "histogram");
            for (values, child) in family.snapshot() {
                let snapshot = child.snapshot();
                for (le, count) in &snapshot.buckets {
                    write_metric_line(
                        &mut output,
                        &name,
                        Some("bucket"),
                        &family.label_names,
                        &values,
                        Some(("le", &le.to_string())),
                        *count,
                    );
                }
                write_metric_line(
                    &mut output,
                    &name,
                    Some("bucket"),
                    &family.label_names,
                    &values,
                    Some(("le", "+Inf")),
                    snapshot.count,
                );
                write_metric_line(
                    &mut output,
                    &name,
                    Some("sum"),
                    &family.label_names,
                    &values,
                    None,
                    snapshot.sum,
                );
                write_metric_line(
                    &mut output,
                    &name,
                    Some("count"),
                    &family.label_names,
                    &values,
                    None,
                    snapshot.count,
                );
            }
            output.push('\n');
        }

        output
    }
}

fn sorted_families<H>(table: &FamilyTable<H>) -> Vec<(String, Arc<Family<H>>)> {
    let mut families: Vec<_> =
        table.read().iter().map(|(name, family)| (name.clone(), family.clone())).collect();
    families.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    families
}
