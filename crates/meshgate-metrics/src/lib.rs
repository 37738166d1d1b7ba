//! Metric definitions for the meshgate engine.
//!
//! Every metric the engine emits is declared here as a [`Metric`] constant so
//! names, units and label keys live in one place. The `metrics` facade is
//! re-exported; the host installs whatever recorder it wants.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshgate_metrics::{describe_metrics, metric_defs, UnitLabels};
//!
//! describe_metrics();
//!
//! let labels = UnitLabels::new(5).with_class("binary-switch");
//! metrics::counter!(metric_defs::TRANSACTIONS.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing.
    Counter,
    /// Goes up and down.
    Gauge,
    /// Distribution of samples.
    Histogram,
}

impl MetricKind {
    /// Lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration.
///
/// ```rust
/// use meshgate_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const RETRIES: Metric = Metric::counter("meshgate.example.retries")
///     .with_description("Retried exchanges")
///     .with_unit(Unit::Count)
///     .with_labels(&["unit"]);
///
/// assert_eq!(RETRIES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name, `meshgate.<area>.<what>`.
    pub name: &'static str,
    /// Metric kind.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// Unit of measurement.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Declare a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    /// Set the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Set the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Set the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Register the description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }
}

/// All metrics emitted by the engine.
pub mod metric_defs {
    use super::{Metric, Unit};

    /// Labels on unit-scoped metrics.
    pub const UNIT_LABELS: &[&str] = &["unit"];

    /// Labels on unit and class scoped metrics.
    pub const CLASS_LABELS: &[&str] = &["unit", "class"];

    // ========================================================================
    // Link
    // ========================================================================

    /// Valid records received from the coordinator.
    pub const FRAMES_RX: Metric = Metric::counter("meshgate.link.frames_rx")
        .with_description("Valid records received from the coordinator")
        .with_unit(Unit::Count);

    /// Records dropped as corrupt or undeliverable.
    pub const FRAMES_DROPPED: Metric = Metric::counter("meshgate.link.frames_dropped")
        .with_description("Inbound records dropped (corrupt, unknown unit or class)")
        .with_unit(Unit::Count);

    /// Completed or failed transactions.
    ///
    /// Labels: unit, class, result
    pub const TRANSACTIONS: Metric = Metric::counter("meshgate.link.transactions")
        .with_description("Transactions issued to the coordinator")
        .with_unit(Unit::Count)
        .with_labels(&["unit", "class", "result"]);

    /// Transactions that ran past their deadline.
    pub const TIMEOUTS: Metric = Metric::counter("meshgate.link.timeouts")
        .with_description("Transactions that timed out")
        .with_unit(Unit::Count)
        .with_labels(UNIT_LABELS);

    /// Time from first byte written to reply.
    pub const TRANSACTION_LATENCY: Metric = Metric::histogram("meshgate.link.transaction_latency_ms")
        .with_description("Transaction round-trip time")
        .with_unit(Unit::Milliseconds)
        .with_labels(CLASS_LABELS);

    /// Connection attempts after the first.
    pub const RECONNECTS: Metric = Metric::counter("meshgate.link.reconnects")
        .with_description("Reconnect attempts")
        .with_unit(Unit::Count);

    // ========================================================================
    // Units and fields
    // ========================================================================

    /// Field values that actually changed.
    pub const FIELD_UPDATES: Metric = Metric::counter("meshgate.fields.updates")
        .with_description("Field value or error-state changes surfaced to the host")
        .with_unit(Unit::Count)
        .with_labels(UNIT_LABELS);

    /// Units whose fields entered error state.
    pub const UNIT_ERRORS: Metric = Metric::counter("meshgate.units.errors")
        .with_description("Units marked in error after repeated failures")
        .with_unit(Unit::Count)
        .with_labels(UNIT_LABELS);

    /// Units in the directory by state.
    pub const UNITS: Metric = Metric::gauge("meshgate.units.count")
        .with_description("Units in the directory")
        .with_unit(Unit::Count)
        .with_labels(&["state"]);

    /// Completed reconciliations.
    pub const RECONCILIATIONS: Metric = Metric::counter("meshgate.config.reconciliations")
        .with_description("Configuration reconciliations")
        .with_unit(Unit::Count)
        .with_labels(&["changed"]);

    // ========================================================================
    // Wake-up queue
    // ========================================================================

    /// Commands waiting for a sleeping unit.
    pub const WAKEUP_QUEUE_DEPTH: Metric = Metric::gauge("meshgate.wakeup.queue_depth")
        .with_description("Commands queued for a sleeping unit")
        .with_unit(Unit::Count)
        .with_labels(UNIT_LABELS);

    /// Queued commands discarded by the overflow or retry policy.
    pub const WAKEUP_DROPPED: Metric = Metric::counter("meshgate.wakeup.dropped")
        .with_description("Queued commands dropped by overflow or retry limit")
        .with_unit(Unit::Count)
        .with_labels(&["unit", "reason"]);

    /// Every metric, for [`describe_metrics`](super::describe_metrics).
    pub const ALL: &[&Metric] = &[
        &FRAMES_RX,
        &FRAMES_DROPPED,
        &TRANSACTIONS,
        &TIMEOUTS,
        &TRANSACTION_LATENCY,
        &RECONNECTS,
        &FIELD_UPDATES,
        &UNIT_ERRORS,
        &UNITS,
        &RECONCILIATIONS,
        &WAKEUP_QUEUE_DEPTH,
        &WAKEUP_DROPPED,
    ];
}

/// Labels identifying a unit and optionally one of its command classes.
///
/// ```rust
/// use meshgate_metrics::UnitLabels;
///
/// let labels = UnitLabels::new(5).with_class("association");
/// assert_eq!(labels.to_labels().len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLabels {
    /// Unit network id.
    pub unit: u8,
    /// Command class name.
    pub class: Option<&'static str>,
}

impl UnitLabels {
    /// Labels for a unit.
    pub fn new(unit: u8) -> Self {
        Self { unit, class: None }
    }

    /// Add the class label.
    pub fn with_class(mut self, class: &'static str) -> Self {
        self.class = Some(class);
        self
    }

    /// Convert to `metrics` label pairs.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("unit", self.unit.to_string())];
        if let Some(class) = self.class {
            labels.push(("class", class.to_string()));
        }
        labels
    }

    /// Labels plus extra pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Register descriptions for every metric. Call once after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
