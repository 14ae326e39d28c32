//! Per-call events and their sinks.
//!
//! The guard emits one [`CheckEvent`] per evaluation through an
//! [`EventSink`]. Sinks are shared across concurrent calls and must
//! synchronize internally.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::resolver::{Action, Verdict};

/// Summary of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckEvent {
    /// Wall-clock time of the evaluation.
    pub elapsed_ms: f64,
    /// Action taken.
    pub action: Action,
    /// Labels of every trigger, in verdict order.
    pub triggered_labels: Vec<String>,
}

impl CheckEvent {
    /// Builds the event for a verdict.
    pub fn from_verdict(verdict: &Verdict) -> Self {
        Self {
            elapsed_ms: verdict.latency_ms,
            action: verdict.action,
            triggered_labels: verdict.triggered_by.iter().map(|t| t.label.clone()).collect(),
        }
    }
}

/// Destination for check events.
pub trait EventSink: Send + Sync {
    /// Records one event. Must not block for long.
    fn emit(&self, event: &CheckEvent);
}

/// Emits each event as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &CheckEvent) {
        tracing::info!(
            elapsed_ms = event.elapsed_ms,
            action = %event.action,
            triggered = ?event.triggered_labels,
            "Content check completed"
        );
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &CheckEvent) {}
}

/// Aggregated counters over many checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardMetrics {
    /// Checks recorded.
    pub total_checks: u64,
    /// Checks that ended in Block.
    pub blocked: u64,
    /// Checks that ended in Flag.
    pub flagged: u64,
    /// Sum of all check latencies.
    pub total_latency_ms: f64,
    /// Number of checks each label triggered in.
    pub label_counts: BTreeMap<String, u64>,
}

impl GuardMetrics {
    /// Fraction of checks that were blocked.
    pub fn block_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.blocked as f64 / self.total_checks as f64
        }
    }

    /// Mean latency per check.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.total_latency_ms / self.total_checks as f64
        }
    }

    fn record(&mut self, event: &CheckEvent) {
        self.total_checks += 1;
        self.total_latency_ms += event.elapsed_ms;
        match event.action {
            Action::Block => self.blocked += 1,
            Action::Flag => self.flagged += 1,
            Action::Allow => {}
        }
        let mut seen: Vec<&str> = Vec::with_capacity(event.triggered_labels.len());
        for label in &event.triggered_labels {
            if !seen.contains(&label.as_str()) {
                seen.push(label);
                *self.label_counts.entry(label.clone()).or_default() += 1;
            }
        }
    }
}

/// Keeps [`GuardMetrics`] in memory.
#[derive(Debug, Default)]
pub struct MetricsSink {
    metrics: Mutex<GuardMetrics>,
}

impl MetricsSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> GuardMetrics {
        self.metrics.lock().clone()
    }

    /// Clears all counters.
    pub fn reset(&self) {
        *self.metrics.lock() = GuardMetrics::default();
    }
}

impl EventSink for MetricsSink {
    fn emit(&self, event: &CheckEvent) {
        self.metrics.lock().record(event);
    }
}
