//! Detectors: scanners that turn text into [`Match`]es.
//!
//! Every detector is pure with respect to its own configuration and honours
//! a [`ScanBudget`]. When the budget runs out mid-scan the detector returns
//! what it has found so far with `timed_out` set instead of failing.

mod custom;
mod injection;
mod pii;
mod toxicity;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use custom::CustomRuleDetector;
pub use injection::{
    InjectionAssessment, InjectionDetector, InjectionTechnique, DEFAULT_INJECTION_THRESHOLD,
    INJECTION_LABEL,
};
pub use pii::{luhn_valid, PiiCategory, PiiDetector, NAME_MIN_SCORE};
pub use toxicity::{ToxicityDetector, DEFAULT_TOXICITY_THRESHOLD};

use crate::span::{DetectorKind, Match};

/// Time and cancellation allowance for one detector invocation.
#[derive(Debug, Clone)]
pub struct ScanBudget {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl ScanBudget {
    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self {
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A budget that runs out `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_cancellation(timeout, Arc::new(AtomicBool::new(false)))
    }

    /// A budget that runs out `timeout` from now or when `cancelled` is set.
    pub fn with_cancellation(timeout: Duration, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            cancelled,
        }
    }

    /// Returns true if the caller cancelled the scan.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns true if the scan should stop now.
    pub fn is_exhausted(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for ScanBudget {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// What one detector found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOutcome {
    /// Matches found, sorted by start.
    pub matches: Vec<Match>,
    /// True if the budget ran out before the scan finished.
    pub timed_out: bool,
}

impl ScanOutcome {
    /// A finished scan.
    pub fn complete(matches: Vec<Match>) -> Self {
        Self {
            matches,
            timed_out: false,
        }
    }

    /// A scan cut short by its budget.
    pub fn partial(matches: Vec<Match>) -> Self {
        Self {
            matches,
            timed_out: true,
        }
    }
}

/// The closed set of detectors a guard can run.
///
/// Variants share their detector, so a `Detector` is cheap to clone into a
/// blocking task.
#[derive(Debug, Clone)]
pub enum Detector {
    /// Toxic language.
    Toxicity(Arc<ToxicityDetector>),
    /// Personally identifiable information.
    Pii(Arc<PiiDetector>),
    /// Prompt injection.
    Injection(Arc<InjectionDetector>),
    /// Custom pattern rules.
    Custom(Arc<CustomRuleDetector>),
}

impl Detector {
    /// Returns the kind of this detector.
    pub fn kind(&self) -> DetectorKind {
        match self {
            Detector::Toxicity(_) => DetectorKind::Toxicity,
            Detector::Pii(_) => DetectorKind::Pii,
            Detector::Injection(_) => DetectorKind::Injection,
            Detector::Custom(_) => DetectorKind::CustomRule,
        }
    }

    /// Scans `text` within `budget`.
    pub fn scan(&self, text: &str, budget: &ScanBudget) -> ScanOutcome {
        match self {
            Detector::Toxicity(d) => d.scan(text, budget),
            Detector::Pii(d) => d.scan(text, budget),
            Detector::Injection(d) => d.scan(text, budget),
            Detector::Custom(d) => d.scan(text, budget),
        }
    }
}
