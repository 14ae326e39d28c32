//! Guard configuration.
//!
//! Every field has a default, so a partial JSON document (or `{}`) is a
//! valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detector::{DEFAULT_INJECTION_THRESHOLD, DEFAULT_TOXICITY_THRESHOLD};
use crate::error::{GuardError, Result};
pub use crate::redactor::RedactionPolicy;
use crate::resolver::ResolverPolicy;
pub use crate::resolver::TimeoutPolicy;
use crate::rules::RuleSpec;
use crate::span::clamp_unit;

/// Default per-detector timeout in milliseconds.
pub const DEFAULT_DETECTOR_TIMEOUT_MS: u64 = 15;

/// Options consumed when a guard is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Minimum toxicity score for a match.
    pub toxicity_threshold: f32,
    /// Minimum injection confidence for a match.
    pub injection_threshold: f32,
    /// Minimum PII confidence considered by the resolver.
    pub pii_floor: f32,
    /// Per-label floors, e.g. `{"EMAIL": 0.9}`.
    pub category_floors: BTreeMap<String, f32>,
    /// Detector confidence at or above which content is blocked.
    pub block_threshold: f32,
    /// Detector confidence at or above which content is flagged.
    pub flag_threshold: f32,
    /// Run the toxicity detector.
    pub toxicity_enabled: bool,
    /// Run the PII detector.
    pub pii_detection_enabled: bool,
    /// Run the injection detector.
    pub injection_enabled: bool,
    /// Time allowed for each detector, in milliseconds.
    pub per_detector_timeout_ms: u64,
    /// Always produce redacted text from `check`.
    pub redact_on_check: bool,
    /// Which matches `check` redacts.
    pub redaction_policy: RedactionPolicy,
    /// Replacement text per label, e.g. `{"SSN": "***"}`. Other labels
    /// become `[LABEL]`.
    pub redaction_labels: BTreeMap<String, String>,
    /// What a detector timeout means for the verdict.
    pub timeout_policy: TimeoutPolicy,
    /// Custom rules registered at construction.
    pub rules: Vec<RuleSpec>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            toxicity_threshold: DEFAULT_TOXICITY_THRESHOLD,
            injection_threshold: DEFAULT_INJECTION_THRESHOLD,
            pii_floor: 0.0,
            category_floors: BTreeMap::new(),
            block_threshold: 0.85,
            flag_threshold: 0.5,
            toxicity_enabled: true,
            pii_detection_enabled: true,
            injection_enabled: true,
            per_detector_timeout_ms: DEFAULT_DETECTOR_TIMEOUT_MS,
            redact_on_check: false,
            redaction_policy: RedactionPolicy::default(),
            redaction_labels: BTreeMap::new(),
            timeout_policy: TimeoutPolicy::default(),
            rules: Vec::new(),
        }
    }
}

impl GuardConfig {
    /// Parses a configuration from JSON and validates it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    /// Writes the configuration to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        Ok(())
    }

    /// Checks that thresholds are in range and consistent.
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("toxicity_threshold", self.toxicity_threshold),
            ("injection_threshold", self.injection_threshold),
            ("pii_floor", self.pii_floor),
            ("block_threshold", self.block_threshold),
            ("flag_threshold", self.flag_threshold),
        ];
        for (name, value) in thresholds
            .into_iter()
            .chain(self.category_floors.iter().map(|(k, v)| (k.as_str(), *v)))
        {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuardError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.flag_threshold > self.block_threshold {
            return Err(GuardError::Config(format!(
                "flag_threshold ({}) exceeds block_threshold ({})",
                self.flag_threshold, self.block_threshold
            )));
        }
        if self.per_detector_timeout_ms == 0 {
            return Err(GuardError::Config(
                "per_detector_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns a copy with every threshold clamped into [0, 1].
    pub(crate) fn clamped(mut self) -> Self {
        for value in [
            &mut self.toxicity_threshold,
            &mut self.injection_threshold,
            &mut self.pii_floor,
            &mut self.block_threshold,
            &mut self.flag_threshold,
        ] {
            *value = clamp_unit(*value);
        }
        for value in self.category_floors.values_mut() {
            *value = clamp_unit(*value);
        }
        self
    }

    /// Returns the per-detector timeout.
    pub fn per_detector_timeout(&self) -> Duration {
        Duration::from_millis(self.per_detector_timeout_ms)
    }

    /// Builds the resolver policy from these options.
    pub fn resolver_policy(&self) -> ResolverPolicy {
        ResolverPolicy {
            block_threshold: self.block_threshold,
            flag_threshold: self.flag_threshold,
            toxicity_floor: self.toxicity_threshold,
            injection_floor: self.injection_threshold,
            pii_floor: self.pii_floor,
            category_floors: self.category_floors.clone(),
            timeout_policy: self.timeout_policy,
        }
    }
}
