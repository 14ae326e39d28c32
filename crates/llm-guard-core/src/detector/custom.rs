//! Custom rule detector.
//!
//! Evaluates the registry snapshot in priority order. Every occurrence of an
//! enabled rule's pattern becomes a match labeled with the rule name at
//! confidence 1.0. Occurrences of one rule never overlap; different rules
//! may match the same span, which the resolver settles by priority.

use std::sync::Arc;

use super::{ScanBudget, ScanOutcome};
use crate::rules::RuleRegistry;
use crate::span::{CodepointMap, Match, MatchSource};

/// Detector backed by a [`RuleRegistry`].
#[derive(Debug, Clone)]
pub struct CustomRuleDetector {
    registry: Arc<RuleRegistry>,
}

impl CustomRuleDetector {
    /// Creates a detector reading from `registry`.
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry this detector reads from.
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// Scans `text` within `budget`.
    pub fn scan(&self, text: &str, budget: &ScanBudget) -> ScanOutcome {
        if text.is_empty() {
            return ScanOutcome::complete(Vec::new());
        }

        let rules = self.registry.snapshot();
        let map = CodepointMap::new(text);
        let mut matches = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            if budget.is_exhausted() {
                return ScanOutcome::partial(matches);
            }
            for m in rule.pattern.find_iter(text) {
                if m.is_empty() {
                    continue;
                }
                matches.push(Match::new(
                    map.char_range(m.range()),
                    rule.name.as_str(),
                    1.0,
                    MatchSource::Rule {
                        action: rule.action,
                        priority: rule.priority,
                        message: rule.message.clone(),
                    },
                ));
            }
        }

        ScanOutcome::complete(matches)
    }
}
