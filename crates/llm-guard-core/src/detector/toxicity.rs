//! Toxicity detector.
//!
//! Wraps a [`ToxicityScorer`]: it applies the category threshold and turns
//! the surviving scores into matches. It owns no model internals.

use std::sync::Arc;

use super::{ScanBudget, ScanOutcome};
use crate::scoring::{LexiconScorer, ToxicityScorer};
use crate::span::{clamp_unit, select_non_overlapping, CodepointMap, Match, MatchSource};

/// Default minimum score for a toxicity match.
pub const DEFAULT_TOXICITY_THRESHOLD: f32 = 0.7;

/// Detector for toxic language.
pub struct ToxicityDetector {
    scorer: Arc<dyn ToxicityScorer>,
    threshold: f32,
}

impl std::fmt::Debug for ToxicityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToxicityDetector")
            .field("scorer", &self.scorer.name())
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl ToxicityDetector {
    /// Creates a detector around `scorer`.
    pub fn new(scorer: Arc<dyn ToxicityScorer>, threshold: f32) -> Self {
        Self {
            scorer,
            threshold: clamp_unit(threshold),
        }
    }

    /// Creates a detector with the built-in lexicon scorer.
    pub fn with_defaults() -> Self {
        Self::new(Arc::new(LexiconScorer::new()), DEFAULT_TOXICITY_THRESHOLD)
    }

    /// Returns the category threshold.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Scans `text` within `budget`.
    ///
    /// The budget is passed on to the scorer. If it ran out by the time the
    /// scorer returns, the scores are kept but the outcome is partial.
    pub fn scan(&self, text: &str, budget: &ScanBudget) -> ScanOutcome {
        if text.is_empty() {
            return ScanOutcome::complete(Vec::new());
        }
        if budget.is_exhausted() {
            return ScanOutcome::partial(Vec::new());
        }

        let char_len = CodepointMap::new(text).char_len();
        let matches: Vec<Match> = self
            .scorer
            .score_within(text, budget)
            .into_iter()
            .filter(|s| s.confidence >= self.threshold)
            .map(|s| {
                Match::new(
                    s.span.unwrap_or(0..char_len),
                    s.category.label(),
                    s.confidence,
                    MatchSource::Toxicity,
                )
            })
            .filter(|m| m.fits(char_len))
            .collect();

        let matches = select_non_overlapping(matches);
        if budget.is_exhausted() {
            return ScanOutcome::partial(matches);
        }
        ScanOutcome::complete(matches)
    }
}

impl Default for ToxicityDetector {
    fn default() -> Self {
        Self::with_defaults()
    }
}
