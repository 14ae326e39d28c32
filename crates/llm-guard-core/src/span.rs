//! Match primitive shared by every detector.
//!
//! All offsets are codepoint offsets into the scanned text. Regex engines
//! report byte offsets, so detectors go through [`CodepointMap`] before
//! constructing a [`Match`].

use std::cmp::Ordering;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::rules::RuleAction;

/// The closed set of detector kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Toxic language (hate, harassment, profanity, violence, self-harm).
    Toxicity,
    /// Personally identifiable information.
    Pii,
    /// Prompt injection and jailbreak attempts.
    Injection,
    /// User-registered pattern rules.
    CustomRule,
}

impl DetectorKind {
    /// Returns all detector kinds in evaluation order.
    pub fn all() -> &'static [DetectorKind] {
        &[
            DetectorKind::Toxicity,
            DetectorKind::Pii,
            DetectorKind::Injection,
            DetectorKind::CustomRule,
        ]
    }

    /// Returns the short name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            DetectorKind::Toxicity => "toxicity",
            DetectorKind::Pii => "pii",
            DetectorKind::Injection => "injection",
            DetectorKind::CustomRule => "custom_rule",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a match came from.
///
/// Rule matches carry the rule's action, priority and message so the
/// resolver can rank them without consulting the registry again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MatchSource {
    /// Produced by the toxicity detector.
    Toxicity,
    /// Produced by the PII detector.
    Pii,
    /// Produced by the injection detector.
    Injection,
    /// Produced by a custom rule.
    Rule {
        /// The rule's action.
        action: RuleAction,
        /// The rule's priority.
        priority: i32,
        /// The rule's message.
        message: String,
    },
}

impl MatchSource {
    /// Returns the detector kind behind this source.
    pub fn kind(&self) -> DetectorKind {
        match self {
            MatchSource::Toxicity => DetectorKind::Toxicity,
            MatchSource::Pii => DetectorKind::Pii,
            MatchSource::Injection => DetectorKind::Injection,
            MatchSource::Rule { .. } => DetectorKind::CustomRule,
        }
    }

    /// Returns the rule action, if this source is a rule.
    pub fn action(&self) -> Option<RuleAction> {
        match self {
            MatchSource::Rule { action, .. } => Some(*action),
            _ => None,
        }
    }

    /// Returns the rule priority, if this source is a rule.
    pub fn priority(&self) -> Option<i32> {
        match self {
            MatchSource::Rule { priority, .. } => Some(*priority),
            _ => None,
        }
    }

    /// Returns true if this source is a custom rule.
    pub fn is_rule(&self) -> bool {
        matches!(self, MatchSource::Rule { .. })
    }
}

/// A scored, labeled region of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// Start offset (codepoints, inclusive).
    pub start: usize,
    /// End offset (codepoints, exclusive).
    pub end: usize,
    /// Category label, e.g. `SSN`, `hate`, `INJECTION` or a rule name.
    pub label: String,
    /// Confidence score (0.0 to 1.0).
    pub confidence: f32,
    /// Detector (or rule) that produced the match.
    pub source: MatchSource,
}

impl Match {
    /// Creates a new match. Confidence is clamped to [0, 1].
    pub fn new(
        span: Range<usize>,
        label: impl Into<String>,
        confidence: f32,
        source: MatchSource,
    ) -> Self {
        Self {
            start: span.start,
            end: span.end,
            label: label.into(),
            confidence: clamp_unit(confidence),
            source,
        }
    }

    /// Returns the codepoint range of this match.
    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Returns the span length in codepoints.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns true if the span is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `0 <= start < end <= char_len`.
    pub fn fits(&self, char_len: usize) -> bool {
        self.start < self.end && self.end <= char_len
    }

    /// Returns true if the two spans share at least one codepoint.
    pub fn overlaps(&self, other: &Match) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Clamps a score into [0, 1], mapping NaN to 0.
pub(crate) fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Byte/codepoint offset translation for one text.
///
/// ASCII text needs no table; anything else stores the byte offset of every
/// codepoint plus a trailing `text.len()` sentinel.
#[derive(Debug)]
pub struct CodepointMap<'a> {
    text: &'a str,
    offsets: Option<Vec<usize>>,
}

impl<'a> CodepointMap<'a> {
    /// Builds the map for `text`.
    pub fn new(text: &'a str) -> Self {
        let offsets = if text.is_ascii() {
            None
        } else {
            let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
            offsets.push(text.len());
            Some(offsets)
        };
        Self { text, offsets }
    }

    /// Returns the text length in codepoints.
    pub fn char_len(&self) -> usize {
        match &self.offsets {
            None => self.text.len(),
            Some(offsets) => offsets.len() - 1,
        }
    }

    /// Converts a byte offset on a char boundary to a codepoint offset.
    ///
    /// Offsets inside a multi-byte character round up to the next boundary.
    pub fn char_at_byte(&self, byte: usize) -> usize {
        match &self.offsets {
            None => byte.min(self.text.len()),
            Some(offsets) => match offsets.binary_search(&byte) {
                Ok(i) => i,
                Err(i) => i.min(offsets.len() - 1),
            },
        }
    }

    /// Converts a codepoint offset to a byte offset, saturating at the end.
    pub fn byte_at_char(&self, ch: usize) -> usize {
        match &self.offsets {
            None => ch.min(self.text.len()),
            Some(offsets) => offsets[ch.min(offsets.len() - 1)],
        }
    }

    /// Converts a byte range (as reported by `regex`) to a codepoint range.
    pub fn char_range(&self, bytes: Range<usize>) -> Range<usize> {
        self.char_at_byte(bytes.start)..self.char_at_byte(bytes.end)
    }

    /// Returns the substring covered by a codepoint range.
    pub fn slice(&self, chars: Range<usize>) -> &'a str {
        &self.text[self.byte_at_char(chars.start)..self.byte_at_char(chars.end)]
    }
}

/// Reduces `matches` to a non-overlapping set.
///
/// When two spans overlap the longer one survives; ties go to the higher
/// confidence, then to the earlier start. The result is sorted by start.
pub fn select_non_overlapping(mut matches: Vec<Match>) -> Vec<Match> {
    matches.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.start.cmp(&b.start))
    });

    let mut kept: Vec<Match> = Vec::with_capacity(matches.len());
    for candidate in matches {
        if candidate.is_empty() {
            continue;
        }
        if !kept.iter().any(|k| k.overlaps(&candidate)) {
            kept.push(candidate);
        }
    }

    kept.sort_by_key(|m| m.start);
    kept
}
