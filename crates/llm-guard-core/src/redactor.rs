//! Text redaction.
//!
//! Replaces matched spans with `[LABEL]` placeholders, or with a caller
//! supplied replacement per label. Offsets are codepoint offsets, so a
//! substitution never splits a multi-byte character, and overlapping matches
//! are reduced to one span before rewriting.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::rules::RuleAction;
use crate::span::{select_non_overlapping, CodepointMap, Match, MatchSource};

/// Which matches get redacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedactionPolicy {
    /// PII matches and matches of Redact rules.
    #[default]
    PiiAndRules,
    /// Only matches of Redact rules.
    RulesOnly,
}

impl RedactionPolicy {
    /// Returns true if `m` should be redacted under this policy.
    pub fn selects(&self, m: &Match) -> bool {
        match (&m.source, self) {
            (MatchSource::Rule { action, .. }, _) => *action == RuleAction::Redact,
            (MatchSource::Pii, RedactionPolicy::PiiAndRules) => true,
            _ => false,
        }
    }
}

/// One substitution made by the redactor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    /// Label written into the placeholder.
    pub label: String,
    /// Codepoint range in the original text.
    pub original: Range<usize>,
    /// Codepoint range of the placeholder in the redacted text.
    pub redacted: Range<usize>,
}

/// Output of a redaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Redacted {
    /// The rewritten text.
    pub text: String,
    /// Substitutions in text order.
    pub replacements: Vec<Replacement>,
}

impl Redacted {
    /// Returns true if nothing was replaced.
    pub fn is_unchanged(&self) -> bool {
        self.replacements.is_empty()
    }
}

/// Rewrites text by replacing matches with label placeholders.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    policy: RedactionPolicy,
    /// Replacement text per label, used instead of `[LABEL]`.
    labels: BTreeMap<String, String>,
}

impl Redactor {
    /// Creates a redactor with the given selection policy.
    pub fn new(policy: RedactionPolicy) -> Self {
        Self {
            policy,
            labels: BTreeMap::new(),
        }
    }

    /// Sets replacement text for some labels, e.g. `{"SSN": "***"}`.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Returns the selection policy.
    pub fn policy(&self) -> RedactionPolicy {
        self.policy
    }

    /// Returns the label overrides.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Redacts the matches the policy selects.
    pub fn redact(&self, text: &str, matches: &[Match]) -> Redacted {
        let selected: Vec<Match> = matches
            .iter()
            .filter(|m| self.policy.selects(m))
            .cloned()
            .collect();
        self.redact_all(text, selected)
    }

    /// Redacts every match given with `[LABEL]` placeholders.
    pub fn apply(text: &str, matches: Vec<Match>) -> Redacted {
        Self::default().redact_all(text, matches)
    }

    fn placeholder(&self, label: &str) -> String {
        match self.labels.get(label) {
            Some(replacement) => replacement.clone(),
            None => format!("[{label}]"),
        }
    }

    /// Redacts every match given, regardless of policy.
    ///
    /// Matches outside the text are ignored. When matches overlap the
    /// longer span wins, then the higher confidence.
    pub fn redact_all(&self, text: &str, matches: Vec<Match>) -> Redacted {
        let map = CodepointMap::new(text);
        let char_len = map.char_len();
        let spans =
            select_non_overlapping(matches.into_iter().filter(|m| m.fits(char_len)).collect());

        if spans.is_empty() {
            return Redacted {
                text: text.to_string(),
                replacements: Vec::new(),
            };
        }

        let mut out = String::with_capacity(text.len());
        let mut replacements = Vec::with_capacity(spans.len());
        let mut cursor = 0;
        let mut out_len = 0;

        for m in spans {
            out.push_str(map.slice(cursor..m.start));
            out_len += m.start - cursor;

            let placeholder = self.placeholder(&m.label);
            let placeholder_len = placeholder.chars().count();
            out.push_str(&placeholder);

            replacements.push(Replacement {
                original: m.span(),
                redacted: out_len..out_len + placeholder_len,
                label: m.label,
            });
            out_len += placeholder_len;
            cursor = m.end;
        }
        out.push_str(map.slice(cursor..char_len));

        Redacted {
            text: out,
            replacements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{PiiDetector, ScanBudget};

    fn pii(span: Range<usize>, label: &str, confidence: f32) -> Match {
        Match::new(span, label, confidence, MatchSource::Pii)
    }

    fn rule(span: Range<usize>, name: &str, action: RuleAction) -> Match {
        Match::new(
            span,
            name,
            1.0,
            MatchSource::Rule {
                action,
                priority: 0,
                message: String::new(),
            },
        )
    }

    /// Puts the original substrings back in place of the placeholders.
    fn restore(original: &str, redacted: &Redacted) -> String {
        let original_map = CodepointMap::new(original);
        let redacted_map = CodepointMap::new(&redacted.text);
        let mut out = String::new();
        let mut cursor = 0;
        for r in &redacted.replacements {
            out.push_str(redacted_map.slice(cursor..r.redacted.start));
            out.push_str(original_map.slice(r.original.clone()));
            cursor = r.redacted.end;
        }
        out.push_str(redacted_map.slice(cursor..redacted_map.char_len()));
        out
    }

    fn redact_pii(text: &str) -> Redacted {
        let outcome = PiiDetector::new().scan(text, &ScanBudget::unlimited());
        Redactor::default().redact(text, &outcome.matches)
    }

    #[test]
    fn replaces_spans_with_labels() {
        let text = "My SSN is 123-45-6789 and email is john@example.com";
        let redacted = redact_pii(text);
        assert_eq!(redacted.text, "My SSN is [SSN] and email is [EMAIL]");
        assert_eq!(redacted.replacements.len(), 2);
        assert_eq!(redacted.replacements[0].original, 10..21);
        assert_eq!(redacted.replacements[0].redacted, 10..15);
    }

    #[test]
    fn no_matches_leaves_text_untouched() {
        let redacted = Redactor::apply("nothing here", Vec::new());
        assert_eq!(redacted.text, "nothing here");
        assert!(redacted.is_unchanged());
    }

    #[test]
    fn empty_text() {
        let redacted = redact_pii("");
        assert_eq!(redacted.text, "");
        assert!(redacted.is_unchanged());
    }

    #[test]
    fn multibyte_text_is_not_split() {
        // "Café ☕ " is 7 codepoints but 10 bytes.
        let text = "Café ☕ 123-45-6789 done";
        let redacted = Redactor::apply(text, vec![pii(7..18, "SSN", 0.95)]);
        assert_eq!(redacted.text, "Café ☕ [SSN] done");
    }

    #[test]
    fn overlapping_matches_keep_longer_span() {
        let text = "abcdefghij";
        let redacted = Redactor::apply(
            text,
            vec![pii(0..4, "SHORT", 1.0), pii(2..9, "LONG", 0.5)],
        );
        assert_eq!(redacted.text, "ab[LONG]j");
        assert_eq!(redacted.replacements.len(), 1);
        assert_eq!(redacted.replacements[0].label, "LONG");
    }

    #[test]
    fn equal_overlaps_keep_higher_confidence() {
        let redacted = Redactor::apply(
            "abcdef",
            vec![pii(0..3, "LOW", 0.4), pii(1..4, "HIGH", 0.9)],
        );
        assert_eq!(redacted.text, "a[HIGH]ef");
    }

    #[test]
    fn out_of_range_matches_are_ignored() {
        let redacted = Redactor::apply("abc", vec![pii(1..10, "X", 1.0)]);
        assert_eq!(redacted.text, "abc");
    }

    #[test]
    fn policy_selects_matches() {
        let matches = vec![
            pii(0..3, "SSN", 0.95),
            rule(4..7, "secret", RuleAction::Redact),
            rule(8..11, "blocker", RuleAction::Block),
        ];
        let text = "aaa bbb ccc";

        let all = Redactor::new(RedactionPolicy::PiiAndRules).redact(text, &matches);
        assert_eq!(all.text, "[SSN] [secret] ccc");

        let rules_only = Redactor::new(RedactionPolicy::RulesOnly).redact(text, &matches);
        assert_eq!(rules_only.text, "aaa [secret] ccc");
    }

    #[test]
    fn label_overrides_replace_placeholders() {
        let labels = BTreeMap::from([("SSN".to_string(), "***-**-****".to_string())]);
        let redactor = Redactor::default().with_labels(labels);
        let text = "SSN 123-45-6789, mail a@b.io";
        let outcome = PiiDetector::new().scan(text, &ScanBudget::unlimited());
        let redacted = redactor.redact(text, &outcome.matches);

        assert_eq!(redacted.text, "SSN ***-**-****, mail [EMAIL]");
        assert_eq!(redacted.replacements[0].label, "SSN");
        assert_eq!(redacted.replacements[0].redacted, 4..15);
        assert_eq!(restore(text, &redacted), text);
    }

    #[test]
    fn round_trip_restores_original() {
        let texts = [
            "My SSN is 123-45-6789 and email is john@example.com",
            "Ünïcödé mail jöhn@example.com, card 4532015112830366 ✓",
            "Call (555) 123-4567 or 555.987.6543 from 192.168.1.10",
            "no pii at all",
        ];
        for text in texts {
            let redacted = redact_pii(text);
            assert_eq!(restore(text, &redacted), text);
        }
    }

    #[test]
    fn redaction_is_idempotent() {
        let texts = [
            "My SSN is 123-45-6789 and email is john@example.com",
            "card 4532015112830366 and ip 10.0.0.1",
        ];
        for text in texts {
            let once = redact_pii(text).text;
            let twice = redact_pii(&once).text;
            assert_eq!(once, twice);
        }
    }
}
