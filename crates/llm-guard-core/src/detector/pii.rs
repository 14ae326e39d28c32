//! Pattern-based PII detector.
//!
//! Each category is one pre-compiled regex with a fixed confidence that
//! reflects how precise the pattern is. Credit cards are Luhn-validated and
//! score 1.0. Some loose numeric patterns only count when a context word
//! ("account", "routing", "zip") appears somewhere in the text.
//!
//! Person names have no canonical form. They are only reported when the
//! text as a whole looks like it introduces someone (see [`NAME_MIN_SCORE`]).

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ScanBudget, ScanOutcome};
use crate::span::{select_non_overlapping, CodepointMap, Match, MatchSource};

/// PII categories recognised by [`PiiDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiCategory {
    /// US social security number.
    Ssn,
    /// Payment card number.
    CreditCard,
    /// Email address.
    Email,
    /// Phone number.
    Phone,
    /// IPv4 address.
    IpAddress,
    /// Date of birth introduced by a keyword.
    DateOfBirth,
    /// Passport number.
    Passport,
    /// Medical record number.
    MedicalRecord,
    /// Insurance policy or member id.
    InsuranceId,
    /// Bitcoin-style address.
    CryptoAddress,
    /// Bank account number.
    BankAccount,
    /// ABA routing number.
    RoutingNumber,
    /// US ZIP code.
    Zipcode,
    /// Person name, reported only in name-introducing context.
    Name,
}

impl PiiCategory {
    /// Returns the label used for matches and redaction placeholders.
    pub fn label(&self) -> &'static str {
        match self {
            PiiCategory::Ssn => "SSN",
            PiiCategory::CreditCard => "CREDIT_CARD",
            PiiCategory::Email => "EMAIL",
            PiiCategory::Phone => "PHONE",
            PiiCategory::IpAddress => "IP_ADDRESS",
            PiiCategory::DateOfBirth => "DATE_OF_BIRTH",
            PiiCategory::Passport => "PASSPORT",
            PiiCategory::MedicalRecord => "MEDICAL_RECORD",
            PiiCategory::InsuranceId => "INSURANCE_ID",
            PiiCategory::CryptoAddress => "CRYPTO_ADDRESS",
            PiiCategory::BankAccount => "BANK_ACCOUNT",
            PiiCategory::RoutingNumber => "ROUTING_NUMBER",
            PiiCategory::Zipcode => "ZIPCODE",
            PiiCategory::Name => "NAME",
        }
    }

    /// Looks a category up by its label.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.label() == label)
    }

    /// Returns all categories.
    pub fn all() -> &'static [PiiCategory] {
        &[
            PiiCategory::Ssn,
            PiiCategory::CreditCard,
            PiiCategory::Email,
            PiiCategory::Phone,
            PiiCategory::IpAddress,
            PiiCategory::DateOfBirth,
            PiiCategory::Passport,
            PiiCategory::MedicalRecord,
            PiiCategory::InsuranceId,
            PiiCategory::CryptoAddress,
            PiiCategory::BankAccount,
            PiiCategory::RoutingNumber,
            PiiCategory::Zipcode,
            PiiCategory::Name,
        ]
    }

    /// Returns true for categories that identify a person on their own.
    pub fn is_high_risk(&self) -> bool {
        matches!(
            self,
            PiiCategory::Ssn
                | PiiCategory::CreditCard
                | PiiCategory::Passport
                | PiiCategory::MedicalRecord
        )
    }
}

/// Pattern configuration for a category.
#[derive(Debug)]
struct CategoryPattern {
    category: PiiCategory,
    regex: Regex,
    confidence: f32,
    /// Extra check on the matched text (e.g. Luhn).
    validator: Option<fn(&str) -> bool>,
    /// At least one of these (lowercase) must appear in the text.
    context: &'static [&'static str],
}

/// Name score above which name candidates become matches.
pub const NAME_MIN_SCORE: f32 = 0.5;

/// Confidence of a NAME match. Names are the least precise category.
const NAME_CONFIDENCE: f32 = 0.6;

/// Lowercase phrases that suggest a person is being named.
const NAME_CONTEXT: &[&str] = &[
    "name",
    "called",
    "named",
    "refer",
    "i am",
    "i'm",
    "contact",
    "reach",
    "ask for",
    "speak to",
];

/// Context-scored person name recognizer.
#[derive(Debug)]
struct NameRecognizer {
    /// "Dr. Smith", "Ms Jones".
    titled: Regex,
    /// "Jane Doe".
    full_name: Regex,
    /// "my name is Jane"; group 1 is the name.
    introduction: Regex,
}

impl NameRecognizer {
    fn new() -> Self {
        Self {
            titled: Regex::new(r"\b(?:Mr|Mrs|Ms|Miss|Dr|Prof)\.?\s+[A-Z][a-z]+\b")
                .expect("Invalid name pattern"),
            full_name: Regex::new(r"\b[A-Z][a-z]+\s+[A-Z][a-z]+\b").expect("Invalid name pattern"),
            introduction: Regex::new(
                r"\b(?i:i am|i'm|my name is|call me|this is)\s+([A-Z][a-z]+)\b",
            )
            .expect("Invalid name pattern"),
        }
    }

    /// How strongly `text` looks like it names a person, in [0, 1].
    fn score(&self, text: &str, text_lower: &str) -> f32 {
        let mut score: f32 = 0.0;
        if self.titled.is_match(text) {
            score += 0.3;
        }
        if self.full_name.is_match(text) {
            score += 0.3;
        }
        if NAME_CONTEXT.iter().any(|ctx| text_lower.contains(ctx)) {
            score += 0.2;
        }
        if self.introduction.is_match(text) {
            score += 0.4;
        }
        score.min(1.0)
    }

    /// Name spans in `text`, or nothing if the text scores too low.
    ///
    /// Titled names take precedence over the looser patterns they overlap.
    fn find(&self, text: &str, text_lower: &str, map: &CodepointMap<'_>) -> Vec<Match> {
        if self.score(text, text_lower) <= NAME_MIN_SCORE {
            return Vec::new();
        }

        let mut spans: Vec<std::ops::Range<usize>> =
            self.titled.find_iter(text).map(|m| m.range()).collect();
        let loose = self
            .full_name
            .find_iter(text)
            .map(|m| m.range())
            .chain(
                self.introduction
                    .captures_iter(text)
                    .filter_map(|c| c.get(1))
                    .map(|m| m.range()),
            );
        for range in loose {
            if !spans.iter().any(|s| s.start < range.end && range.start < s.end) {
                spans.push(range);
            }
        }

        spans
            .into_iter()
            .map(|range| {
                Match::new(
                    map.char_range(range),
                    PiiCategory::Name.label(),
                    NAME_CONFIDENCE,
                    MatchSource::Pii,
                )
            })
            .collect()
    }
}

/// Detector for personally identifiable information.
#[derive(Debug)]
pub struct PiiDetector {
    patterns: Vec<CategoryPattern>,
    names: Option<NameRecognizer>,
}

impl PiiDetector {
    /// Creates a detector for every category.
    pub fn new() -> Self {
        Self {
            patterns: Self::build_default_patterns(),
            names: Some(NameRecognizer::new()),
        }
    }

    /// Creates a detector restricted to the given categories.
    pub fn with_categories(categories: &[PiiCategory]) -> Self {
        let patterns = Self::build_default_patterns()
            .into_iter()
            .filter(|p| categories.contains(&p.category))
            .collect();
        let names = categories
            .contains(&PiiCategory::Name)
            .then(NameRecognizer::new);
        Self { patterns, names }
    }

    /// Scans `text` within `budget`. Returned matches never overlap.
    pub fn scan(&self, text: &str, budget: &ScanBudget) -> ScanOutcome {
        if text.is_empty() {
            return ScanOutcome::complete(Vec::new());
        }

        let map = CodepointMap::new(text);
        let text_lower = text.to_lowercase();
        let mut found = Vec::new();

        for pattern in &self.patterns {
            if budget.is_exhausted() {
                tracing::debug!(found = found.len(), "PII scan stopped early");
                return ScanOutcome::partial(select_non_overlapping(found));
            }

            if !pattern.context.is_empty()
                && !pattern.context.iter().any(|ctx| text_lower.contains(ctx))
            {
                continue;
            }

            for m in pattern.regex.find_iter(text) {
                if let Some(validate) = pattern.validator {
                    if !validate(m.as_str()) {
                        continue;
                    }
                }
                found.push(Match::new(
                    map.char_range(m.range()),
                    pattern.category.label(),
                    pattern.confidence,
                    MatchSource::Pii,
                ));
            }
        }

        if let Some(names) = &self.names {
            if budget.is_exhausted() {
                return ScanOutcome::partial(select_non_overlapping(found));
            }
            found.extend(names.find(text, &text_lower, &map));
        }

        ScanOutcome::complete(select_non_overlapping(found))
    }

    /// Scans `text` without a time limit.
    pub fn find(&self, text: &str) -> Vec<Match> {
        self.scan(text, &ScanBudget::unlimited()).matches
    }

    /// Returns the distinct categories present in `text`.
    pub fn pii_types(&self, text: &str) -> Vec<PiiCategory> {
        let mut types: Vec<PiiCategory> = self
            .find(text)
            .iter()
            .filter_map(|m| PiiCategory::from_label(&m.label))
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Returns true if `text` contains a high-risk category.
    pub fn has_high_risk_pii(&self, text: &str) -> bool {
        self.pii_types(text).iter().any(PiiCategory::is_high_risk)
    }

    fn build_default_patterns() -> Vec<CategoryPattern> {
        vec![
            Self::pattern(PiiCategory::Ssn, r"\b[0-9]{3}-[0-9]{2}-[0-9]{4}\b", 0.95),
            CategoryPattern {
                validator: Some(luhn_valid),
                ..Self::pattern(
                    PiiCategory::CreditCard,
                    r"\b(?:[0-9]{4}[ -]?){3}[0-9]{4}\b|\b[0-9]{13,19}\b",
                    1.0,
                )
            },
            Self::pattern(
                PiiCategory::Email,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
                0.7,
            ),
            Self::pattern(
                PiiCategory::Phone,
                r"(?:\+?1[ .-]?)?(?:\([0-9]{3}\)|\b[0-9]{3})[ .-]?[0-9]{3}[ .-]?[0-9]{4}\b(?:[ ]?(?:ext|x|extension)[ ]?[0-9]{1,5})?",
                0.8,
            ),
            Self::pattern(
                PiiCategory::IpAddress,
                r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
                0.6,
            ),
            Self::pattern(
                PiiCategory::DateOfBirth,
                r"(?i)\b(?:DOB|Date of Birth|Born|Birthday)[\s:]*(?:[0-9]{1,2}[-/][0-9]{1,2}[-/][0-9]{2,4}|[0-9]{4}[-/][0-9]{1,2}[-/][0-9]{1,2})",
                0.9,
            ),
            Self::pattern(PiiCategory::Passport, r"\b[A-Z]{1,2}[0-9]{6,9}\b", 0.75),
            Self::pattern(PiiCategory::MedicalRecord, r"(?i)\bMRN[\s:]?[0-9]{6,10}\b", 0.95),
            Self::pattern(
                PiiCategory::InsuranceId,
                r"(?i)\b(?:policy|member|insurance)(?:\s+(?:id|number|no\.?))?[\s#:]+[A-Z0-9]*[0-9][A-Z0-9]{4,}\b",
                0.9,
            ),
            Self::pattern(
                PiiCategory::CryptoAddress,
                r"\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b",
                0.7,
            ),
            CategoryPattern {
                context: &["account", "bank"],
                ..Self::pattern(PiiCategory::BankAccount, r"\b[0-9]{8,17}\b", 0.85)
            },
            CategoryPattern {
                context: &["routing", "aba", "rtn"],
                ..Self::pattern(PiiCategory::RoutingNumber, r"\b[0-9]{9}\b", 0.8)
            },
            CategoryPattern {
                context: &["zip", "postal"],
                ..Self::pattern(PiiCategory::Zipcode, r"\b[0-9]{5}(?:-[0-9]{4})?\b", 0.4)
            },
        ]
    }

    fn pattern(category: PiiCategory, pattern: &str, confidence: f32) -> CategoryPattern {
        CategoryPattern {
            category,
            regex: Regex::new(pattern).expect("Invalid PII pattern"),
            confidence,
            validator: None,
            context: &[],
        }
    }
}

impl Default for PiiDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Luhn checksum over the digits of `number`; other characters are ignored.
///
/// Only 13 to 19 digit numbers can pass.
pub fn luhn_valid(number: &str) -> bool {
    let digits: Vec<u32> = number.chars().filter_map(|c| c.to_digit(10)).collect();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();

    sum % 10 == 0
}
