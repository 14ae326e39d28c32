//! Scoring collaborators.
//!
//! Detectors never compute model scores themselves. They call a scorer
//! through one of the traits below and treat the returned numbers as opaque
//! confidences in [0, 1]. Tests swap in [`FixedScorer`]; production can plug
//! in an ONNX model or anything else that implements the trait.
//!
//! [`LexiconScorer`] is the built-in toxicity scorer: weighted regex
//! lexicons with context and intensity modifiers. It needs no model files.
//! It matches against a normalized copy of the text (zero-width characters
//! removed, whitespace runs collapsed) and reports spans in the original.

use std::ops::Range;

use regex::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::detector::ScanBudget;
use crate::span::{clamp_unit, CodepointMap};

/// Invisible characters stripped before lexicon matching.
const ZERO_WIDTH: [char; 4] = ['\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}'];

/// Whole-text scorer (e.g. a prompt-injection model).
pub trait TextScorer: Send + Sync {
    /// Returns a score in [0, 1] for `text`.
    fn score(&self, text: &str) -> f32;

    /// Returns the name of this scorer for logging.
    fn name(&self) -> &'static str {
        "text_scorer"
    }
}

/// Toxicity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToxicityCategory {
    /// Hate speech or discrimination.
    Hate,
    /// Insults and threats aimed at a person.
    Harassment,
    /// Profane language.
    Profanity,
    /// Violent threats or descriptions.
    Violence,
    /// Self-harm or suicide.
    SelfHarm,
}

impl ToxicityCategory {
    /// Returns all categories.
    pub fn all() -> &'static [ToxicityCategory] {
        &[
            ToxicityCategory::Hate,
            ToxicityCategory::Harassment,
            ToxicityCategory::Profanity,
            ToxicityCategory::Violence,
            ToxicityCategory::SelfHarm,
        ]
    }

    /// Returns the match label for this category.
    pub fn label(&self) -> &'static str {
        match self {
            ToxicityCategory::Hate => "hate",
            ToxicityCategory::Harassment => "harassment",
            ToxicityCategory::Profanity => "profanity",
            ToxicityCategory::Violence => "violence",
            ToxicityCategory::SelfHarm => "self_harm",
        }
    }
}

/// One toxicity score, optionally tied to a codepoint span.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryScore {
    /// Category scored.
    pub category: ToxicityCategory,
    /// Score in [0, 1].
    pub confidence: f32,
    /// Codepoint span; `None` scores the whole text.
    pub span: Option<Range<usize>>,
}

impl CategoryScore {
    /// A score for the whole text.
    pub fn whole(category: ToxicityCategory, confidence: f32) -> Self {
        Self {
            category,
            confidence: clamp_unit(confidence),
            span: None,
        }
    }

    /// A score for one span.
    pub fn spanned(category: ToxicityCategory, confidence: f32, span: Range<usize>) -> Self {
        Self {
            category,
            confidence: clamp_unit(confidence),
            span: Some(span),
        }
    }
}

/// Per-category toxicity scorer.
pub trait ToxicityScorer: Send + Sync {
    /// Returns zero or more category scores for `text`.
    fn score(&self, text: &str) -> Vec<CategoryScore>;

    /// Scores `text` within `budget`.
    ///
    /// Scorers that can stop early override this and poll the budget. The
    /// default ignores it.
    fn score_within(&self, text: &str, budget: &ScanBudget) -> Vec<CategoryScore> {
        let _ = budget;
        self.score(text)
    }

    /// Returns the name of this scorer for logging.
    fn name(&self) -> &'static str {
        "toxicity_scorer"
    }
}

/// Scorer that returns fixed values. Used as a test double.
#[derive(Debug, Clone, Default)]
pub struct FixedScorer {
    text_score: f32,
    category_scores: Vec<CategoryScore>,
}

impl FixedScorer {
    /// A whole-text scorer that always returns `score`.
    pub fn text(score: f32) -> Self {
        Self {
            text_score: clamp_unit(score),
            category_scores: Vec::new(),
        }
    }

    /// A toxicity scorer that always returns `scores`.
    pub fn categories(scores: Vec<CategoryScore>) -> Self {
        Self {
            text_score: 0.0,
            category_scores: scores,
        }
    }
}

impl TextScorer for FixedScorer {
    fn score(&self, _text: &str) -> f32 {
        self.text_score
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

impl ToxicityScorer for FixedScorer {
    fn score(&self, text: &str) -> Vec<CategoryScore> {
        if text.is_empty() {
            return Vec::new();
        }
        self.category_scores.clone()
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Lexicon for one category.
#[derive(Debug)]
struct CategoryLexicon {
    category: ToxicityCategory,
    /// Regex set for the fast "anything here?" check.
    regex_set: RegexSet,
    /// Individual regexes with their base scores, for locating spans.
    regexes: Vec<(Regex, f32)>,
    /// Category weight applied to every base score.
    weight: f32,
}

/// Built-in regex lexicon toxicity scorer.
///
/// Each hit scores `base × category weight`, then every score is shifted by
/// the text's context modifier (academic or fictional framing lowers it)
/// and intensity modifier (shouting raises it).
#[derive(Debug)]
pub struct LexiconScorer {
    lexicons: Vec<CategoryLexicon>,
    context_modifiers: Vec<(Regex, f32)>,
    exclamations: Regex,
    shouting: Regex,
    punctuation_runs: Regex,
}

impl LexiconScorer {
    /// Creates a scorer with the default lexicons.
    pub fn new() -> Self {
        Self {
            lexicons: vec![
                Self::build_profanity_lexicon(),
                Self::build_hate_lexicon(),
                Self::build_violence_lexicon(),
                Self::build_harassment_lexicon(),
                Self::build_self_harm_lexicon(),
            ],
            context_modifiers: vec![
                (
                    Self::compile(r"\b(educational|academic|research|medical|clinical)\b"),
                    -0.3,
                ),
                (Self::compile(r"\b(fiction|story|novel|character|plot)\b"), -0.2),
                (Self::compile(r"\b(quote|citation|reference)\b"), -0.2),
                (Self::compile(r"\b(historical|history|past)\b"), -0.15),
            ],
            exclamations: Regex::new(r"!{2,}").expect("Invalid intensity pattern"),
            shouting: Regex::new(r"\b[A-Z]{4,}\b").expect("Invalid intensity pattern"),
            punctuation_runs: Regex::new(r"[!?]{3,}").expect("Invalid intensity pattern"),
        }
    }

    /// Sum of context modifiers that apply to `text` (zero or negative).
    fn context_modifier(&self, text: &str) -> f32 {
        self.context_modifiers
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|(_, modifier)| modifier)
            .sum()
    }

    /// Sum of intensity modifiers that apply to `text` (zero or positive).
    fn intensity_modifier(&self, text: &str) -> f32 {
        let mut modifier = 0.0;
        if self.exclamations.is_match(text) {
            modifier += 0.1;
        }
        if self.shouting.is_match(text) {
            modifier += 0.1;
        }
        if has_char_run(text, 4) {
            modifier += 0.05;
        }
        if self.punctuation_runs.is_match(text) {
            modifier += 0.1;
        }
        modifier
    }

    fn build_profanity_lexicon() -> CategoryLexicon {
        let patterns = [
            (r"\bf[*u]ck", 0.8),
            (r"\bsh[*i]t", 0.6),
            (r"\bd[*a]mn", 0.4),
            (r"\bhell\b", 0.3),
            (r"\bcrap", 0.3),
            (r"\b[a@]ss\b", 0.5),
            (r"\bb[*i]tch", 0.7),
        ];
        Self::build_lexicon(ToxicityCategory::Profanity, &patterns, 0.8)
    }

    fn build_hate_lexicon() -> CategoryLexicon {
        let patterns = [
            (
                r"\b(hate|despise|detest)\s+(all\s+)?(jews|muslims|christians|blacks|whites|asians)",
                0.95,
            ),
            (
                r"\b(kill|eliminate|destroy)\s+(all\s+)?(jews|muslims|christians|blacks|whites|asians)",
                1.0,
            ),
            (r"\bgenocide\b", 0.9),
            (r"\bethnic\s+cleansing\b", 0.95),
            (r"\bmaster\s+race\b", 0.9),
            (r"\bracial\s+purity\b", 0.9),
        ];
        Self::build_lexicon(ToxicityCategory::Hate, &patterns, 1.0)
    }

    fn build_violence_lexicon() -> CategoryLexicon {
        let patterns = [
            (r"\b(kill|murder|stab|shoot)\s+(you|him|her|them)\b", 0.9),
            (r"\b(punch|beat|attack)\s+(you|him|her|them)\b", 0.7),
            (r"\bI\s+(will|am\s+going\s+to)\s+(kill|murder|hurt)\b", 0.95),
            (r"\b(bomb|explosion|terrorist)\s+(threat|attack)", 0.9),
            (r"\bweapon\s+(of\s+mass\s+destruction|WMD)", 0.9),
            (r"\b(torture|mutilate)\b", 0.85),
        ];
        Self::build_lexicon(ToxicityCategory::Violence, &patterns, 0.9)
    }

    fn build_harassment_lexicon() -> CategoryLexicon {
        let patterns = [
            (r"\b(you\s+are|you're)\s+(stupid|dumb|idiot|moron)", 0.7),
            (r"\bnobody\s+(likes|wants|cares\s+about)\s+you\b", 0.75),
            (r"\b(go\s+)?kill\s+yourself\b", 0.95),
            (r"\byou\s+should\s+(die|disappear)\b", 0.9),
            (r"\bworthless\s+(person|human|individual)\b", 0.8),
            (r"\b(stalking|harassing|threatening)\b", 0.85),
        ];
        Self::build_lexicon(ToxicityCategory::Harassment, &patterns, 0.85)
    }

    fn build_self_harm_lexicon() -> CategoryLexicon {
        let patterns = [
            (r"\b(want\s+to|going\s+to)\s+(die|end\s+it|kill\s+myself)", 0.95),
            (r"\bsuicid(e|al)\b", 0.9),
            (r"\bself[\s-]?harm", 0.9),
            (r"\bcut(ting)?\s+myself\b", 0.95),
            (r"\blife\s+is\s+not\s+worth\s+living\b", 0.85),
            (r"\bend\s+my\s+life\b", 0.95),
        ];
        Self::build_lexicon(ToxicityCategory::SelfHarm, &patterns, 1.0)
    }

    fn build_lexicon(
        category: ToxicityCategory,
        patterns: &[(&str, f32)],
        weight: f32,
    ) -> CategoryLexicon {
        let regex_set = RegexSetBuilder::new(patterns.iter().map(|(p, _)| *p))
            .case_insensitive(true)
            .build()
            .expect("Invalid lexicon patterns");
        let regexes = patterns
            .iter()
            .map(|(p, score)| (Self::compile(p), *score))
            .collect();

        CategoryLexicon {
            category,
            regex_set,
            regexes,
            weight,
        }
    }

    fn compile(pattern: &str) -> Regex {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("Invalid lexicon pattern")
    }
}

impl Default for LexiconScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ToxicityScorer for LexiconScorer {
    fn score(&self, text: &str) -> Vec<CategoryScore> {
        if text.is_empty() {
            return Vec::new();
        }

        let map = CodepointMap::new(text);
        let normalized = Normalized::new(text);
        let mut hits = Vec::new();

        for lexicon in &self.lexicons {
            // Fast check: does any pattern match?
            if !lexicon.regex_set.is_match(&normalized.text) {
                continue;
            }
            for (regex, base) in &lexicon.regexes {
                for m in regex.find_iter(&normalized.text) {
                    let span = map.char_range(normalized.original_range(m.range()));
                    hits.push((lexicon.category, base * lexicon.weight, span));
                }
            }
        }

        if hits.is_empty() {
            return Vec::new();
        }

        let modifier = self.context_modifier(&normalized.text)
            + self.intensity_modifier(&normalized.text);
        hits.into_iter()
            .map(|(category, score, span)| CategoryScore::spanned(category, score + modifier, span))
            .collect()
    }

    fn name(&self) -> &'static str {
        "lexicon"
    }
}

/// Text prepared for lexicon matching.
///
/// Zero-width characters are dropped and every whitespace run becomes one
/// space. For each byte of `text`, `origins` holds the byte range of the
/// original character it came from (a whole run, for a collapsed space).
#[derive(Debug)]
struct Normalized {
    text: String,
    origins: Vec<Range<usize>>,
    original_len: usize,
}

impl Normalized {
    fn new(original: &str) -> Self {
        let mut text = String::with_capacity(original.len());
        let mut origins: Vec<Range<usize>> = Vec::with_capacity(original.len());
        let mut in_space = false;

        for (start, c) in original.char_indices() {
            if ZERO_WIDTH.contains(&c) {
                continue;
            }
            let end = start + c.len_utf8();
            if c.is_whitespace() {
                if in_space {
                    if let Some(last) = origins.last_mut() {
                        last.end = end;
                    }
                    continue;
                }
                in_space = true;
                text.push(' ');
                origins.push(start..end);
                continue;
            }
            in_space = false;
            text.push(c);
            origins.extend(std::iter::repeat(start..end).take(c.len_utf8()));
        }

        Self {
            text,
            origins,
            original_len: original.len(),
        }
    }

    /// Maps a byte range of the normalized text back to the original.
    fn original_range(&self, range: Range<usize>) -> Range<usize> {
        if range.is_empty() {
            let at = self
                .origins
                .get(range.start)
                .map_or(self.original_len, |o| o.start);
            return at..at;
        }
        self.origins[range.start].start..self.origins[range.end - 1].end
    }
}

/// Returns true if some character repeats at least `run` times in a row.
fn has_char_run(text: &str, run: usize) -> bool {
    let mut prev = None;
    let mut count = 0;
    for c in text.chars() {
        if Some(c) == prev {
            count += 1;
        } else {
            prev = Some(c);
            count = 1;
        }
        if count >= run {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> LexiconScorer {
        LexiconScorer::new()
    }

    fn top(text: &str) -> Option<CategoryScore> {
        scorer()
            .score(text)
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    #[test]
    fn fixed_scorer_returns_its_values() {
        assert_eq!(TextScorer::score(&FixedScorer::text(0.4), "anything"), 0.4);
        let scores = vec![CategoryScore::whole(ToxicityCategory::Hate, 0.9)];
        let fixed = FixedScorer::categories(scores.clone());
        assert_eq!(ToxicityScorer::score(&fixed, "x"), scores);
        assert!(ToxicityScorer::score(&fixed, "").is_empty());
    }

    #[test]
    fn category_score_clamps() {
        assert_eq!(CategoryScore::whole(ToxicityCategory::Hate, 2.0).confidence, 1.0);
    }

    #[test]
    fn detects_violent_threat_with_span() {
        let text = "I will kill you";
        let hit = top(text).unwrap();
        assert_eq!(hit.category, ToxicityCategory::Violence);
        assert!(hit.confidence > 0.85);
        assert_eq!(hit.span, Some(0..11));
    }

    #[test]
    fn zero_width_characters_do_not_hide_threats() {
        let text = "I will k\u{200b}ill you";
        let hit = top(text).unwrap();
        assert_eq!(hit.category, ToxicityCategory::Violence);
        assert!(hit.confidence > 0.85);
        // The span covers the hidden character in the original text.
        assert_eq!(hit.span, Some(0..12));
    }

    #[test]
    fn whitespace_runs_are_collapsed() {
        let hit = top("I  will\t\tkill  you").unwrap();
        assert_eq!(hit.category, ToxicityCategory::Violence);
        assert_eq!(hit.span, Some(0..13));
    }

    #[test]
    fn normalized_offsets_map_back() {
        let normalized = Normalized::new("a\u{feff}b  c\u{200d}é");
        assert_eq!(normalized.text, "ab cé");
        // "b c" in the normalized text spans "b  c" in the original.
        assert_eq!(normalized.original_range(1..4), 4..8);
        // "é" is two bytes in both texts.
        assert_eq!(normalized.original_range(4..6), 11..13);
        assert_eq!(normalized.original_range(6..6), 13..13);
    }

    #[test]
    fn detects_self_harm() {
        let hit = top("I want to end my life").unwrap();
        assert_eq!(hit.category, ToxicityCategory::SelfHarm);
        assert!(hit.confidence >= 0.9);
    }

    #[test]
    fn academic_context_lowers_score() {
        let plain = top("genocide").unwrap().confidence;
        let framed = top("a historical research paper on genocide").unwrap().confidence;
        assert!(framed < plain);
    }

    #[test]
    fn shouting_raises_score() {
        let calm = top("you are stupid").unwrap().confidence;
        let loud = top("YOU ARE STUPID!!").unwrap().confidence;
        assert!(loud > calm);
    }

    #[test]
    fn safe_text_scores_nothing() {
        assert!(scorer().score("How can I help you today?").is_empty());
        assert!(scorer().score("I want to improve my cooking skill").is_empty());
        assert!(scorer().score("").is_empty());
    }

    #[test]
    fn char_runs() {
        assert!(has_char_run("nooooo", 4));
        assert!(!has_char_run("noo", 4));
    }

    #[test]
    fn category_labels() {
        let labels: Vec<_> = ToxicityCategory::all().iter().map(|c| c.label()).collect();
        assert_eq!(labels, vec!["hate", "harassment", "profanity", "violence", "self_harm"]);
    }
}
