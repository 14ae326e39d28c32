//! Verdict resolution.
//!
//! Merges the matches of every detector into one [`Verdict`].
//!
//! ## Resolution order
//!
//! 1. Matches under their category floor are discarded
//! 2. Explicit Block rules and detector matches at or above
//!    `block_threshold` become Block candidates; Flag/Redact rules and
//!    detector matches at or above `flag_threshold` become Flag candidates
//! 3. Block beats Flag beats Allow. Within an action the candidate with the
//!    highest rule priority wins, then the highest confidence; rule matches
//!    outrank detector matches
//!
//! Any single strong signal is enough to block, even if every other
//! detector found nothing.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rules::RuleAction;
use crate::span::{DetectorKind, Match, MatchSource};

/// Label recorded for a detector that ran out of time under fail-closed.
pub const TIMEOUT_LABEL: &str = "TIMEOUT";

/// Final decision for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Let the content through.
    #[default]
    Allow,
    /// Let the content through but flag it.
    Flag,
    /// Block the content.
    Block,
}

impl Action {
    /// Returns a human-readable name for this action.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Allow => "Allow",
            Action::Flag => "Flag",
            Action::Block => "Block",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do when a detector runs out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Treat the missing findings as "nothing found".
    #[default]
    FailOpen,
    /// Treat a timeout as an automatic Flag.
    FailClosed,
}

/// One signal that contributed to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Detector that produced the signal.
    pub source: DetectorKind,
    /// Match label (category or rule name).
    pub label: String,
    /// Match confidence.
    pub confidence: f32,
}

/// The single safety decision for one evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Verdict {
    /// True exactly when `action` is Allow.
    pub is_safe: bool,
    /// The action to take.
    pub action: Action,
    /// Why the action was chosen (rule message or detector description).
    pub reason: Option<String>,
    /// Every signal that qualified, strongest first.
    pub triggered_by: Vec<Trigger>,
    /// Wall-clock time of the evaluation.
    pub latency_ms: f64,
}

impl Verdict {
    /// An Allow verdict with no triggers.
    pub fn allow() -> Self {
        Self {
            is_safe: true,
            ..Self::default()
        }
    }

    /// Returns true if the action is Block.
    pub fn is_blocked(&self) -> bool {
        self.action == Action::Block
    }

    /// Returns true if the action is Flag.
    pub fn is_flagged(&self) -> bool {
        self.action == Action::Flag
    }

    /// Returns the trigger labels in order.
    pub fn labels(&self) -> Vec<&str> {
        self.triggered_by.iter().map(|t| t.label.as_str()).collect()
    }
}

/// Thresholds and policy used by the [`Resolver`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverPolicy {
    /// Detector confidence at or above which a match blocks.
    pub block_threshold: f32,
    /// Detector confidence at or above which a match flags.
    pub flag_threshold: f32,
    /// Floor for toxicity matches.
    pub toxicity_floor: f32,
    /// Floor for injection matches.
    pub injection_floor: f32,
    /// Floor for PII matches.
    pub pii_floor: f32,
    /// Per-label floors; override the detector floors.
    pub category_floors: BTreeMap<String, f32>,
    /// Handling of detector timeouts.
    pub timeout_policy: TimeoutPolicy,
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self {
            block_threshold: 0.85,
            flag_threshold: 0.5,
            toxicity_floor: 0.7,
            injection_floor: 0.8,
            pii_floor: 0.0,
            category_floors: BTreeMap::new(),
            timeout_policy: TimeoutPolicy::FailOpen,
        }
    }
}

impl ResolverPolicy {
    /// Returns the confidence floor that applies to `m`.
    ///
    /// Custom rules always score 1.0, so their floor is never consulted.
    pub fn floor_for(&self, m: &Match) -> f32 {
        if let Some(floor) = self.category_floors.get(&m.label) {
            return *floor;
        }
        match m.source {
            MatchSource::Toxicity => self.toxicity_floor,
            MatchSource::Injection => self.injection_floor,
            MatchSource::Pii => self.pii_floor,
            MatchSource::Rule { .. } => 0.0,
        }
    }
}

/// A match that qualified for an action.
struct Candidate<'a> {
    action: Action,
    m: &'a Match,
}

impl Candidate<'_> {
    /// Ranking within one action: rules before detectors, then priority,
    /// then confidence. Ties keep input order.
    fn rank(&self, other: &Self) -> Ordering {
        let a = &self.m.source;
        let b = &other.m.source;
        b.is_rule()
            .cmp(&a.is_rule())
            .then_with(|| b.priority().cmp(&a.priority()))
            .then_with(|| {
                other
                    .m
                    .confidence
                    .partial_cmp(&self.m.confidence)
                    .unwrap_or(Ordering::Equal)
            })
    }
}

/// Combines matches into verdicts.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    policy: ResolverPolicy,
}

impl Resolver {
    /// Creates a resolver with the given policy.
    pub fn new(policy: ResolverPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy.
    pub fn policy(&self) -> &ResolverPolicy {
        &self.policy
    }

    /// Resolves `matches` into a verdict. `timed_out` lists detectors that
    /// ran out of budget; they only matter under [`TimeoutPolicy::FailClosed`].
    pub fn resolve(&self, matches: &[Match], timed_out: &[DetectorKind]) -> Verdict {
        let mut candidates: Vec<Candidate<'_>> = matches
            .iter()
            .filter(|m| m.confidence >= self.policy.floor_for(m))
            .filter_map(|m| self.classify(m).map(|action| Candidate { action, m }))
            .collect();

        candidates.sort_by(|a, b| b.action.cmp(&a.action).then_with(|| a.rank(b)));

        let mut triggered_by: Vec<Trigger> = candidates
            .iter()
            .map(|c| Trigger {
                source: c.m.source.kind(),
                label: c.m.label.clone(),
                confidence: c.m.confidence,
            })
            .collect();

        let mut action = candidates.first().map(|c| c.action).unwrap_or_default();
        let mut reason = candidates.first().map(|c| describe(c.m));

        if self.policy.timeout_policy == TimeoutPolicy::FailClosed && !timed_out.is_empty() {
            for kind in timed_out {
                triggered_by.push(Trigger {
                    source: *kind,
                    label: TIMEOUT_LABEL.to_string(),
                    confidence: 1.0,
                });
            }
            if action == Action::Allow {
                action = Action::Flag;
                reason = Some(format!("Detector timed out: {}", timed_out[0]));
            }
        }

        Verdict {
            is_safe: action == Action::Allow,
            action,
            reason,
            triggered_by,
            latency_ms: 0.0,
        }
    }

    /// Maps a surviving match to the action it argues for, if any.
    fn classify(&self, m: &Match) -> Option<Action> {
        match m.source.action() {
            Some(RuleAction::Block) => Some(Action::Block),
            Some(RuleAction::Flag) | Some(RuleAction::Redact) => Some(Action::Flag),
            None if m.confidence >= self.policy.block_threshold => Some(Action::Block),
            None if m.confidence >= self.policy.flag_threshold => Some(Action::Flag),
            None => None,
        }
    }
}

/// Reason text for a deciding match.
fn describe(m: &Match) -> String {
    match &m.source {
        MatchSource::Rule { message, .. } => message.clone(),
        MatchSource::Toxicity => format!("Toxic content detected: {}", m.label),
        MatchSource::Pii => format!("PII detected: {}", m.label),
        MatchSource::Injection => "Prompt injection detected".to_string(),
    }
}
