//! LLM Guard Core - Detection, rule resolution, and redaction.
//!
//! This crate provides an in-process content-safety pipeline for text sent
//! to and received from language models. A [`SafetyGuard`] runs several
//! detectors over one input, resolves their findings into a single
//! [`Verdict`], and can produce a redacted copy of the text.
//!
//! ```no_run
//! use llm_guard_core::{GuardConfig, RuleAction, SafetyGuard};
//!
//! # async fn run() -> llm_guard_core::Result<()> {
//! let guard = SafetyGuard::new(GuardConfig::default())?;
//! guard.add_custom_rule("codename", r"project\s+falcon", RuleAction::Redact, "Codename", 0)?;
//!
//! let result = guard.check("Tell me about project falcon").await;
//! println!("{} {:?}", result.verdict.action, result.verdict.reason);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod guard;
pub mod redactor;
pub mod resolver;
pub mod rules;
pub mod scoring;
pub mod span;

pub use config::{GuardConfig, RedactionPolicy, TimeoutPolicy};
pub use detector::{
    CustomRuleDetector, Detector, InjectionAssessment, InjectionDetector, InjectionTechnique,
    PiiCategory, PiiDetector, ScanBudget, ScanOutcome, ToxicityDetector,
};
pub use error::{GuardError, Result};
pub use events::{CheckEvent, EventSink, GuardMetrics, MetricsSink, NoopSink, TracingSink};
pub use guard::{GuardResult, SafetyGuard};
pub use redactor::{Redacted, Redactor, Replacement};
pub use resolver::{Action, Resolver, ResolverPolicy, Trigger, Verdict};
pub use rules::{Rule, RuleAction, RuleRegistry, RuleSpec};
pub use scoring::{
    CategoryScore, FixedScorer, LexiconScorer, TextScorer, ToxicityCategory, ToxicityScorer,
};
pub use span::{select_non_overlapping, CodepointMap, DetectorKind, Match, MatchSource};
