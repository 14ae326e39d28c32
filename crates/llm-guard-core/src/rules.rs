//! Custom pattern rules and the registry that owns them.
//!
//! Rules map a regex pattern to an action. The registry keeps them in
//! evaluation order: priority descending, then registration order.
//!
//! ## Concurrency
//!
//! The registry publishes an immutable, already-sorted snapshot behind a
//! lock. Readers clone the `Arc` and evaluate without holding the lock;
//! writers build a new list and swap it in, so a reader never observes a
//! half-applied change.

use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Priority given to rules registered without one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Message given to rules registered without one.
pub const DEFAULT_MESSAGE: &str = "Custom rule triggered";

/// Action to take when a custom rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Block the content entirely.
    #[default]
    Block,
    /// Flag the content but let it through.
    Flag,
    /// Replace the matched text with the rule name.
    Redact,
}

impl RuleAction {
    /// Returns a human-readable name for this action.
    pub fn name(&self) -> &'static str {
        match self {
            RuleAction::Block => "Block",
            RuleAction::Flag => "Flag",
            RuleAction::Redact => "Redact",
        }
    }
}

impl std::str::FromStr for RuleAction {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(RuleAction::Block),
            "flag" | "warn" => Ok(RuleAction::Flag),
            "redact" => Ok(RuleAction::Redact),
            other => Err(GuardError::Config(format!("unknown rule action: {other}"))),
        }
    }
}

/// A compiled custom rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Unique name; also the label of the matches this rule produces.
    pub name: String,
    /// Compiled pattern (case-insensitive).
    pub pattern: Regex,
    /// Action to take when the pattern matches.
    pub action: RuleAction,
    /// Higher priorities are evaluated and ranked first.
    pub priority: i32,
    /// Message reported when this rule decides a verdict.
    pub message: String,
    /// Whether this rule is currently evaluated.
    pub enabled: bool,
    seq: u64,
}

impl Rule {
    /// Compiles a new rule with the default priority.
    ///
    /// Fails with [`GuardError::InvalidPattern`] if the pattern does not compile.
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        action: RuleAction,
        message: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let pattern = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| GuardError::InvalidPattern {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            pattern,
            action,
            priority: DEFAULT_PRIORITY,
            message: message.into(),
            enabled: true,
            seq: 0,
        })
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets whether this rule is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Position in registration order (0 until registered).
    pub fn registration_order(&self) -> u64 {
        self.seq
    }

    /// Returns the plain-data form of this rule.
    pub fn to_spec(&self) -> RuleSpec {
        RuleSpec {
            name: self.name.clone(),
            pattern: self.pattern.as_str().to_string(),
            action: self.action,
            priority: self.priority,
            message: self.message.clone(),
            enabled: self.enabled,
        }
    }
}

/// Uncompiled rule, as found in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Unique rule name.
    pub name: String,
    /// Regex source.
    pub pattern: String,
    /// Action to take on match.
    #[serde(default)]
    pub action: RuleAction,
    /// Evaluation priority.
    #[serde(default)]
    pub priority: i32,
    /// Verdict message.
    #[serde(default = "default_message")]
    pub message: String,
    /// Whether the rule is active.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    /// Compiles this spec into a [`Rule`].
    pub fn compile(&self) -> Result<Rule> {
        Ok(
            Rule::new(&self.name, &self.pattern, self.action, &self.message)?
                .with_priority(self.priority)
                .with_enabled(self.enabled),
        )
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    rules: Arc<Vec<Rule>>,
    next_seq: u64,
}

/// Owner of the custom rules of one guard.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    state: RwLock<RegistryState>,
}

impl RuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current rules in evaluation order.
    ///
    /// The snapshot is immutable; later writes do not affect it.
    pub fn snapshot(&self) -> Arc<Vec<Rule>> {
        Arc::clone(&self.state.read().rules)
    }

    /// Returns a copy of the rules in evaluation order.
    pub fn list(&self) -> Vec<Rule> {
        self.snapshot().as_ref().clone()
    }

    /// Returns the rules as plain data, in evaluation order.
    pub fn specs(&self) -> Vec<RuleSpec> {
        self.snapshot().iter().map(Rule::to_spec).collect()
    }

    /// Gets a rule by name.
    pub fn get(&self, name: &str) -> Option<Rule> {
        self.snapshot().iter().find(|r| r.name == name).cloned()
    }

    /// Returns the number of registered rules.
    pub fn len(&self) -> usize {
        self.state.read().rules.len()
    }

    /// Returns true if no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a rule. Fails with [`GuardError::DuplicateRule`] if the name
    /// is taken.
    pub fn add(&self, rule: Rule) -> Result<()> {
        self.write(|rules, next_seq| {
            if rules.iter().any(|r| r.name == rule.name) {
                return Err(GuardError::DuplicateRule(rule.name.clone()));
            }
            let mut rule = rule;
            rule.seq = *next_seq;
            *next_seq += 1;
            tracing::info!(
                rule = %rule.name,
                action = rule.action.name(),
                priority = rule.priority,
                "Added custom rule"
            );
            rules.push(rule);
            Ok(())
        })
    }

    /// Registers a rule, replacing any rule with the same name.
    ///
    /// A replaced rule keeps its registration slot. Returns the previous rule.
    pub fn add_or_replace(&self, rule: Rule) -> Option<Rule> {
        self.write(|rules, next_seq| {
            let mut rule = rule;
            if let Some(existing) = rules.iter_mut().find(|r| r.name == rule.name) {
                rule.seq = existing.seq;
                tracing::info!(rule = %rule.name, "Replaced custom rule");
                return Ok(Some(std::mem::replace(existing, rule)));
            }
            rule.seq = *next_seq;
            *next_seq += 1;
            tracing::info!(
                rule = %rule.name,
                action = rule.action.name(),
                priority = rule.priority,
                "Added custom rule"
            );
            rules.push(rule);
            Ok(None)
        })
        .unwrap_or(None)
    }

    /// Removes a rule by name.
    pub fn remove(&self, name: &str) -> Result<Rule> {
        self.write(|rules, _| {
            let pos = rules
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| GuardError::RuleNotFound(name.to_string()))?;
            tracing::info!(rule = %name, "Removed custom rule");
            Ok(rules.remove(pos))
        })
    }

    /// Enables a rule by name.
    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    /// Disables a rule by name.
    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    /// Enables or disables a rule by name.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.update(name, |rule| rule.enabled = enabled)
    }

    /// Updates a rule's priority and re-sorts the evaluation order.
    pub fn update_priority(&self, name: &str, priority: i32) -> Result<()> {
        self.update(name, |rule| rule.priority = priority)
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Rule)) -> Result<()> {
        self.write(|rules, _| {
            let rule = rules
                .iter_mut()
                .find(|r| r.name == name)
                .ok_or_else(|| GuardError::RuleNotFound(name.to_string()))?;
            f(rule);
            tracing::debug!(
                rule = %name,
                enabled = rule.enabled,
                priority = rule.priority,
                "Updated custom rule"
            );
            Ok(())
        })
    }

    /// Applies `f` to a private copy of the rule list and publishes it on
    /// success. The write lock is held throughout, serializing writers.
    fn write<T>(&self, f: impl FnOnce(&mut Vec<Rule>, &mut u64) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let mut rules = state.rules.as_ref().clone();
        let mut next_seq = state.next_seq;

        let out = f(&mut rules, &mut next_seq)?;

        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        state.rules = Arc::new(rules);
        state.next_seq = next_seq;
        Ok(out)
    }
}
