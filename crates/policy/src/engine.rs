//! Rule evaluation engine.
//!
//! Rules are compiled into an immutable [`RuleSet`] snapshot. Checks clone
//! the current snapshot under a read lock and evaluate against it, so a
//! reload never blocks in-flight checks beyond the pointer swap itself.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::rule::{Direction, FilterRule, RuleAction, RuleKind, Severity};

/// Refusal shown when a user's input is blocked.
pub const REFUSAL_INPUT: &str =
    "Lo siento, no puedo procesar esa solicitud por politicas de seguridad.";

/// Refusal substituted when the model's output is blocked.
pub const REFUSAL_OUTPUT: &str = "Lo siento, no puedo proporcionar esa informacion.";

/// The outcome of a rule match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub rule_id: i64,
    pub rule_name: String,
    pub action: RuleAction,
    pub severity: Severity,
    /// True only for [`RuleAction::Block`]
    pub blocked: bool,
    /// Human-readable reason, shaped by the action
    pub reason: String,
    /// The fragment that triggered the rule
    pub matched_text: String,
    pub timestamp: DateTime<Utc>,
}

impl Verdict {
    fn new(rule: &CompiledRule, matched_text: String) -> Self {
        let reason = match rule.action {
            RuleAction::Block => {
                format!("Contenido bloqueado por politica de seguridad: {}", rule.name)
            }
            RuleAction::Warn => format!("Advertencia de seguridad: {}", rule.name),
            RuleAction::Log => format!("Contenido registrado: {}", rule.name),
        };
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            action: rule.action,
            severity: rule.severity,
            blocked: rule.action == RuleAction::Block,
            reason,
            matched_text,
            timestamp: Utc::now(),
        }
    }
}

/// Pre-lowered pattern ready for matching.
#[derive(Debug, Clone)]
enum Matcher {
    /// Lowercased, trimmed keyword terms
    Keywords(Vec<String>),
    Pattern(Regex),
    /// Lowercased category label
    Category(String),
}

/// A rule compiled for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: i64,
    pub name: String,
    pub action: RuleAction,
    pub applies_to: Direction,
    pub severity: Severity,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(rule: &FilterRule) -> Option<Self> {
        let matcher = match rule.kind {
            RuleKind::Keyword => {
                let terms: Vec<String> = rule
                    .pattern
                    .split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect();
                if terms.is_empty() {
                    warn!(rule = %rule.name, "Skipping keyword rule with empty pattern");
                    return None;
                }
                Matcher::Keywords(terms)
            }
            RuleKind::Regex => match Regex::new(&rule.pattern) {
                Ok(re) => Matcher::Pattern(re),
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "Skipping rule with invalid regex");
                    return None;
                }
            },
            RuleKind::Category => Matcher::Category(rule.pattern.to_lowercase()),
        };
        Some(Self {
            id: rule.id,
            name: rule.name.clone(),
            action: rule.action,
            applies_to: rule.applies_to,
            severity: rule.severity,
            matcher,
        })
    }

    /// The fragment of `text` this rule matches, if any.
    fn matched_fragment(&self, text: &str, lowered: &str) -> Option<String> {
        match &self.matcher {
            Matcher::Keywords(terms) => terms
                .iter()
                .find(|term| lowered.contains(term.as_str()))
                .cloned(),
            Matcher::Pattern(re) => re.find(text).map(|m| m.as_str().to_string()),
            Matcher::Category(label) => lowered.contains(label.as_str()).then(|| label.clone()),
        }
    }
}

/// An immutable, ordered snapshot of compiled rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile a snapshot from raw rules.
    ///
    /// Inactive rules and rules that fail to compile are dropped; the rest
    /// are ordered by severity descending, name ascending, which fixes the
    /// evaluation order for the lifetime of the snapshot.
    pub fn compile(rules: &[FilterRule]) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .iter()
            .filter(|r| r.active)
            .filter_map(CompiledRule::compile)
            .collect();
        compiled.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.name.cmp(&b.name)));
        Self { rules: compiled }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The installed rules in evaluation order.
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Evaluate `text` against the snapshot. First match wins.
    pub fn check(&self, direction: Direction, text: &str) -> Option<Verdict> {
        let lowered = text.to_lowercase();
        for rule in &self.rules {
            if !rule.applies_to.applies_to(direction) {
                continue;
            }
            if let Some(fragment) = rule.matched_fragment(text, &lowered) {
                debug!(
                    rule = %rule.name,
                    action = rule.action.as_str(),
                    ?direction,
                    "Filter rule matched"
                );
                return Some(Verdict::new(rule, fragment));
            }
        }
        None
    }
}

/// Thread-safe rule engine holding the current [`RuleSet`] snapshot.
pub struct RuleEngine {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleEngine {
    /// Create an engine with no rules installed.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSet::default())),
        }
    }

    /// Create an engine with an initial rule list.
    pub fn with_rules(rules: &[FilterRule]) -> Self {
        let engine = Self::new();
        engine.reload(rules);
        engine
    }

    /// Compile and atomically install a new rule set.
    ///
    /// Returns the number of rules installed; the delta against the raw
    /// list is rules that were inactive or failed to compile.
    pub fn reload(&self, rules: &[FilterRule]) -> usize {
        let set = RuleSet::compile(rules);
        let installed = set.len();
        let dropped = rules.len() - installed;
        info!(installed, dropped, "Reloaded filter rules");
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(set);
        installed
    }

    /// Check text in a direction against the current snapshot.
    pub fn check(&self, direction: Direction, text: &str) -> Option<Verdict> {
        self.snapshot().check(direction, text)
    }

    /// The current snapshot. Checks spanning multiple texts should reuse
    /// one snapshot for a consistent view across a reload.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of rules in the current snapshot.
    pub fn rule_count(&self) -> usize {
        self.snapshot().len()
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip control characters before text is persisted.
pub fn sanitize_for_storage(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}
