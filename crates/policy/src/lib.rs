//! # Promptgate Policy
//!
//! The security rule engine: operator-configured keyword, regex and category
//! filters evaluated over both directions of chat traffic. Rules compile
//! into an immutable snapshot that checks read lock-free of the reload path;
//! first match wins, ordered by severity then name.

pub mod engine;
pub mod rule;

pub use engine::{
    CompiledRule, REFUSAL_INPUT, REFUSAL_OUTPUT, RuleEngine, RuleSet, Verdict,
    sanitize_for_storage,
};
pub use rule::{Direction, FilterRule, RuleAction, RuleFile, RuleKind, Severity};
