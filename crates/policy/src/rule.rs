//! Filter rule data model — the types operators configure.

use serde::{Deserialize, Serialize};

/// How a rule's pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Comma-separated list of case-insensitive substrings
    Keyword,
    /// Regular expression, matched as written
    Regex,
    /// Case-insensitive substring match on a category label
    Category,
}

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Reject the content and substitute a refusal
    Block,
    /// Let the content through, flagged with a warning
    Warn,
    /// Let the content through, recorded only
    Log,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Block => "block",
            RuleAction::Warn => "warn",
            RuleAction::Log => "log",
        }
    }
}

/// Which traffic direction a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// User-submitted text
    Input,
    /// Model-generated text
    Output,
    /// Both directions
    Both,
}

impl Direction {
    /// Whether a rule scoped to `self` applies to a check in `checked`.
    pub fn applies_to(&self, checked: Direction) -> bool {
        matches!(self, Direction::Both) || *self == checked
    }
}

/// Rule severity. Higher severities evaluate first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

fn default_true() -> bool {
    true
}

fn default_severity() -> Severity {
    Severity::Medium
}

/// A single content filter rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    /// Stable identifier assigned by the rule source
    pub id: i64,

    /// Unique name, used in verdict reasons and violation records
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Pattern interpretation
    pub kind: RuleKind,

    /// The pattern itself (keyword list, regex, or category label)
    pub pattern: String,

    /// What to do on match
    pub action: RuleAction,

    /// Which direction this rule inspects
    #[serde(default = "default_direction")]
    pub applies_to: Direction,

    /// Evaluation priority class
    #[serde(default = "default_severity")]
    pub severity: Severity,

    /// Disabled rules are skipped at compile time
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_direction() -> Direction {
    Direction::Both
}

/// A rule list as loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl RuleFile {
    /// Parse a rule file from a TOML string.
    ///
    /// Parsing is strict about shape but not about patterns: rules with
    /// invalid regexes are only dropped later, when the set is compiled.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn direction_scoping() {
        assert!(Direction::Both.applies_to(Direction::Input));
        assert!(Direction::Both.applies_to(Direction::Output));
        assert!(Direction::Input.applies_to(Direction::Input));
        assert!(!Direction::Input.applies_to(Direction::Output));
    }

    #[test]
    fn rule_file_parses_with_defaults() {
        let file = RuleFile::from_toml(
            r#"
[[rules]]
id = 1
name = "sql_injection"
kind = "regex"
pattern = '(?i)(drop\s+table|delete\s+from)'
action = "block"
severity = "critical"

[[rules]]
id = 2
name = "salary_terms"
kind = "keyword"
pattern = "salario,sueldo,nomina"
action = "warn"
"#,
        )
        .unwrap();
        assert_eq!(file.rules.len(), 2);
        assert_eq!(file.rules[0].applies_to, Direction::Both);
        assert!(file.rules[0].active);
        assert_eq!(file.rules[1].severity, Severity::Medium);
    }

    #[test]
    fn rule_serialization_uses_lowercase_tags() {
        let rule = FilterRule {
            id: 7,
            name: "creds".into(),
            description: String::new(),
            kind: RuleKind::Keyword,
            pattern: "password".into(),
            action: RuleAction::Block,
            applies_to: Direction::Input,
            severity: Severity::High,
            active: true,
        };
        let json = serde_json::to_string(&rule).unwrap();
        assert!(json.contains("\"keyword\""));
        assert!(json.contains("\"block\""));
        assert!(json.contains("\"high\""));
    }
}
