//! Command safety policy
//!
//! Two cooperating layers decide whether a shell command may run: a fast
//! whitelist of known commands (`whitelist`) and a deterministic four-layer
//! risk analyzer (`risk`) that takes over when the whitelist does not match.
//! `PolicyEngine` is the single entry point that combines them.

pub mod risk;
pub mod rules;
pub mod whitelist;

use rules::RuleSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Risk tier of an instruction. Ordering is significant: `Safe < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Safe,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        f.write_str(s)
    }
}

/// Where a policy verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Whitelist,
    RiskAnalyzer,
}

/// Outcome of checking one shell command.
///
/// `Unmatched` is only ever produced by the whitelist layer; `PolicyEngine`
/// resolves it before returning to callers (either via the risk analyzer or,
/// when the analyzer is disabled, as a denial).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed {
        risk: RiskLevel,
        reason: String,
        matched_by: MatchSource,
    },
    Denied {
        reason: String,
        matched_by: MatchSource,
    },
    Unmatched,
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allowed { .. })
    }

    /// Risk to account for, regardless of verdict. Denials count as high.
    pub fn effective_risk(&self) -> RiskLevel {
        match self {
            PolicyDecision::Allowed { risk, .. } => *risk,
            PolicyDecision::Denied { .. } => RiskLevel::High,
            PolicyDecision::Unmatched => RiskLevel::Medium,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PolicyDecision::Allowed { reason, .. } | PolicyDecision::Denied { reason, .. } => {
                reason
            }
            PolicyDecision::Unmatched => "not matched",
        }
    }
}

/// Dangerous substrings used for instruction-level (non-shell) risk lifting.
/// Scanned over the action name and every string argument.
const HIGH_PATTERNS: &[&str] = &[
    "rm -rf",
    "kill",
    "mkfs",
    "dd if=",
    "> /dev/",
    ":(){:|:&};:",
    "chmod -R 777",
    "chown -R",
    "delete_files",
    "replace_in_file",
];

const MEDIUM_PATTERNS: &[&str] = &[
    "rm ",
    "docker rm",
    "docker stop",
    "systemctl stop",
    "systemctl restart",
    "reboot",
    "shutdown",
    "restart",
    "stop",
    "write_file",
    "append_to_file",
];

/// Unified safety policy entry point.
pub struct PolicyEngine {
    rules: RuleSet,
    risk_analyzer_enabled: bool,
}

impl PolicyEngine {
    pub fn new(rules: RuleSet, risk_analyzer_enabled: bool) -> Self {
        Self {
            rules,
            risk_analyzer_enabled,
        }
    }

    pub fn with_builtin_rules() -> Self {
        Self::new(RuleSet::builtin(), true)
    }

    /// Check a shell command: whitelist first, analyzer fall-through.
    ///
    /// Never returns `Unmatched`. With the analyzer disabled, an unmatched
    /// command is denied outright.
    pub fn check_command(&self, command: &str) -> PolicyDecision {
        let decision = whitelist::check(&self.rules, command);
        if !matches!(decision, PolicyDecision::Unmatched) {
            return decision;
        }

        if !self.risk_analyzer_enabled {
            return PolicyDecision::Denied {
                reason: "command not in whitelist and risk analysis is disabled".to_string(),
                matched_by: MatchSource::Whitelist,
            };
        }

        let assessment = risk::analyze_command(command);
        tracing::debug!(command, verdict = %assessment.tier, reason = %assessment.reason, "risk analyzer verdict");
        match assessment.tier {
            risk::Tier::Blocked => PolicyDecision::Denied {
                reason: assessment.reason,
                matched_by: MatchSource::RiskAnalyzer,
            },
            tier => PolicyDecision::Allowed {
                risk: tier.clamp_to_risk(),
                reason: assessment.reason,
                matched_by: MatchSource::RiskAnalyzer,
            },
        }
    }

    /// Pattern-based risk floor for non-shell instructions. Returns the
    /// highest tier whose pattern appears in the scanned text, if any.
    pub fn danger_pattern_risk(action: &str, args: &Value) -> Option<(RiskLevel, String)> {
        let mut text = String::from(action);
        collect_strings(args, &mut text);

        for pattern in HIGH_PATTERNS {
            if text.contains(pattern) {
                return Some((RiskLevel::High, format!("pattern matched: '{pattern}'")));
            }
        }
        for pattern in MEDIUM_PATTERNS {
            if text.contains(pattern) {
                return Some((RiskLevel::Medium, format!("pattern matched: '{pattern}'")));
            }
        }
        None
    }
}

fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push(' ');
            out.push_str(s);
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> PolicyEngine {
        PolicyEngine::with_builtin_rules()
    }

    #[test]
    fn whitelisted_command_skips_analyzer() {
        let decision = engine().check_command("ls -la");
        assert!(matches!(
            decision,
            PolicyDecision::Allowed {
                risk: RiskLevel::Safe,
                matched_by: MatchSource::Whitelist,
                ..
            }
        ));
    }

    #[test]
    fn unmatched_command_falls_through_to_analyzer() {
        let decision = engine().check_command("terraform plan");
        // Whatever the analyzer decides, the combined verdict must equal it.
        let direct = risk::analyze_command("terraform plan");
        match decision {
            PolicyDecision::Allowed {
                risk, matched_by, ..
            } => {
                assert_eq!(matched_by, MatchSource::RiskAnalyzer);
                assert_eq!(risk, direct.tier.clamp_to_risk());
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn analyzer_disabled_denies_unmatched() {
        let engine = PolicyEngine::new(RuleSet::builtin(), false);
        let decision = engine.check_command("terraform plan");
        assert!(matches!(decision, PolicyDecision::Denied { .. }));
    }

    #[test]
    fn danger_patterns_lift_file_deletion() {
        let args = json!({"files": ["/tmp/a.txt"]});
        let hit = PolicyEngine::danger_pattern_risk("delete_files", &args);
        assert_eq!(hit.map(|(r, _)| r), Some(RiskLevel::High));
    }

    #[test]
    fn danger_patterns_ignore_benign_actions() {
        let args = json!({"path": "/tmp/notes.txt"});
        assert!(PolicyEngine::danger_pattern_risk("list_files", &args).is_none());
    }
}
