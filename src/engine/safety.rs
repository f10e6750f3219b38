//! Safety pipeline
//!
//! Decides, for one validated instruction, whether to run it, suspend for
//! human approval, or refuse. Shell commands go through the policy engine
//! (whitelist then risk analyzer); everything else starts from the action's
//! declared risk hint, lifted by dangerous-pattern scanning. The
//! instruction's self-declared risk can only raise the result, never lower
//! it.

use crate::config::SafetyConfig;
use crate::engine::state::Mode;
use crate::policy::{PolicyDecision, PolicyEngine, RiskLevel};
use crate::worker::{Instruction, WorkerRegistry};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Allow {
        risk: RiskLevel,
    },
    NeedsApproval {
        risk: RiskLevel,
        reason: String,
    },
    Reject {
        reason: String,
    },
}

pub struct SafetyPipeline {
    policy: PolicyEngine,
    config: SafetyConfig,
}

impl SafetyPipeline {
    pub fn new(policy: PolicyEngine, config: SafetyConfig) -> Self {
        Self { policy, config }
    }

    /// Assess one instruction. `dry_runs_seen` holds arg-hashes of high-risk
    /// instructions already dry-run this turn.
    pub fn assess(
        &self,
        instruction: &Instruction,
        mode: Mode,
        registry: &WorkerRegistry,
        dry_runs_seen: &HashSet<u64>,
    ) -> SafetyVerdict {
        let (base_risk, reason) = match self.base_risk(instruction, registry) {
            Ok(pair) => pair,
            Err(reason) => return SafetyVerdict::Reject { reason },
        };

        // The model may over-declare risk; believe it. Under-declarations
        // are overridden by the analysis above.
        let risk = base_risk.max(instruction.risk_level);

        let cap = match mode {
            Mode::Cli => self.config.cli_max_risk,
            Mode::Tui => self.config.tui_max_risk,
        };
        if risk > cap {
            return SafetyVerdict::Reject {
                reason: format!("risk level {risk} exceeds the configured maximum {cap}"),
            };
        }

        if risk == RiskLevel::High
            && self.config.require_dry_run_for_high_risk
            && !instruction.dry_run
            && !dry_runs_seen.contains(&args_hash(instruction))
        {
            return SafetyVerdict::Reject {
                reason: "high-risk instruction must be executed as a dry run first".to_string(),
            };
        }

        // Dry runs have no irreversible effect, so they never need approval.
        if instruction.dry_run {
            return SafetyVerdict::Allow { risk };
        }

        if risk > RiskLevel::Safe || !self.config.auto_approve_safe {
            return SafetyVerdict::NeedsApproval {
                risk,
                reason,
            };
        }

        SafetyVerdict::Allow { risk }
    }

    fn base_risk(
        &self,
        instruction: &Instruction,
        registry: &WorkerRegistry,
    ) -> Result<(RiskLevel, String), String> {
        if instruction.worker == "shell" && instruction.action == "execute_command" {
            let command = instruction
                .arg_str("command")
                .ok_or_else(|| "shell.execute_command without a command".to_string())?;
            return match self.policy.check_command(command) {
                PolicyDecision::Allowed { risk, reason, .. } => Ok((risk, reason)),
                PolicyDecision::Denied { reason, .. } => Err(reason),
                PolicyDecision::Unmatched => {
                    Err("command could not be classified".to_string())
                }
            };
        }

        // Chat output has no side effects; scanning answer text for command
        // patterns would gate harmless summaries that merely mention them.
        if instruction.worker == "chat" {
            return Ok((RiskLevel::Safe, "chat output".to_string()));
        }

        let hint = registry
            .find_action(&instruction.worker, &instruction.action)
            .map(|a| a.risk_hint)
            .unwrap_or(RiskLevel::Medium);

        let args_value = Value::Object(instruction.args.clone());
        let (pattern_risk, reason) =
            match PolicyEngine::danger_pattern_risk(&instruction.action, &args_value) {
                Some((risk, reason)) => (risk, reason),
                None => (RiskLevel::Safe, "no dangerous pattern found".to_string()),
            };

        Ok((hint.max(pattern_risk), reason))
    }
}

/// Stable per-turn identity of an instruction: worker, action and
/// canonically-serialized args. Used to match a dry run with the real run.
pub fn args_hash(instruction: &Instruction) -> u64 {
    let mut hasher = DefaultHasher::new();
    instruction.worker.hash(&mut hasher);
    instruction.action.hash(&mut hasher);
    // serde_json::Map preserves insertion order; serialize sorted for a
    // canonical form.
    let mut keys: Vec<&String> = instruction.args.keys().collect();
    keys.sort();
    for key in keys {
        key.hash(&mut hasher);
        instruction.args[key.as_str()].to_string().hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::chat::ChatWorker;
    use crate::worker::shell::ShellWorker;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(ChatWorker));
        registry.register(Arc::new(ShellWorker::new()));
        registry
    }

    fn pipeline(config: SafetyConfig) -> SafetyPipeline {
        SafetyPipeline::new(PolicyEngine::with_builtin_rules(), config)
    }

    fn shell(command: &str) -> Instruction {
        Instruction::new("shell", "execute_command", json!({"command": command}))
    }

    #[test]
    fn safe_command_allowed_in_tui() {
        let verdict = pipeline(SafetyConfig::default()).assess(
            &shell("ls -la"),
            Mode::Tui,
            &registry(),
            &HashSet::new(),
        );
        assert_eq!(verdict, SafetyVerdict::Allow { risk: RiskLevel::Safe });
    }

    #[test]
    fn root_wipe_rejected_before_any_worker_call() {
        let verdict = pipeline(SafetyConfig::default()).assess(
            &shell("rm -rf /"),
            Mode::Tui,
            &registry(),
            &HashSet::new(),
        );
        match verdict {
            SafetyVerdict::Reject { reason } => {
                assert!(reason.contains("-rf"), "reason: {reason}");
                assert!(reason.contains('/'), "reason: {reason}");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn medium_needs_approval_in_tui() {
        let verdict = pipeline(SafetyConfig::default()).assess(
            &shell("docker restart nginx"),
            Mode::Tui,
            &registry(),
            &HashSet::new(),
        );
        assert!(matches!(
            verdict,
            SafetyVerdict::NeedsApproval { risk: RiskLevel::Medium, .. }
        ));
    }

    #[test]
    fn medium_exceeds_cli_cap() {
        let verdict = pipeline(SafetyConfig::default()).assess(
            &shell("docker restart nginx"),
            Mode::Cli,
            &registry(),
            &HashSet::new(),
        );
        match verdict {
            SafetyVerdict::Reject { reason } => assert!(reason.contains("exceeds")),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn self_declared_risk_only_raises() {
        let mut instruction = shell("ls -la");
        instruction.risk_level = RiskLevel::Medium;
        let verdict = pipeline(SafetyConfig::default()).assess(
            &instruction,
            Mode::Tui,
            &registry(),
            &HashSet::new(),
        );
        assert!(matches!(verdict, SafetyVerdict::NeedsApproval { risk: RiskLevel::Medium, .. }));
    }

    #[test]
    fn high_risk_requires_dry_run_first() {
        let verdict = pipeline(SafetyConfig::default()).assess(
            &shell("docker rm old-container"),
            Mode::Tui,
            &registry(),
            &HashSet::new(),
        );
        match verdict {
            SafetyVerdict::Reject { reason } => assert!(reason.contains("dry run")),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn high_risk_passes_after_matching_dry_run() {
        let instruction = shell("docker rm old-container");
        let mut seen = HashSet::new();
        seen.insert(args_hash(&instruction));

        let verdict = pipeline(SafetyConfig::default()).assess(
            &instruction,
            Mode::Tui,
            &registry(),
            &seen,
        );
        assert!(matches!(
            verdict,
            SafetyVerdict::NeedsApproval { risk: RiskLevel::High, .. }
        ));
    }

    #[test]
    fn dry_run_instruction_is_allowed_without_approval() {
        let mut instruction = shell("docker rm old-container");
        instruction.dry_run = true;
        let verdict = pipeline(SafetyConfig::default()).assess(
            &instruction,
            Mode::Tui,
            &registry(),
            &HashSet::new(),
        );
        assert_eq!(verdict, SafetyVerdict::Allow { risk: RiskLevel::High });
    }

    #[test]
    fn auto_approve_off_gates_even_safe_ops() {
        let config = SafetyConfig {
            auto_approve_safe: false,
            ..Default::default()
        };
        let verdict =
            pipeline(config).assess(&shell("ls"), Mode::Tui, &registry(), &HashSet::new());
        assert!(matches!(verdict, SafetyVerdict::NeedsApproval { .. }));
    }

    #[test]
    fn analyzer_disabled_rejects_unknown_commands() {
        let config = SafetyConfig {
            risk_analyzer_enabled: false,
            ..Default::default()
        };
        let policy = PolicyEngine::new(crate::policy::rules::RuleSet::builtin(), false);
        let pipeline = SafetyPipeline::new(policy, config);
        let verdict = pipeline.assess(
            &shell("terraform plan"),
            Mode::Tui,
            &registry(),
            &HashSet::new(),
        );
        assert!(matches!(verdict, SafetyVerdict::Reject { .. }));
    }

    #[test]
    fn args_hash_is_order_insensitive() {
        let a = Instruction::new("system", "write_file", json!({"path": "x", "content": "y"}));
        let b = Instruction::new("system", "write_file", json!({"content": "y", "path": "x"}));
        assert_eq!(args_hash(&a), args_hash(&b));
    }

    #[test]
    fn non_shell_uses_risk_hint_and_patterns() {
        let mut registry = WorkerRegistry::new();
        registry.register(Arc::new(ChatWorker));
        let instruction = Instruction::new("chat", "respond", json!({"message": "hello"}));
        let verdict = pipeline(SafetyConfig::default()).assess(
            &instruction,
            Mode::Cli,
            &registry,
            &HashSet::new(),
        );
        assert_eq!(verdict, SafetyVerdict::Allow { risk: RiskLevel::Safe });
    }
}
