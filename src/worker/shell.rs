//! Shell worker
//!
//! Executes commands through `bash -c` with stdin disabled and interactive
//! prompts forced off, so a command that wants a password fails fast
//! instead of hanging the loop. The worker re-checks the command policy as
//! a second gate even though the engine already did.

use super::{ActionDescriptor, ActionParam, ParamType, Worker, WorkerResult};
use crate::policy::{PolicyDecision, PolicyEngine};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Commands whose exit code 1 means "no matches", not failure. The last
/// pipe stage decides.
const EXIT1_OK_COMMANDS: &[&str] = &["grep", "egrep", "fgrep", "pgrep", "diff", "cmp"];

pub struct ShellWorker {
    policy: PolicyEngine,
    timeout_secs: u64,
}

impl ShellWorker {
    pub fn new() -> Self {
        Self {
            policy: PolicyEngine::with_builtin_rules(),
            timeout_secs: 120,
        }
    }

    pub fn with_timeout(timeout_secs: u64) -> Self {
        Self {
            policy: PolicyEngine::with_builtin_rules(),
            timeout_secs,
        }
    }

    fn is_exit1_ok(command: &str) -> bool {
        let last_stage = command.rsplit('|').next().unwrap_or(command).trim();
        let base = last_stage
            .split_whitespace()
            .find(|token| !token.contains('='))
            .map(|token| token.rsplit('/').next().unwrap_or(token))
            .unwrap_or("");
        EXIT1_OK_COMMANDS.contains(&base)
    }
}

impl Default for ShellWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for ShellWorker {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute whitelisted shell commands. The primary diagnostic tool for system \
         inspection, service checks, log viewing and network probing. Supports && chaining \
         and pipes into text-processing tools."
    }

    fn actions(&self) -> Vec<ActionDescriptor> {
        vec![ActionDescriptor::new(
            "execute_command",
            "Run a shell command (ls, ps, grep, docker, systemctl, ss, df, ...). \
             Chain related checks with &&; filter with | grep/awk/head.",
        )
        .with_params(vec![
            ActionParam::required("command", ParamType::String, "The shell command to execute"),
            ActionParam::optional(
                "working_dir",
                ParamType::String,
                "Working directory (optional)",
            ),
        ])
        .dry_runnable()]
    }

    async fn execute(
        &self,
        action: &str,
        args: &Map<String, Value>,
        dry_run: bool,
    ) -> Result<WorkerResult> {
        if action != "execute_command" {
            return Ok(WorkerResult::failure(format!("unknown action: {action}")));
        }
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return Ok(WorkerResult::failure("command must be a string"));
        };
        let working_dir = args.get("working_dir").and_then(Value::as_str);

        let decision = self.policy.check_command(command);
        let (risk, reason) = match &decision {
            PolicyDecision::Allowed { risk, reason, .. } => (*risk, reason.clone()),
            PolicyDecision::Denied { reason, .. } => {
                return Ok(WorkerResult::failure(format!("Command blocked: {reason}"))
                    .with_data(json!({"blocked": true, "command": command})));
            }
            PolicyDecision::Unmatched => {
                return Ok(WorkerResult::failure("Command blocked: unclassifiable"));
            }
        };

        if dry_run {
            return Ok(WorkerResult {
                success: true,
                message: format!("[DRY-RUN] Would execute: {command} [risk: {risk}]"),
                simulated: true,
                data: Some(json!({"command": command, "risk_level": risk, "reason": reason})),
                ..Default::default()
            });
        }

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("SUDO_ASKPASS", "/bin/false")
            .env("SSH_ASKPASS", "/bin/false");
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let output = match timeout(Duration::from_secs(self.timeout_secs), cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Ok(WorkerResult::failure(format!(
                    "Failed to execute command: {err}"
                )));
            }
            Err(_) => {
                return Ok(WorkerResult::failure(format!(
                    "Command timed out after {} seconds",
                    self.timeout_secs
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        let no_match = exit_code == 1 && Self::is_exit1_ok(command) && stderr.is_empty();
        let success = exit_code == 0 || no_match;

        let mut message_parts = vec![format!("Command: {command}")];
        if no_match && stdout.trim().is_empty() {
            message_parts.push("Output:\n(no matches found)".to_string());
        } else if !stdout.trim().is_empty() {
            message_parts.push(format!("Output:\n{}", stdout.trim()));
        }
        if !stderr.trim().is_empty() {
            message_parts.push(format!("Stderr:\n{}", stderr.trim()));
        }
        message_parts.push(format!("Exit code: {exit_code}"));

        Ok(WorkerResult {
            success,
            data: Some(json!({"command": command, "exit_code": exit_code})),
            message: message_parts.join("\n"),
            // Not final: the loop returns to the reasoner, which answers
            // through chat.respond.
            task_completed: false,
            simulated: false,
            raw_output: Some(stdout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: &str) -> Map<String, Value> {
        match json!({"command": command}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn runs_simple_command() {
        let result = ShellWorker::new()
            .execute("execute_command", &args("echo hello"), false)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.raw_output.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn blocks_denied_command() {
        let result = ShellWorker::new()
            .execute("execute_command", &args("rm -rf /"), false)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("Command blocked"));
    }

    #[tokio::test]
    async fn dry_run_simulates() {
        let result = ShellWorker::new()
            .execute("execute_command", &args("docker restart web"), true)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.simulated);
        assert!(result.message.starts_with("[DRY-RUN]"));
    }

    #[tokio::test]
    async fn grep_without_matches_is_success() {
        let result = ShellWorker::new()
            .execute(
                "execute_command",
                &args("echo haystack | grep needle_that_is_missing"),
                false,
            )
            .await
            .unwrap();
        assert!(result.success, "{}", result.message);
        assert!(result.message.contains("no matches found"));
    }

    #[tokio::test]
    async fn failing_command_reports_failure() {
        let result = ShellWorker::new()
            .execute("execute_command", &args("ls /definitely/not/a/path"), false)
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[test]
    fn exit1_ok_considers_last_pipe_stage() {
        assert!(ShellWorker::is_exit1_ok("ps aux | grep nginx"));
        assert!(ShellWorker::is_exit1_ok("grep foo file.txt"));
        assert!(!ShellWorker::is_exit1_ok("ls /missing"));
    }
}
