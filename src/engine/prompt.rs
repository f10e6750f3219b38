//! Prompt assembly
//!
//! Builds the system and user prompts for each reasoning step. The tool
//! catalog is generated from the live worker registry, never hardcoded, so
//! the model only ever sees actions that actually exist. Port mentions get
//! an emphatic banner because small models love substituting well-known
//! defaults for the port the user actually named.

use crate::engine::preprocess::PreprocessResult;
use crate::engine::state::ConversationEntry;
use crate::environment::EnvironmentContext;
use crate::worker::WorkerRegistry;
use regex::Regex;
use serde_json::Value;

pub struct PromptBuilder {
    env: EnvironmentContext,
    secret_key: Regex,
}

impl PromptBuilder {
    pub fn new(env: EnvironmentContext) -> Self {
        Self {
            env,
            secret_key: Regex::new(r"(?i)api[_-]?key|token|password|secret").unwrap(),
        }
    }

    pub fn build_system_prompt(&self, registry: &WorkerRegistry) -> String {
        let env_context = self.env.to_prompt_context();
        let tool_catalog = self.tool_catalog(registry);
        let os_hints = self.os_hints();

        format!(
            "You are a senior ops engineer with deep Linux and container administration \
experience. You diagnose methodically: gather evidence first, never guess. Answer in the \
user's language (Chinese in, Chinese out).\n\n\
{env_context}\n\n\
## How you work (reason-act loop)\n\
Each turn you THINK, ACT with exactly one action, then OBSERVE the result, until you can \
deliver a complete answer. Finish with chat.respond; never use it for intermediate steps.\n\n\
## Core principles\n\
1. Evidence only: every claim must come from a command result.\n\
2. Outside-in: check the basics (installed? version? config valid?) before runtime state.\n\
3. Verify changes: after any destructive operation, run a follow-up check.\n\
4. Resolve references like \"this\" or \"它\" from the conversation history.\n\
5. NEVER invent default ports. If the user names a port, use that exact number; do not \
substitute 80, 443, 6379, 3306, 5432 or 27017.\n\
6. To generate a random secret, prefer `openssl rand -hex 32` over \
`python -c 'import secrets; ...'` (the latter needs a semicolon, which is blocked).\n\n\
## Shell rules\n\
- `&&` and `||` may chain commands; `2>/dev/null` and `2>&1` are fine.\n\
- Pipes are allowed into text tools only (grep, awk, sed, sort, uniq, wc, head, tail, \
cut, tr, jq, yq, column).\n\
- Blocked: `;`, `$()`, backticks, and `> file` redirects (use system.write_file instead). \
Exception: `echo ... > file` outside system directories is allowed for generating config \
files, including `$()` inside the echo.\n\n\
{os_hints}\n\
## Available tools\n\
{tool_catalog}\n\n\
## Risk levels\n\
- safe: read-only operations (ls, ps, cat, grep, docker ps)\n\
- medium: modifying operations (install, write, restart)\n\
- high: destructive operations (kill, rm, stop, docker rm)\n\n\
## Output format\n\
Return ONLY a valid JSON object:\n\
{{\"thinking\": \"brief reasoning\", \"action\": {{\"worker\": \"...\", \"action\": \"...\", \
\"args\": {{...}}, \"risk_level\": \"safe|medium|high\"}}, \"is_final\": false}}\n\
For the final answer (MUST use chat.respond):\n\
{{\"thinking\": \"summarize findings\", \"action\": {{\"worker\": \"chat\", \"action\": \
\"respond\", \"args\": {{\"message\": \"...\"}}, \"risk_level\": \"safe\"}}, \
\"is_final\": true}}\n\
is_final is true ONLY with chat.respond. No markdown, no extra text."
        )
    }

    pub fn build_user_prompt(
        &self,
        user_input: &str,
        preprocessed: &PreprocessResult,
        history: &[ConversationEntry],
        memory_block: &str,
        force_summarize: bool,
    ) -> String {
        let mut parts: Vec<String> = Vec::new();

        if !history.is_empty() {
            parts.push("Previous actions and results:".to_string());
            for entry in history {
                parts.push(format!(
                    "  Action: {} (args: {})",
                    entry.instruction.qualified_action(),
                    self.masked_args(&entry.instruction.args)
                ));
                if let Some(thinking) = &entry.instruction.thinking {
                    parts.push(format!("  Thinking: {thinking}"));
                }
                parts.push(format!("  Result: {}", entry.result.message));
                if let Some(raw) = &entry.result.raw_output {
                    let marker = if entry.truncated { " [OUTPUT TRUNCATED]" } else { "" };
                    parts.push(format!("  Output{marker}:\n```\n{raw}\n```"));
                }
            }
            parts.push(String::new());
        }

        if !memory_block.is_empty() {
            parts.push(memory_block.to_string());
            parts.push(String::new());
        }

        let effective_input = preprocessed
            .resolved_input
            .as_deref()
            .unwrap_or(user_input);
        parts.push(format!("User request: {effective_input}"));

        if let Some(repo) = &preprocessed.entities.repo_url {
            parts.push(format!("Repository mentioned by the user: {repo}"));
        }

        if !preprocessed.entities.ports.is_empty() {
            let ports = preprocessed.entities.ports.join(", ");
            parts.push(String::new());
            parts.push(format!("CRITICAL PORT INFO: the user mentioned port(s) {ports}."));
            parts.push(
                "Use these EXACT port numbers. Do NOT substitute service default ports."
                    .to_string(),
            );
        }

        if force_summarize {
            parts.push(String::new());
            parts.push(
                "The step budget is nearly exhausted. Summarize your findings NOW with \
chat.respond and is_final=true."
                    .to_string(),
            );
        }

        parts.join("\n")
    }

    /// Render args with secret-looking values masked.
    fn masked_args(&self, args: &serde_json::Map<String, Value>) -> String {
        let masked: serde_json::Map<String, Value> = args
            .iter()
            .map(|(k, v)| {
                if self.secret_key.is_match(k) {
                    (k.clone(), Value::String("<redacted>".to_string()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        Value::Object(masked).to_string()
    }

    fn tool_catalog(&self, registry: &WorkerRegistry) -> String {
        let mut sections = Vec::new();
        for name in registry.names() {
            let worker = match registry.get(name) {
                Some(w) => w,
                None => continue,
            };
            let mut lines = vec![format!("### {name}\n{}", worker.description())];
            for action in worker.actions() {
                let mut line = format!("- **{name}.{}**", action.name);
                if action.risk_hint != crate::policy::RiskLevel::Safe {
                    line.push_str(&format!(" [{}]", action.risk_hint));
                }
                line.push_str(&format!(": {}", action.description));
                if !action.params.is_empty() {
                    let params: Vec<String> = action
                        .params
                        .iter()
                        .map(|p| {
                            let opt = if p.required { "" } else { ", optional" };
                            format!(
                                "{}: {}{} - {}",
                                p.name,
                                p.param_type.json_schema_name(),
                                opt,
                                p.description
                            )
                        })
                        .collect();
                    line.push_str(&format!(" | Params: {}", params.join("; ")));
                }
                lines.push(line);
            }
            sections.push(lines.join("\n"));
        }
        sections.join("\n\n")
    }

    fn os_hints(&self) -> String {
        if self.env.is_macos() {
            "## OS-specific command hints\n\
             - Memory usage by process: `ps aux | sort -nrk 4 | head -n 11`\n\
             - Listening ports: `lsof -iTCP -sTCP:LISTEN -n -P`\n"
                .to_string()
        } else {
            "## OS-specific command hints\n\
             - Memory usage by process: `ps aux --sort=-%mem | head -n 11`\n\
             - Listening ports: `ss -tlnp`\n"
                .to_string()
        }
    }
}
