//! ReAct engine
//!
//! One turn: preprocess the request, ask the reasoner for an instruction,
//! validate it, gate it through the safety pipeline, execute it, feed the
//! observation back, repeat until the task completes or a budget runs out.
//! Anything needing human consent suspends the session into the checkpoint
//! store and unwinds to the caller with a `Pending` result; `resume` picks
//! the turn back up with the verdict.
//!
//! Sessions are independent: each run has its own state and budgets, and
//! the only shared structures (registry, checkpoint store, memory, audit)
//! synchronize internally.

pub mod error_help;
pub mod preprocess;
pub mod prompt;
pub mod safety;
pub mod state;
pub mod validate;

use crate::audit::{AuditLog, AuditRecord};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::Config;
use crate::engine::preprocess::Preprocessor;
use crate::engine::prompt::PromptBuilder;
use crate::engine::safety::{args_hash, SafetyPipeline, SafetyVerdict};
use crate::engine::state::{ConversationEntry, EngineError, Mode, ReactState};
use crate::engine::validate::validate_instruction;
use crate::environment::EnvironmentContext;
use crate::llm::{LlmClient, LlmOutcome, ProposalRequest};
use crate::memory::MemoryStore;
use crate::policy::{rules::RuleSet, PolicyEngine, RiskLevel};
use crate::worker::{Instruction, WorkerRegistry, WorkerResult};
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of `run`/`resume`: either a finished turn or a suspension
/// waiting for approval.
#[derive(Debug, Clone)]
pub enum RunResult {
    Done {
        final_message: String,
        /// Set when the turn terminated on a fatal condition; embedders map
        /// this to exit codes.
        error: Option<EngineError>,
    },
    Pending {
        risk: RiskLevel,
        preview: Instruction,
    },
}

impl RunResult {
    pub fn final_message(&self) -> &str {
        match self {
            RunResult::Done { final_message, .. } => final_message,
            RunResult::Pending { .. } => "",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RunResult::Pending { .. })
    }
}

/// One queued execution step inside a turn.
struct Step {
    instruction: Instruction,
    risk: RiskLevel,
    human_approved: bool,
    is_final: bool,
}

pub struct Engine {
    config: Config,
    env: EnvironmentContext,
    workers: WorkerRegistry,
    llm: Arc<dyn LlmClient>,
    safety: SafetyPipeline,
    preprocessor: Preprocessor,
    prompts: PromptBuilder,
    checkpoints: Arc<dyn CheckpointStore>,
    memory: Arc<MemoryStore>,
    audit: Arc<AuditLog>,
    cancellations: DashMap<String, Arc<AtomicBool>>,
    permission_error: Regex,
}

impl Engine {
    /// Build an engine with file-backed stores under the configured base
    /// directory.
    pub fn new(
        config: Config,
        workers: WorkerRegistry,
        llm: Arc<dyn LlmClient>,
        env: EnvironmentContext,
    ) -> Result<Self> {
        let paths = config.paths();
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::new(paths.checkpoints_dir()));
        let memory = Arc::new(MemoryStore::new(
            paths.memory_file(),
            config.memory.capacity,
            config.memory.save_debounce_ms,
        ));
        let audit = Arc::new(AuditLog::new(paths.audit_log()));
        Self::with_components(config, workers, llm, env, checkpoints, memory, audit)
    }

    /// Full-control constructor; used by embedders and tests that swap
    /// stores.
    pub fn with_components(
        config: Config,
        workers: WorkerRegistry,
        llm: Arc<dyn LlmClient>,
        env: EnvironmentContext,
        checkpoints: Arc<dyn CheckpointStore>,
        memory: Arc<MemoryStore>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        let rules = match &config.safety.rules_file {
            Some(path) => RuleSet::load_from_path(path)
                .with_context(|| format!("failed to load rules from {}", path.display()))?,
            None => RuleSet::builtin(),
        };
        let policy = PolicyEngine::new(rules, config.safety.risk_analyzer_enabled);
        let safety = SafetyPipeline::new(policy, config.safety.clone());
        let prompts = PromptBuilder::new(env.clone());

        Ok(Self {
            config,
            env,
            workers,
            llm,
            safety,
            preprocessor: Preprocessor::new(),
            prompts,
            checkpoints,
            memory,
            audit,
            cancellations: DashMap::new(),
            permission_error: Regex::new(
                r"(?i)permission denied|operation not permitted|requires? root|must be run as root|access denied|EACCES|insufficient permissions?",
            )
            .expect("static regex"),
        })
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }

    pub fn environment(&self) -> &EnvironmentContext {
        &self.env
    }

    /// Request cooperative cancellation of a session. Observed at every
    /// suspension point of an in-flight turn; setting it before the turn
    /// starts cancels the turn at its first check.
    pub fn cancel(&self, session_id: &str) {
        self.cancel_flag(session_id).store(true, Ordering::SeqCst);
    }

    fn cancel_flag(&self, session_id: &str) -> Arc<AtomicBool> {
        self.cancellations
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Start (or re-query) a turn for this session.
    pub async fn run(&self, session_id: &str, user_input: &str, mode: Mode) -> Result<RunResult> {
        // A session with a pending suspension stays pending until resumed.
        if let Some(state) = self.checkpoints.load(session_id).await? {
            if state.awaiting_approval {
                if let (Some(preview), Some(risk)) =
                    (state.pending_instruction.clone(), state.pending_risk)
                {
                    return Ok(RunResult::Pending { risk, preview });
                }
            }
        }

        let state = ReactState::new(
            session_id,
            user_input,
            mode,
            self.config.engine.max_iterations,
        )
        .with_history_capacity(self.config.engine.history_capacity);

        self.drive(state, None).await
    }

    /// Resume a suspended session with the human verdict. The checkpoint is
    /// consumed either way; a later re-suspension writes a fresh one.
    pub async fn resume(&self, session_id: &str, approval_granted: bool) -> Result<RunResult> {
        let Some(mut state) = self.checkpoints.load(session_id).await? else {
            bail!("session {session_id} has no pending approval");
        };
        self.checkpoints.delete(session_id).await?;

        if !state.awaiting_approval {
            bail!("session {session_id} is not awaiting approval");
        }
        let Some((instruction, risk)) = state.clear_suspension() else {
            bail!("checkpoint for {session_id} is missing its pending instruction");
        };

        if !approval_granted {
            self.audit
                .record(AuditRecord {
                    user_input: state.user_input.clone(),
                    worker: instruction.worker.clone(),
                    action: instruction.action.clone(),
                    risk,
                    confirmed: "no",
                    exit_code: -1,
                    output: "rejected by user".to_string(),
                })
                .await
                .ok();
            return Ok(RunResult::Done {
                final_message: "Operation cancelled".to_string(),
                error: None,
            });
        }

        let step = Step {
            instruction,
            risk,
            human_approved: true,
            is_final: false,
        };
        self.drive(state, Some(step)).await
    }

    /// The loop. `pending` carries an already-approved step from `resume`.
    async fn drive(&self, mut state: ReactState, pending: Option<Step>) -> Result<RunResult> {
        let cancel = self.cancel_flag(&state.session_id);
        let deadline =
            Instant::now() + Duration::from_secs(self.config.engine.turn_timeout_secs);
        let mut dry_runs_seen: HashSet<u64> = HashSet::new();
        let mut next_step = pending;
        let tool_schemas = self.workers.tool_schemas();

        let outcome = loop {
            if cancel.load(Ordering::SeqCst) {
                self.checkpoints.delete(&state.session_id).await.ok();
                state.error = Some(EngineError::Cancelled);
                break RunResult::Done {
                    final_message: "Operation cancelled".to_string(),
                    error: state.error.clone(),
                };
            }
            if Instant::now() >= deadline {
                let message = self.budget_summary(&state, "the time budget ran out").await;
                break RunResult::Done {
                    final_message: message,
                    error: None,
                };
            }

            let step = match next_step.take() {
                Some(step) => step,
                None => match self.reason_step(&mut state, &tool_schemas, &dry_runs_seen).await? {
                    ReasonOutcome::Step(step) => step,
                    ReasonOutcome::Retry => continue,
                    ReasonOutcome::Finished(result) => break result,
                },
            };

            // Cancellation between the gate's allow and dispatch aborts the
            // step before any side effect.
            if cancel.load(Ordering::SeqCst) {
                continue;
            }

            match self.execute_step(&mut state, step, &mut dry_runs_seen).await {
                StepOutcome::Continue => continue,
                StepOutcome::Finished(result) => break result,
            }
        };

        self.cancellations.remove(&state.session_id);
        Ok(outcome)
    }

    async fn reason_step(
        &self,
        state: &mut ReactState,
        tool_schemas: &[Value],
        dry_runs_seen: &HashSet<u64>,
    ) -> Result<ReasonOutcome> {
        if state.iteration >= state.max_iterations {
            let message = self.budget_summary(state, "the step budget ran out").await;
            return Ok(ReasonOutcome::Finished(RunResult::Done {
                final_message: message,
                error: None,
            }));
        }
        state.iteration += 1;
        if state.iteration == state.max_iterations {
            state.force_summarize = true;
        }

        let preprocessed = self.preprocessor.preprocess(&state.user_input, &state.history);
        let memory_block = self.memory.context_block(&state.user_input, 8).await;
        let system_prompt = self.prompts.build_system_prompt(&self.workers);
        let user_prompt = self.prompts.build_user_prompt(
            &state.user_input,
            &preprocessed,
            &state.history,
            &memory_block,
            state.force_summarize,
        );

        let proposal = self
            .llm
            .propose(ProposalRequest {
                system_prompt: &system_prompt,
                user_prompt: &user_prompt,
                tool_schemas,
            })
            .await;

        let (mut instruction, is_final) = match proposal {
            Err(err) => {
                let error = EngineError::LlmTransport {
                    reason: format!("{err:#}"),
                };
                let message = error.message();
                state.error = Some(error.clone());
                return Ok(ReasonOutcome::Finished(RunResult::Done {
                    final_message: message,
                    error: Some(error),
                }));
            }
            Ok(LlmOutcome::Unparseable { detail }) => {
                tracing::warn!(session = %state.session_id, detail = %detail, "unparseable model output");
                self.observe_synthetic(
                    state,
                    &format!("could not parse your last response: {detail}. Return only the JSON object described in the output format."),
                );
                return Ok(ReasonOutcome::Retry);
            }
            Ok(LlmOutcome::Proposal { instruction, is_final }) => (instruction, is_final),
        };

        if let Err(reason) = validate_instruction(&instruction, &self.workers) {
            tracing::debug!(session = %state.session_id, reason = %reason, "invalid instruction");
            self.observe_synthetic(state, &format!("instruction invalid: {reason}"));
            return Ok(ReasonOutcome::Retry);
        }

        if self.config.safety.dry_run_by_default {
            instruction.dry_run = true;
        }

        match self
            .safety
            .assess(&instruction, state.mode, &self.workers, dry_runs_seen)
        {
            SafetyVerdict::Reject { reason } => {
                tracing::info!(session = %state.session_id, reason = %reason, "safety reject");
                let error = EngineError::SafetyReject {
                    reason: reason.clone(),
                };
                state.error = Some(error.clone());
                Ok(ReasonOutcome::Finished(RunResult::Done {
                    final_message: error.message(),
                    error: Some(error),
                }))
            }
            SafetyVerdict::NeedsApproval { risk, reason } => {
                tracing::info!(
                    session = %state.session_id,
                    risk = %risk,
                    reason = %reason,
                    "suspending for approval"
                );
                state.suspend_for_approval(instruction.clone(), risk);
                self.checkpoints.save(&state.session_id, state).await?;
                Ok(ReasonOutcome::Finished(RunResult::Pending {
                    risk,
                    preview: instruction,
                }))
            }
            SafetyVerdict::Allow { risk } => Ok(ReasonOutcome::Step(Step {
                instruction,
                risk,
                human_approved: false,
                is_final,
            })),
        }
    }

    async fn execute_step(
        &self,
        state: &mut ReactState,
        step: Step,
        dry_runs_seen: &mut HashSet<u64>,
    ) -> StepOutcome {
        let Step {
            instruction,
            risk,
            human_approved,
            is_final,
        } = step;

        let result = match self.workers.get(&instruction.worker) {
            Some(worker) => worker
                .execute(&instruction.action, &instruction.args, instruction.dry_run)
                .await
                .unwrap_or_else(|err| WorkerResult::failure(format!("worker error: {err:#}"))),
            None => WorkerResult::failure(format!("unknown worker: {}", instruction.worker)),
        };

        if instruction.dry_run && risk == RiskLevel::High {
            dry_runs_seen.insert(args_hash(&instruction));
        }

        // Dry runs never reach the audit trail.
        if !result.simulated && !instruction.dry_run {
            self.audit
                .record(AuditRecord {
                    user_input: state.user_input.clone(),
                    worker: instruction.worker.clone(),
                    action: instruction.action.clone(),
                    risk,
                    confirmed: if human_approved { "yes" } else { "auto" },
                    exit_code: if result.success { 0 } else { 1 },
                    output: result.message.clone(),
                })
                .await
                .ok();
        }

        let success = result.success;
        let task_completed = result.task_completed;
        let message = result.message.clone();
        let command = instruction.arg_str("command").map(str::to_string);
        state.push_history(ConversationEntry::new(instruction, result));

        if task_completed || is_final {
            state.task_completed = true;
            state.final_message = message.clone();
            return StepOutcome::Finished(RunResult::Done {
                final_message: message,
                error: None,
            });
        }

        if !success {
            // A permission error will fail identically under retry; hand the
            // user a sudo command instead of burning iterations.
            if self.permission_error.is_match(&message) {
                if let Some(command) = command {
                    let sudo_command = if command.trim_start().starts_with("sudo ") {
                        command.trim().to_string()
                    } else {
                        format!("sudo {}", command.trim())
                    };
                    let mut final_message = format!(
                        "Insufficient permissions to do this automatically. Run it yourself:\n\n  \
                         {sudo_command}\n\nOriginal error: {message}"
                    );
                    if let Some(suggestion) = error_help::suggest_fix(&message) {
                        final_message.push_str("\n\n");
                        final_message.push_str(&suggestion);
                    }
                    state.task_completed = true;
                    state.final_message = final_message.clone();
                    return StepOutcome::Finished(RunResult::Done {
                        final_message,
                        error: None,
                    });
                }
            }

            if state.error_recovery_count < self.config.engine.max_error_recoveries
                && state.iteration < state.max_iterations
            {
                state.error_recovery_count += 1;
                tracing::debug!(
                    session = %state.session_id,
                    attempt = state.error_recovery_count,
                    "command failed, letting the model try an alternative"
                );
                return StepOutcome::Continue;
            }

            let mut final_message = message;
            if let Some(suggestion) = error_help::suggest_fix(&final_message) {
                final_message.push_str("\n\n");
                final_message.push_str(&suggestion);
            }
            return StepOutcome::Finished(RunResult::Done {
                final_message,
                error: None,
            });
        }

        StepOutcome::Continue
    }

    /// Feed a synthetic observation back to the model as if a worker had
    /// reported it. Counts as the iteration that produced it.
    fn observe_synthetic(&self, state: &mut ReactState, message: &str) {
        let instruction = Instruction::new("engine", "observation", serde_json::json!({}));
        let result = WorkerResult::failure(message.to_string());
        state.push_history(ConversationEntry::new(instruction, result));
    }

    /// Final message when an iteration or time budget runs out: ask the
    /// model for a summary of the evidence, fall back to a static digest.
    async fn budget_summary(&self, state: &ReactState, why: &str) -> String {
        let findings: Vec<String> = state
            .history
            .iter()
            .map(|e| {
                format!(
                    "- {}: {}",
                    e.instruction.qualified_action(),
                    e.result.message
                )
            })
            .collect();
        let findings = if findings.is_empty() {
            "(no steps executed)".to_string()
        } else {
            findings.join("\n")
        };

        let prompt = format!(
            "You were diagnosing this request but {why}:\n{}\n\nSteps taken so far:\n{findings}\n\n\
             Based only on the evidence above, give a final summary in the user's language: \
             confirmed facts, problems found, likely causes, and the recommended next step. \
             Plain text, no JSON.",
            state.user_input
        );

        match self
            .llm
            .generate_text(
                "You are an ops diagnosis assistant. Summarize collected evidence concisely.",
                &prompt,
            )
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => {
                format!("{}\n\n(Task incomplete: {why}.)", summary.trim())
            }
            _ => {
                let last = state
                    .history
                    .last()
                    .map(|e| e.result.message.clone())
                    .unwrap_or_default();
                let mut message = format!("Task incomplete: {why}.\n\nLast result: {last}");
                if let Some(suggestion) = error_help::suggest_fix(&last) {
                    message.push_str("\n\n");
                    message.push_str(&suggestion);
                }
                message
            }
        }
    }
}

enum ReasonOutcome {
    Step(Step),
    Retry,
    Finished(RunResult),
}

enum StepOutcome {
    Continue,
    Finished(RunResult),
}
