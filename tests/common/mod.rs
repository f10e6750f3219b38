//! Shared test harness: a scripted LLM and an engine wired to a tempdir.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use opspilot::audit::AuditLog;
use opspilot::checkpoint::MemoryCheckpointStore;
use opspilot::config::Config;
use opspilot::engine::Engine;
use opspilot::environment::EnvironmentContext;
use opspilot::llm::{LlmClient, LlmOutcome, ProposalRequest};
use opspilot::memory::MemoryStore;
use opspilot::policy::RiskLevel;
use opspilot::worker::{Instruction, WorkerRegistry};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Plays back a scripted sequence of proposals and records every prompt it
/// was shown. An exhausted script behaves like a dead endpoint.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmOutcome>>,
    pub prompts: Mutex<Vec<(String, String)>>,
    summary: String,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmOutcome>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
            summary: "summary of findings".to_string(),
        }
    }

    pub async fn recorded_prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn propose(&self, request: ProposalRequest<'_>) -> Result<LlmOutcome> {
        self.prompts.lock().await.push((
            request.system_prompt.to_string(),
            request.user_prompt.to_string(),
        ));
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("connection refused (script exhausted)"))
    }

    async fn generate_text(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Ok(self.summary.clone())
    }
}

pub fn proposal(
    worker: &str,
    action: &str,
    args: serde_json::Value,
    risk: RiskLevel,
    is_final: bool,
) -> LlmOutcome {
    let mut instruction = Instruction::new(worker, action, args);
    instruction.risk_level = risk;
    LlmOutcome::Proposal {
        instruction,
        is_final,
    }
}

pub fn dry_run_proposal(
    worker: &str,
    action: &str,
    args: serde_json::Value,
    risk: RiskLevel,
) -> LlmOutcome {
    let mut instruction = Instruction::new(worker, action, args);
    instruction.risk_level = risk;
    instruction.dry_run = true;
    LlmOutcome::Proposal {
        instruction,
        is_final: false,
    }
}

pub fn final_chat(message: &str) -> LlmOutcome {
    proposal(
        "chat",
        "respond",
        serde_json::json!({ "message": message }),
        RiskLevel::Safe,
        true,
    )
}

pub fn test_config(base_dir: &Path) -> Config {
    Config {
        base_dir: Some(base_dir.to_path_buf()),
        ..Default::default()
    }
}

pub fn test_env(os: &str) -> EnvironmentContext {
    EnvironmentContext {
        os_type: os.to_string(),
        os_version: "test".to_string(),
        shell: "/bin/bash".to_string(),
        cwd: "/tmp".to_string(),
        user: "tester".to_string(),
        docker_available: false,
    }
}

/// Engine over the default worker set, scripted LLM, in-memory checkpoints
/// and tempdir-backed stores.
pub fn build_engine(
    config: Config,
    llm: Arc<ScriptedLlm>,
    env: EnvironmentContext,
) -> Engine {
    let paths = config.paths();
    let workers = WorkerRegistry::with_defaults(&paths);
    build_engine_with_workers(config, llm, env, workers)
}

pub fn build_engine_with_workers(
    config: Config,
    llm: Arc<ScriptedLlm>,
    env: EnvironmentContext,
    workers: WorkerRegistry,
) -> Engine {
    let paths = config.paths();
    let memory = Arc::new(MemoryStore::new(
        paths.memory_file(),
        config.memory.capacity,
        config.memory.save_debounce_ms,
    ));
    let audit = Arc::new(AuditLog::new(paths.audit_log()));
    Engine::with_components(
        config,
        workers,
        llm,
        env,
        Arc::new(MemoryCheckpointStore::new()),
        memory,
        audit,
    )
    .expect("engine construction")
}

pub async fn audit_contents(base_dir: &Path) -> String {
    tokio::fs::read_to_string(base_dir.join("audit.log"))
        .await
        .unwrap_or_default()
}
