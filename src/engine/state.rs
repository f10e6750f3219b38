//! Session state
//!
//! [`ReactState`] is everything one turn needs to suspend and resume: it is
//! written to the checkpoint store when an instruction waits for approval
//! and read back by `resume`. Conversation history lives inside it as a
//! bounded ring with head+tail truncation for large command outputs.

use crate::policy::RiskLevel;
use crate::worker::{Instruction, WorkerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TRUNCATE_HEAD: usize = 2000;
pub const TRUNCATE_TAIL: usize = 2000;
pub const MAX_OUTPUT_LENGTH: usize = TRUNCATE_HEAD + TRUNCATE_TAIL;

/// Invocation mode; decides which risk cap applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Cli,
    Tui,
}

/// Machine-readable error classification carried in the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineError {
    InvalidInstruction { reason: String },
    SafetyReject { reason: String },
    WorkerFailure { reason: String },
    LlmTransport { reason: String },
    Cancelled,
    ParseError { reason: String },
}

impl EngineError {
    pub fn message(&self) -> String {
        match self {
            EngineError::InvalidInstruction { reason } => format!("invalid instruction: {reason}"),
            EngineError::SafetyReject { reason } => format!("operation not permitted: {reason}"),
            EngineError::WorkerFailure { reason } => reason.clone(),
            EngineError::LlmTransport { reason } => format!("language model unavailable: {reason}"),
            EngineError::Cancelled => "operation cancelled".to_string(),
            EngineError::ParseError { reason } => format!("could not parse model output: {reason}"),
        }
    }
}

/// One (instruction, result) pair in the per-session ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub instruction: Instruction,
    pub result: WorkerResult,
    pub timestamp: DateTime<Utc>,
    /// Set when the stored `raw_output` was cut down to head+tail.
    #[serde(default)]
    pub truncated: bool,
}

impl ConversationEntry {
    /// Store a result, truncating oversized raw output to head and tail
    /// halves joined by an ellipsis marker.
    pub fn new(instruction: Instruction, mut result: WorkerResult) -> Self {
        let mut truncated = false;
        if let Some(raw) = result.raw_output.take() {
            let (stored, was_truncated) = truncate_output(&raw);
            result.raw_output = Some(stored);
            truncated = was_truncated;
        }
        Self {
            instruction,
            result,
            timestamp: Utc::now(),
            truncated,
        }
    }
}

/// Head+tail truncation. Character-based so multi-byte output cannot split
/// a code point.
pub fn truncate_output(output: &str) -> (String, bool) {
    let chars: Vec<char> = output.chars().collect();
    if chars.len() <= MAX_OUTPUT_LENGTH {
        return (output.to_string(), false);
    }
    let head: String = chars[..TRUNCATE_HEAD].iter().collect();
    let tail: String = chars[chars.len() - TRUNCATE_TAIL..].iter().collect();
    let omitted = chars.len() - TRUNCATE_HEAD - TRUNCATE_TAIL;
    (
        format!("{head}\n\n... [truncated {omitted} characters] ...\n\n{tail}"),
        true,
    )
}

/// Checkpointable state of one session turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactState {
    pub session_id: String,
    pub user_input: String,
    pub mode: Mode,
    #[serde(default)]
    pub history: Vec<ConversationEntry>,
    pub iteration: u32,
    pub max_iterations: u32,

    #[serde(default)]
    pub pending_instruction: Option<Instruction>,
    #[serde(default)]
    pub pending_risk: Option<RiskLevel>,
    #[serde(default)]
    pub awaiting_approval: bool,
    #[serde(default)]
    pub approval_granted: Option<bool>,

    #[serde(default)]
    pub task_completed: bool,
    #[serde(default)]
    pub final_message: String,
    #[serde(default)]
    pub error: Option<EngineError>,

    /// Recovery iterations already spent on failed commands this turn.
    #[serde(default)]
    pub error_recovery_count: u32,
    /// The next reasoning step must produce a summary.
    #[serde(default)]
    pub force_summarize: bool,

    #[serde(skip)]
    history_capacity: usize,
}

impl ReactState {
    pub fn new(session_id: &str, user_input: &str, mode: Mode, max_iterations: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_input: user_input.to_string(),
            mode,
            history: Vec::new(),
            iteration: 0,
            max_iterations,
            pending_instruction: None,
            pending_risk: None,
            awaiting_approval: false,
            approval_granted: None,
            task_completed: false,
            final_message: String::new(),
            error: None,
            error_recovery_count: 0,
            force_summarize: false,
            history_capacity: 20,
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn push_history(&mut self, entry: ConversationEntry) {
        let capacity = if self.history_capacity == 0 {
            20
        } else {
            self.history_capacity
        };
        self.history.push(entry);
        while self.history.len() > capacity {
            self.history.remove(0);
        }
    }

    /// Mark the pending instruction as suspended for approval.
    pub fn suspend_for_approval(&mut self, instruction: Instruction, risk: RiskLevel) {
        self.pending_instruction = Some(instruction);
        self.pending_risk = Some(risk);
        self.awaiting_approval = true;
        self.approval_granted = None;
    }

    /// Clear the suspension bookkeeping after a resume.
    pub fn clear_suspension(&mut self) -> Option<(Instruction, RiskLevel)> {
        self.awaiting_approval = false;
        self.approval_granted = None;
        let instruction = self.pending_instruction.take()?;
        let risk = self.pending_risk.take().unwrap_or(RiskLevel::High);
        Some((instruction, risk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(raw: Option<String>) -> ConversationEntry {
        let instruction = Instruction::new("shell", "execute_command", json!({"command": "ls"}));
        let result = WorkerResult {
            raw_output: raw,
            ..WorkerResult::ok("done")
        };
        ConversationEntry::new(instruction, result)
    }

    #[test]
    fn short_output_stored_verbatim() {
        let e = entry(Some("hello".to_string()));
        assert_eq!(e.result.raw_output.as_deref(), Some("hello"));
        assert!(!e.truncated);
    }

    #[test]
    fn long_output_keeps_exact_head_and_tail() {
        let original: String = ('a'..='z').cycle().take(10_000).collect();
        let e = entry(Some(original.clone()));
        assert!(e.truncated);

        let stored = e.result.raw_output.unwrap();
        let original_chars: Vec<char> = original.chars().collect();
        let expected_head: String = original_chars[..TRUNCATE_HEAD].iter().collect();
        let expected_tail: String =
            original_chars[original_chars.len() - TRUNCATE_TAIL..].iter().collect();
        assert!(stored.starts_with(&expected_head));
        assert!(stored.ends_with(&expected_tail));
        assert!(stored.contains("truncated"));
    }

    #[test]
    fn truncated_length_is_bounded() {
        let original = "x".repeat(50_000);
        let (stored, truncated) = truncate_output(&original);
        assert!(truncated);
        // Head + tail + a short marker line.
        assert!(stored.chars().count() <= MAX_OUTPUT_LENGTH + 64);
    }

    #[test]
    fn history_ring_caps_entries() {
        let mut state = ReactState::new("s1", "check disk", Mode::Tui, 8).with_history_capacity(3);
        for _ in 0..5 {
            state.push_history(entry(None));
        }
        assert_eq!(state.history.len(), 3);
    }

    #[test]
    fn suspension_round_trip() {
        let mut state = ReactState::new("s1", "deploy", Mode::Tui, 8);
        let instruction = Instruction::new("system", "write_file", json!({"path": ".env"}));
        state.suspend_for_approval(instruction.clone(), RiskLevel::Medium);
        assert!(state.awaiting_approval);

        let (restored, risk) = state.clear_suspension().unwrap();
        assert_eq!(restored, instruction);
        assert_eq!(risk, RiskLevel::Medium);
        assert!(!state.awaiting_approval);
    }

    #[test]
    fn state_serde_round_trip() {
        let mut state = ReactState::new("s9", "部署服务", Mode::Tui, 8);
        state.suspend_for_approval(
            Instruction::new("system", "write_file", json!({"path": ".env", "content": "A=1"})),
            RiskLevel::Medium,
        );
        let raw = serde_json::to_string(&state).unwrap();
        let back: ReactState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.session_id, "s9");
        assert!(back.awaiting_approval);
        assert_eq!(back.pending_risk, Some(RiskLevel::Medium));
    }
}
