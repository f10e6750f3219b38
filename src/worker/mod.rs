//! Worker system
//!
//! Workers are the executable capabilities available to the engine. They
//! stay deliberately dumb: they execute one named action with JSON args and
//! report a [`WorkerResult`]; all reasoning and safety gating happens in the
//! engine. Each worker self-documents through [`ActionDescriptor`]s, which
//! feed both the prompt tool catalog and the function-calling schemas.

pub mod chat;
pub mod shell;
pub mod system;

use crate::policy::RiskLevel;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One step proposed by the reasoner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instruction {
    pub worker: String,
    pub action: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub dry_run: bool,
    /// Free-form model rationale. Never executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl Instruction {
    pub fn new(worker: &str, action: &str, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            worker: worker.to_string(),
            action: action.to_string(),
            args,
            risk_level: RiskLevel::Safe,
            dry_run: false,
            thinking: None,
        }
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    pub fn qualified_action(&self) -> String {
        format!("{}.{}", self.worker, self.action)
    }
}

/// Outcome of one worker action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub message: String,
    /// Signals the loop to terminate with `message` as the final answer.
    #[serde(default)]
    pub task_completed: bool,
    /// True iff the action honored `dry_run`.
    #[serde(default)]
    pub simulated: bool,
    /// Large command output, subject to the history truncation policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl WorkerResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn completed(mut self) -> Self {
        self.task_completed = true;
        self
    }
}

/// JSON-representable parameter types accepted in action schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Int,
    Bool,
    Array,
    Object,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Bool => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }

    pub fn json_schema_name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Int => "integer",
            ParamType::Bool => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionParam {
    pub name: String,
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl ActionParam {
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            required: false,
            description: description.to_string(),
        }
    }
}

/// One action a worker exposes, as shown to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ActionParam>,
    /// Baseline risk when no command-level analysis applies.
    #[serde(default)]
    pub risk_hint: RiskLevel,
    #[serde(default)]
    pub supports_dry_run: bool,
    /// When true, the validator accepts parameters beyond the declared set.
    #[serde(default)]
    pub open_schema: bool,
}

impl ActionDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: Vec::new(),
            risk_hint: RiskLevel::Safe,
            supports_dry_run: false,
            open_schema: false,
        }
    }

    pub fn with_params(mut self, params: Vec<ActionParam>) -> Self {
        self.params = params;
        self
    }

    pub fn risk_hint(mut self, risk: RiskLevel) -> Self {
        self.risk_hint = risk;
        self
    }

    pub fn dry_runnable(mut self) -> Self {
        self.supports_dry_run = true;
        self
    }

    /// OpenAI function-calling schema for this action, namespaced as
    /// `worker__action`.
    pub fn tool_schema(&self, worker_name: &str) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.param_type.json_schema_name(),
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "type": "function",
            "function": {
                "name": format!("{worker_name}__{}", self.name),
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                },
            },
        })
    }
}

/// A worker that can be driven by the engine.
///
/// When `dry_run` is true the worker must not perform irreversible side
/// effects and must set `simulated` on its result. Observation-only actions
/// may ignore the flag.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Unique identifier, referenced by `Instruction.worker`.
    fn name(&self) -> &str;

    /// One line, used in prompts.
    fn description(&self) -> &str;

    fn actions(&self) -> Vec<ActionDescriptor>;

    async fn execute(&self, action: &str, args: &Map<String, Value>, dry_run: bool)
        -> Result<WorkerResult>;
}

/// Registry of available workers. Built once at engine construction and
/// read-only afterwards.
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn find_action(&self, worker: &str, action: &str) -> Option<ActionDescriptor> {
        self.workers
            .get(worker)?
            .actions()
            .into_iter()
            .find(|a| a.name == action)
    }

    /// Tool-call schemas for every registered action.
    pub fn tool_schemas(&self) -> Vec<Value> {
        let mut schemas = Vec::new();
        for name in self.names() {
            if let Some(worker) = self.workers.get(name) {
                for action in worker.actions() {
                    schemas.push(action.tool_schema(name));
                }
            }
        }
        schemas
    }

    /// Registry pre-loaded with the built-in workers.
    pub fn with_defaults(engine_paths: &crate::config::Paths) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(chat::ChatWorker));
        registry.register(Arc::new(shell::ShellWorker::new()));
        registry.register(Arc::new(system::SystemWorker::new(
            crate::changes::ChangeTracker::new(engine_paths.changes_dir()),
        )));
        registry
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_schema_shape() {
        let action = ActionDescriptor::new("execute_command", "run a shell command")
            .with_params(vec![ActionParam::required(
                "command",
                ParamType::String,
                "the command",
            )]);
        let schema = action.tool_schema("shell");
        assert_eq!(
            schema["function"]["name"],
            Value::String("shell__execute_command".into())
        );
        assert_eq!(
            schema["function"]["parameters"]["required"][0],
            Value::String("command".into())
        );
    }

    #[test]
    fn param_type_matching() {
        assert!(ParamType::String.matches(&json!("x")));
        assert!(ParamType::Int.matches(&json!(3)));
        assert!(!ParamType::Int.matches(&json!("3")));
        assert!(ParamType::Array.matches(&json!([1, 2])));
        assert!(ParamType::Object.matches(&json!({"a": 1})));
    }
}
