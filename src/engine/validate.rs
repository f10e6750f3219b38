//! Instruction validation against the live worker registry
//!
//! Rejections carry a path-qualified reason that the loop feeds back to the
//! model as a synthetic observation.

use crate::worker::{Instruction, WorkerRegistry};

pub fn validate_instruction(
    instruction: &Instruction,
    registry: &WorkerRegistry,
) -> Result<(), String> {
    let worker = match registry.get(&instruction.worker) {
        Some(worker) => worker,
        None => {
            return Err(format!(
                "unknown worker '{}'; available: {}",
                instruction.worker,
                registry.names().join(", ")
            ));
        }
    };

    let actions = worker.actions();
    let descriptor = match actions.iter().find(|a| a.name == instruction.action) {
        Some(descriptor) => descriptor,
        None => {
            let names: Vec<&str> = actions.iter().map(|a| a.name.as_str()).collect();
            return Err(format!(
                "unknown action '{}' for worker '{}'; allowed: {}",
                instruction.action,
                instruction.worker,
                names.join(", ")
            ));
        }
    };

    for param in &descriptor.params {
        match instruction.args.get(&param.name) {
            Some(value) => {
                if !param.param_type.matches(value) {
                    return Err(format!(
                        "args.{}: expected {}, got {}",
                        param.name,
                        param.param_type.json_schema_name(),
                        json_type_name(value)
                    ));
                }
            }
            None if param.required => {
                return Err(format!("args.{}: required parameter is missing", param.name));
            }
            None => {}
        }
    }

    if !descriptor.open_schema {
        for key in instruction.args.keys() {
            if !descriptor.params.iter().any(|p| &p.name == key) {
                return Err(format!(
                    "args.{key}: unknown parameter for {}.{}",
                    instruction.worker, instruction.action
                ));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
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

    #[test]
    fn accepts_valid_instruction() {
        let instruction =
            Instruction::new("shell", "execute_command", json!({"command": "ls -la"}));
        assert!(validate_instruction(&instruction, &registry()).is_ok());
    }

    #[test]
    fn rejects_unknown_worker() {
        let instruction = Instruction::new("kubernetes", "get", json!({}));
        let err = validate_instruction(&instruction, &registry()).unwrap_err();
        assert!(err.contains("unknown worker"));
        assert!(err.contains("shell"));
    }

    #[test]
    fn rejects_unknown_action() {
        let instruction = Instruction::new("shell", "reboot", json!({}));
        let err = validate_instruction(&instruction, &registry()).unwrap_err();
        assert!(err.contains("unknown action"));
    }

    #[test]
    fn rejects_missing_required_param() {
        let instruction = Instruction::new("shell", "execute_command", json!({}));
        let err = validate_instruction(&instruction, &registry()).unwrap_err();
        assert_eq!(err, "args.command: required parameter is missing");
    }

    #[test]
    fn rejects_wrong_type() {
        let instruction = Instruction::new("shell", "execute_command", json!({"command": 42}));
        let err = validate_instruction(&instruction, &registry()).unwrap_err();
        assert!(err.contains("expected string, got number"));
    }

    #[test]
    fn rejects_unknown_param() {
        let instruction = Instruction::new(
            "shell",
            "execute_command",
            json!({"command": "ls", "sudo": true}),
        );
        let err = validate_instruction(&instruction, &registry()).unwrap_err();
        assert!(err.contains("args.sudo"));
    }
}
