//! Chat worker: the loop's termination channel
//!
//! `chat.respond` delivers the final natural-language answer and marks the
//! task completed. The reasoner is told to use it exactly once, at the end.

use super::{ActionDescriptor, ActionParam, ParamType, Worker, WorkerResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

pub struct ChatWorker;

#[async_trait]
impl Worker for ChatWorker {
    fn name(&self) -> &str {
        "chat"
    }

    fn description(&self) -> &str {
        "Deliver the final answer to the user. Use ONLY for the last step, never for intermediate ones."
    }

    fn actions(&self) -> Vec<ActionDescriptor> {
        vec![ActionDescriptor::new(
            "respond",
            "Send the final answer and finish the task",
        )
        .with_params(vec![ActionParam::required(
            "message",
            ParamType::String,
            "The complete answer, in the user's language",
        )])]
    }

    async fn execute(
        &self,
        action: &str,
        args: &Map<String, Value>,
        _dry_run: bool,
    ) -> Result<WorkerResult> {
        if action != "respond" {
            return Ok(WorkerResult::failure(format!("unknown action: {action}")));
        }
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(WorkerResult::ok(message).completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn respond_completes_the_task() {
        let args = match json!({"message": "磁盘使用率正常"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let result = ChatWorker.execute("respond", &args, false).await.unwrap();
        assert!(result.success);
        assert!(result.task_completed);
        assert_eq!(result.message, "磁盘使用率正常");
    }
}
