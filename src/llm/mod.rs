//! LLM client
//!
//! Typed wrapper over an OpenAI-compatible `/chat/completions` endpoint.
//! Two modes: text (the model answers with an instruction JSON that gets
//! extracted and repaired) and tool-call (structured function calls built
//! from the worker registry). Retries with exponential backoff and the
//! per-call timeout live here; everything above sees either a clean
//! [`LlmOutcome`] or a transport error that is fatal for the turn.

pub mod parse;

use crate::config::LlmConfig;
use crate::policy::RiskLevel;
use crate::worker::Instruction;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

const MAX_RETRIES: u32 = 3;

/// One reasoning request.
pub struct ProposalRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    /// OpenAI tool schemas from the worker registry; empty in text mode.
    pub tool_schemas: &'a [Value],
}

/// What the model proposed.
#[derive(Debug, Clone)]
pub enum LlmOutcome {
    Proposal {
        instruction: Instruction,
        /// The model considers the task finished after this step.
        is_final: bool,
    },
    /// Output was not parseable even after repair. Counted as one loop
    /// iteration and fed back as a synthetic observation.
    Unparseable { detail: String },
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Ask for the next instruction.
    async fn propose(&self, request: ProposalRequest<'_>) -> Result<LlmOutcome>;

    /// Free-text generation (used for forced summaries).
    async fn generate_text(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// OpenAI-compatible HTTP client.
pub struct OpenAiClient {
    http: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    arguments: String,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    async fn chat(&self, messages: Value, tools: Option<&[Value]>) -> Result<ChatMessage> {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.to_vec());
            }
        }

        let mut last_error = anyhow!("no attempts made");
        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            let mut request = self.http.post(self.endpoint()).json(&body);
            if !self.config.api_key.is_empty() {
                request = request.bearer_auth(&self.config.api_key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed: ChatResponse =
                            response.json().await.context("malformed completion response")?;
                        return parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|c| c.message)
                            .ok_or_else(|| anyhow!("completion response had no choices"));
                    }
                    // Rate limits and server errors are worth retrying.
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        tracing::warn!(attempt, %status, "llm request failed, retrying");
                        last_error = anyhow!("llm endpoint returned {status}");
                        continue;
                    }
                    let detail = response.text().await.unwrap_or_default();
                    return Err(anyhow!("llm endpoint returned {status}: {detail}"));
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "llm transport error, retrying");
                    last_error = anyhow!(err).context("llm transport error");
                }
            }
        }
        Err(last_error.context(format!("giving up after {MAX_RETRIES} attempts")))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn propose(&self, request: ProposalRequest<'_>) -> Result<LlmOutcome> {
        let messages = json!([
            {"role": "system", "content": request.system_prompt},
            {"role": "user", "content": request.user_prompt},
        ]);

        if self.config.supports_function_calling && !request.tool_schemas.is_empty() {
            let message = self.chat(messages, Some(request.tool_schemas)).await?;
            return Ok(lift_tool_call(message));
        }

        let message = self.chat(messages, None).await?;
        let content = message.content.unwrap_or_default();
        Ok(parse_proposal(&content))
    }

    async fn generate_text(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let messages = json!([
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user_prompt},
        ]);
        let message = self.chat(messages, None).await?;
        Ok(message.content.unwrap_or_default())
    }
}

/// Convert a structured tool call into an instruction. A plain text answer
/// in tool-call mode means the model is done and chatting.
fn lift_tool_call(message: ChatMessage) -> LlmOutcome {
    if let Some(calls) = message.tool_calls {
        if let Some(call) = calls.into_iter().next() {
            let (worker, action) = match call.function.name.split_once("__") {
                Some((w, a)) => (w.to_string(), a.to_string()),
                None => {
                    return LlmOutcome::Unparseable {
                        detail: format!("tool name '{}' is not worker__action", call.function.name),
                    }
                }
            };
            let args: Map<String, Value> =
                match serde_json::from_str::<Value>(&call.function.arguments) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) | Err(_) => match parse::parse_json_lenient(&call.function.arguments) {
                        Ok(Value::Object(map)) => map,
                        _ => {
                            return LlmOutcome::Unparseable {
                                detail: "tool call arguments were not a JSON object".to_string(),
                            }
                        }
                    },
                };
            let is_final = worker == "chat";
            return LlmOutcome::Proposal {
                instruction: Instruction {
                    worker,
                    action,
                    args,
                    risk_level: RiskLevel::Safe,
                    dry_run: false,
                    thinking: message.content,
                },
                is_final,
            };
        }
    }

    // No tool call: treat the text as the final chat answer.
    let text = message.content.unwrap_or_default();
    LlmOutcome::Proposal {
        instruction: Instruction::new("chat", "respond", json!({ "message": text })),
        is_final: true,
    }
}

/// Parse the text-mode contract:
/// `{"thinking": ..., "action": {"worker", "action", "args", "risk_level"}, "is_final": bool}`.
/// A flat instruction object is accepted as a fallback.
pub fn parse_proposal(content: &str) -> LlmOutcome {
    let value = match parse::parse_json_lenient(content) {
        Ok(value) => value,
        Err(detail) => return LlmOutcome::Unparseable { detail },
    };

    let thinking = value
        .get("thinking")
        .and_then(Value::as_str)
        .map(str::to_string);
    let is_final = value.get("is_final").and_then(Value::as_bool).unwrap_or(false);

    let action_obj = value.get("action").unwrap_or(&value);

    let worker = match action_obj.get("worker").and_then(Value::as_str) {
        Some(w) if !w.is_empty() => w.to_string(),
        _ => {
            return LlmOutcome::Unparseable {
                detail: "response is missing the 'worker' field".to_string(),
            }
        }
    };
    let action = match action_obj.get("action").and_then(Value::as_str) {
        Some(a) if !a.is_empty() => a.to_string(),
        _ => {
            return LlmOutcome::Unparseable {
                detail: "response is missing the 'action' field".to_string(),
            }
        }
    };
    let args = match action_obj.get("args") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    let risk_level = action_obj
        .get("risk_level")
        .and_then(|v| serde_json::from_value::<RiskLevel>(v.clone()).ok())
        .unwrap_or_default();

    LlmOutcome::Proposal {
        instruction: Instruction {
            worker,
            action,
            args,
            risk_level,
            dry_run: action_obj
                .get("dry_run")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            thinking,
        },
        is_final,
    }
}
