//! OpenAI-compatible client against a mock endpoint.

use opspilot::config::LlmConfig;
use opspilot::llm::{LlmClient, LlmOutcome, OpenAiClient, ProposalRequest};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> LlmConfig {
    LlmConfig {
        base_url: format!("{}/v1", server.uri()),
        model: "test-model".to_string(),
        api_key: "test-key".to_string(),
        timeout_secs: 5,
        ..Default::default()
    }
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "cmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

#[tokio::test]
async fn text_mode_extracts_instruction_json() {
    let server = MockServer::start().await;
    let content = r#"```json
{"thinking": "list containers first", "action": {"worker": "shell", "action": "execute_command", "args": {"command": "docker ps"}, "risk_level": "safe"}, "is_final": false}
```"#;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(content)))
        .mount(&server)
        .await;

    let client = OpenAiClient::new(config_for(&server)).unwrap();
    let outcome = client
        .propose(ProposalRequest {
            system_prompt: "system",
            user_prompt: "list containers",
            tool_schemas: &[],
        })
        .await
        .unwrap();

    match outcome {
        LlmOutcome::Proposal { instruction, is_final } => {
            assert_eq!(instruction.worker, "shell");
            assert_eq!(instruction.arg_str("command"), Some("docker ps"));
            assert!(!is_final);
        }
        other => panic!("{other:?}"),
    }
}

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body("recovered just fine")),
        )
        .mount(&server)
        .await;

    let client = OpenAiClient::new(config_for(&server)).unwrap();
    let text = client.generate_text("system", "user").await.unwrap();
    assert_eq!(text, "recovered just fine");
}

#[tokio::test]
async fn gives_up_after_three_transport_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = OpenAiClient::new(config_for(&server)).unwrap();
    assert!(client.generate_text("system", "user").await.is_err());
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiClient::new(config_for(&server)).unwrap();
    let err = client.generate_text("system", "user").await.unwrap_err();
    assert!(err.to_string().contains("400"));
}

#[tokio::test]
async fn tool_call_mode_lifts_structured_calls() {
    let server = MockServer::start().await;
    let body = json!({
        "id": "cmpl-2",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call-1",
                    "type": "function",
                    "function": {
                        "name": "shell__execute_command",
                        "arguments": "{\"command\": \"df -h\"}"
                    }
                }]
            },
            "finish_reason": "tool_calls"
        }]
    });
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.supports_function_calling = true;
    let client = OpenAiClient::new(config).unwrap();

    let schema = json!({
        "type": "function",
        "function": {"name": "shell__execute_command", "description": "run", "parameters": {}}
    });
    let outcome = client
        .propose(ProposalRequest {
            system_prompt: "system",
            user_prompt: "check disk",
            tool_schemas: std::slice::from_ref(&schema),
        })
        .await
        .unwrap();

    match outcome {
        LlmOutcome::Proposal { instruction, is_final } => {
            assert_eq!(instruction.worker, "shell");
            assert_eq!(instruction.action, "execute_command");
            assert_eq!(instruction.arg_str("command"), Some("df -h"));
            assert!(!is_final);
        }
        other => panic!("{other:?}"),
    }
}

#[tokio::test]
async fn unparseable_text_is_reported_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "Sure, I'd restart nginx with systemctl restart nginx.",
        )))
        .mount(&server)
        .await;

    let client = OpenAiClient::new(config_for(&server)).unwrap();
    let outcome = client
        .propose(ProposalRequest {
            system_prompt: "system",
            user_prompt: "restart nginx",
            tool_schemas: &[],
        })
        .await
        .unwrap();

    assert!(matches!(outcome, LlmOutcome::Unparseable { .. }));
}
