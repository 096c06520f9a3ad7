//! Tests for supportflow-llm: error classification and the scripted model

use supportflow_llm::*;

// ===========================================================================
// Error classification
// ===========================================================================

#[test]
fn rate_limits_and_server_errors_retry() {
    assert!(LlmError::Upstream {
        status: 429,
        message: "slow down".into()
    }
    .is_retryable());
    assert!(LlmError::Upstream {
        status: 503,
        message: "overloaded".into()
    }
    .is_retryable());
    assert!(LlmError::Timeout { elapsed_ms: 30_000 }.is_retryable());
}

#[test]
fn validation_and_auth_errors_do_not_retry() {
    assert!(!LlmError::Upstream {
        status: 400,
        message: "bad request".into()
    }
    .is_retryable());
    assert!(!LlmError::AuthFailed("bad key".into()).is_retryable());
    assert!(!LlmError::InvalidResponse("garbage".into()).is_retryable());
    assert!(!LlmError::Cancelled.is_retryable());
}

#[test]
fn retryability_survives_conversion_to_core_error() {
    let transient: supportflow_core::Error = LlmError::Upstream {
        status: 503,
        message: "overloaded".into(),
    }
    .into();
    assert!(transient.is_retryable());

    let fatal: supportflow_core::Error = LlmError::AuthFailed("bad key".into()).into();
    assert!(!fatal.is_retryable());
}

// ===========================================================================
// ScriptedModel
// ===========================================================================

fn request(model: &str) -> GenerateRequest {
    GenerateRequest {
        model: model.into(),
        system: Some("be brief".into()),
        messages: vec![ChatMessage::user("hello")],
        tools: None,
        temperature: None,
        max_output_tokens: None,
    }
}

#[tokio::test]
async fn scripted_model_replays_in_order() {
    let model = ScriptedModel::new();
    model.push_text("first");
    model.push_transient_error("blip");
    model.push_text("second");

    let r1 = model.generate(request("m")).await.unwrap();
    assert_eq!(r1.text.as_deref(), Some("first"));

    let err = model.generate(request("m")).await.unwrap_err();
    assert!(err.is_retryable());

    let r2 = model.generate(request("m")).await.unwrap();
    assert_eq!(r2.text.as_deref(), Some("second"));

    assert_eq!(model.call_count(), 3);
}

#[tokio::test]
async fn scripted_model_records_requests() {
    let model = ScriptedModel::new();
    model.push_text("ok");

    model.generate(request("claude-x")).await.unwrap();
    let seen = model.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].model, "claude-x");
    assert_eq!(seen[0].system.as_deref(), Some("be brief"));
}

#[tokio::test]
async fn exhausted_script_returns_empty_response() {
    let model = ScriptedModel::new();
    let response = model.generate(request("m")).await.unwrap();
    assert!(response.text.is_none());
    assert!(response.tool_calls.is_empty());
}

#[tokio::test]
async fn tool_call_responses_round_trip() {
    let model = ScriptedModel::new();
    model.push_response(GenerateResponse {
        text: None,
        tool_calls: vec![ToolInvocation {
            id: "tc-1".into(),
            name: "send_visitor_message".into(),
            arguments: serde_json::json!({"message": "Hello!"}),
        }],
        usage: Default::default(),
    });

    let response = model.generate(request("m")).await.unwrap();
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(response.tool_calls[0].name, "send_visitor_message");
    assert_eq!(response.tool_calls[0].arguments["message"], "Hello!");
}
