//! OpenRouter chat-completions adapter. Any OpenAI-compatible endpoint works
//! by pointing `base_url` elsewhere.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::llm::{ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolDefinition};

pub const DEFAULT_API_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash-lite-preview-09-2025";

#[derive(Debug, Clone)]
pub struct OpenRouterModelConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Sent as `HTTP-Referer` and `X-Title` to attribute requests on the
    /// OpenRouter dashboard.
    pub referer: Option<String>,
    pub title: Option<String>,
}

impl OpenRouterModelConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            temperature: 0.0,
            max_tokens: Some(4096),
            referer: None,
            title: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterModel {
    client: Client,
    endpoint: String,
    config: OpenRouterModelConfig,
}

impl OpenRouterModel {
    pub fn new(config: OpenRouterModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    pub fn config(&self) -> &OpenRouterModelConfig {
        &self.config
    }
}

#[async_trait]
impl ChatModel for OpenRouterModel {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
    ) -> Result<ModelCompletion, ProviderError> {
        let body = request_body(&self.config, messages, tools);

        let mut request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body);
        if let Some(referer) = &self.config.referer {
            request = request.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.config.title {
            request = request.header("X-Title", title);
        }

        tracing::debug!(
            model = %self.config.model,
            messages = messages.len(),
            tools = tools.len(),
            "requesting chat completion"
        );

        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::Request(describe_failure(status, &text)));
        }
        parse_completion(&text)
    }
}

fn request_body(
    config: &OpenRouterModelConfig,
    messages: &[ModelMessage],
    tools: &[ModelToolDefinition],
) -> Value {
    let mut body = json!({
        "model": config.model,
        "messages": messages.iter().filter_map(wire_message).collect::<Vec<_>>(),
        "temperature": config.temperature,
    });

    if let Some(max_tokens) = config.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        body["tool_choice"] = json!("auto");
    }

    body
}

/// Empty system/user text and empty assistant turns are dropped. Error tool
/// results carry an `Error: ` prefix so the model can tell them apart.
fn wire_message(message: &ModelMessage) -> Option<Value> {
    match message {
        ModelMessage::System(content) if !content.is_empty() => {
            Some(json!({"role": "system", "content": content}))
        }
        ModelMessage::User(content) if !content.is_empty() => {
            Some(json!({"role": "user", "content": content}))
        }
        ModelMessage::System(_) | ModelMessage::User(_) => None,
        ModelMessage::Assistant {
            content,
            tool_calls,
        } => {
            let content = content.as_deref().filter(|text| !text.is_empty());
            if content.is_none() && tool_calls.is_empty() {
                return None;
            }

            let mut wire = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                wire["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            Some(wire)
        }
        ModelMessage::Tool {
            call_id,
            content,
            is_error,
        } => {
            let content = if *is_error {
                format!("Error: {content}")
            } else {
                content.clone()
            };
            Some(json!({"role": "tool", "tool_call_id": call_id, "content": content}))
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    usage: Option<ReplyUsage>,
    /// OpenRouter reports some upstream failures in a 200 body.
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyChoice {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
    #[serde(default, alias = "reasoning_content")]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ReplyToolCall>,
}

#[derive(Debug, Deserialize)]
struct ReplyToolCall {
    id: String,
    function: ReplyFunction,
}

#[derive(Debug, Deserialize)]
struct ReplyFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ReplyUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    message: Option<String>,
    code: Option<Value>,
}

impl ReplyError {
    fn describe(&self, fallback_code: &str) -> String {
        let code = match &self.code {
            Some(Value::String(code)) => code.clone(),
            Some(other) => other.to_string(),
            None => fallback_code.to_string(),
        };
        let message = self.message.as_deref().unwrap_or("unknown api error");
        format!("openrouter api error {code}: {message}")
    }
}

impl ReplyToolCall {
    fn into_model(self) -> Result<ModelToolCall, ProviderError> {
        let arguments = if self.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.function.arguments).map_err(|err| {
                ProviderError::Response(format!(
                    "arguments for tool call '{}' are not valid JSON: {err}",
                    self.function.name
                ))
            })?
        };

        Ok(ModelToolCall {
            id: self.id,
            name: self.function.name,
            arguments,
        })
    }
}

fn parse_completion(body: &str) -> Result<ModelCompletion, ProviderError> {
    let reply: Reply = serde_json::from_str(body)
        .map_err(|err| ProviderError::Response(format!("unreadable chat completion: {err}")))?;

    if let Some(error) = &reply.error {
        return Err(ProviderError::Response(error.describe("unknown")));
    }
    if let Some(usage) = &reply.usage {
        tracing::debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "chat completion usage"
        );
    }

    let message = reply
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| ProviderError::Response("chat completion has no choices".to_string()))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(ReplyToolCall::into_model)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ModelCompletion {
        text: message.content.filter(|text| !text.is_empty()),
        thinking: message.reasoning.filter(|text| !text.is_empty()),
        tool_calls,
    })
}

fn describe_failure(status: StatusCode, body: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        error: ReplyError,
    }

    match serde_json::from_str::<Envelope>(body) {
        Ok(envelope) => envelope.error.describe(status.as_str()),
        Err(_) if body.trim().is_empty() => format!("openrouter request failed ({status})"),
        Err(_) => format!("openrouter request failed ({status}): {}", body.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenRouterModelConfig {
        OpenRouterModelConfig::new("sk-test", DEFAULT_MODEL)
    }

    #[test]
    fn request_body_carries_tool_history_in_wire_order() {
        let messages = vec![
            ModelMessage::System(String::new()),
            ModelMessage::User("What is the latest invoice?".to_string()),
            ModelMessage::Assistant {
                content: None,
                tool_calls: vec![ModelToolCall {
                    id: "call_1".to_string(),
                    name: "execute_query".to_string(),
                    arguments: json!({"query": "SELECT 1"}),
                }],
            },
            ModelMessage::Tool {
                call_id: "call_1".to_string(),
                content: "[(1,)]".to_string(),
                is_error: false,
            },
        ];
        let tools = vec![ModelToolDefinition {
            name: "execute_query".to_string(),
            description: "Execute a SQL query".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        }];

        let body = request_body(&config(), &messages, &tools);

        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["temperature"].as_f64(), Some(0.0));
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"][0]["function"]["name"], "execute_query");

        let wire = body["messages"].as_array().expect("messages array");
        assert_eq!(wire.len(), 3, "empty system prompt is dropped");
        assert_eq!(wire[1]["role"], "assistant");
        assert!(wire[1]["content"].is_null());
        assert_eq!(
            wire[1]["tool_calls"][0]["function"]["arguments"],
            "{\"query\":\"SELECT 1\"}"
        );
        assert_eq!(
            wire[2],
            json!({"role": "tool", "tool_call_id": "call_1", "content": "[(1,)]"})
        );
    }

    #[test]
    fn rejected_calls_reach_the_model_as_errors() {
        let messages = vec![ModelMessage::Tool {
            call_id: "call_9".to_string(),
            content: "the database is offline.".to_string(),
            is_error: true,
        }];

        let body = request_body(&config(), &messages, &[]);

        assert_eq!(body["messages"][0]["content"], "Error: the database is offline.");
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn parse_completion_reads_reasoning_and_tool_arguments() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "reasoning": "the invoice table has a date column",
                    "tool_calls": [
                        {
                            "id": "call_x",
                            "type": "function",
                            "function": {
                                "name": "execute_query",
                                "arguments": "{\"query\":\"SELECT 1\"}"
                            }
                        },
                        {"id": "call_y", "type": "function", "function": {"name": "list_tables"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7}
        })
        .to_string();

        let completion = parse_completion(&body).expect("parses");

        assert_eq!(completion.text, None);
        assert_eq!(
            completion.thinking.as_deref(),
            Some("the invoice table has a date column")
        );
        assert_eq!(completion.tool_calls[0].arguments, json!({"query": "SELECT 1"}));
        assert_eq!(completion.tool_calls[1].arguments, json!({}));
        assert!(!completion.is_final());
    }

    #[test]
    fn parse_completion_surfaces_errors() {
        let err = parse_completion(
            &json!({"error": {"code": 502, "message": "upstream timed out"}}).to_string(),
        )
        .expect_err("error body");
        assert_eq!(err.to_string(), "provider response invalid: openrouter api error 502: upstream timed out");

        let err = parse_completion(&json!({"choices": []}).to_string()).expect_err("no choices");
        assert!(err.to_string().contains("no choices"));

        let bad_arguments = json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "c", "function": {"name": "calculator", "arguments": "{not json}"}}
            ]}}]
        })
        .to_string();
        let err = parse_completion(&bad_arguments).expect_err("bad arguments");
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn failures_prefer_the_api_error_message() {
        assert_eq!(
            describe_failure(
                StatusCode::UNAUTHORIZED,
                r#"{"error":{"message":"No auth credentials found"}}"#
            ),
            "openrouter api error 401: No auth credentials found"
        );
        assert_eq!(
            describe_failure(StatusCode::BAD_GATEWAY, ""),
            "openrouter request failed (502 Bad Gateway)"
        );
    }
}
