//! The chat model seam. The agent speaks [`ModelMessage`]s; adapters translate
//! them to a provider's wire format.

mod openrouter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;

pub use openrouter::{DEFAULT_API_BASE_URL, DEFAULT_MODEL, OpenRouterModel, OpenRouterModelConfig};

/// One entry of the transcript sent to the model.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ModelToolCall>,
    },
    /// The answer to the assistant's call `call_id`.
    Tool {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool as advertised to the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCompletion {
    pub text: Option<String>,
    /// Reasoning the provider exposed separately from the answer.
    pub thinking: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
}

impl ModelCompletion {
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

/// The reasoning step: turns instructions plus history into either a final
/// answer or one or more tool invocations. Tool use is left to the model's
/// discretion whenever `tools` is non-empty.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
    ) -> Result<ModelCompletion, ProviderError>;
}
