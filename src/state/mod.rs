//! Per-thread conversation history and pending approvals.

mod memory;
mod postgres;

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;
use crate::hitl::PendingApproval;
use crate::llm::{ModelMessage, ModelToolCall};

pub use memory::InMemoryConversationState;
pub use postgres::PgConversationState;

/// Caller-supplied conversation identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ThreadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Tool => "tool",
        }
    }
}

/// One message in a thread. Assistant turns may carry tool calls; tool turns
/// carry the id of the call they answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ModelToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(TurnRole::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(TurnRole::Assistant, content.into())
    }

    pub fn assistant_with_calls(
        content: Option<String>,
        tool_calls: Vec<ModelToolCall>,
    ) -> Self {
        Self {
            tool_calls,
            ..Self::plain(TurnRole::Assistant, content.unwrap_or_default())
        }
    }

    pub fn tool_result(call: &ModelToolCall, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            tool_name: Some(call.name.clone()),
            is_error,
            ..Self::plain(TurnRole::Tool, content.into())
        }
    }

    fn plain(role: TurnRole, content: String) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationThread {
    pub turns: Vec<Turn>,
    pub pending: Option<PendingApproval>,
}

/// Persistence boundary for conversation threads.
///
/// Turns are append-only and returned in append order. At most one pending
/// approval exists per thread: `set_pending` must fail with
/// [`StateError::ConcurrentPending`] rather than overwrite. `resolve_pending`
/// removes the approval and appends its outcome turn as one unit: either both
/// happen or neither does.
#[async_trait]
pub trait ConversationState: Send + Sync {
    async fn append(&self, thread_id: &ThreadId, turn: Turn) -> Result<(), StateError>;

    async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Turn>, StateError>;

    async fn set_pending(
        &self,
        thread_id: &ThreadId,
        pending: PendingApproval,
    ) -> Result<(), StateError>;

    async fn pending(&self, thread_id: &ThreadId) -> Result<Option<PendingApproval>, StateError>;

    /// Claims approval `approval_id` and records `turn`. Fails with
    /// [`StateError::NoPendingApproval`] once the approval is gone.
    async fn resolve_pending(
        &self,
        thread_id: &ThreadId,
        approval_id: Uuid,
        turn: Option<Turn>,
    ) -> Result<PendingApproval, StateError>;

    async fn thread(&self, thread_id: &ThreadId) -> Result<ConversationThread, StateError> {
        Ok(ConversationThread {
            turns: self.history(thread_id).await?,
            pending: self.pending(thread_id).await?,
        })
    }
}

/// Converts stored turns into model messages. Tool calls that never received
/// a result (skipped approvals) are dropped so the model never sees a
/// dangling call.
pub fn turns_to_messages(turns: &[Turn]) -> Vec<ModelMessage> {
    let answered = turns
        .iter()
        .filter_map(|turn| turn.tool_call_id.as_deref())
        .collect::<HashSet<_>>();

    let mut messages = Vec::with_capacity(turns.len());
    for turn in turns {
        match turn.role {
            TurnRole::User => messages.push(ModelMessage::User(turn.content.clone())),
            TurnRole::Assistant => {
                let tool_calls = turn
                    .tool_calls
                    .iter()
                    .filter(|call| answered.contains(call.id.as_str()))
                    .cloned()
                    .collect::<Vec<_>>();
                let content = Some(turn.content.clone()).filter(|text| !text.is_empty());
                if content.is_none() && tool_calls.is_empty() {
                    continue;
                }
                messages.push(ModelMessage::Assistant {
                    content,
                    tool_calls,
                });
            }
            TurnRole::Tool => messages.push(ModelMessage::Tool {
                call_id: turn.tool_call_id.clone().unwrap_or_default(),
                content: turn.content.clone(),
                is_error: turn.is_error,
            }),
        }
    }
    messages
}
