//! Human approval for tool calls.
//!
//! A gated call moves through `Requested -> Resolved`. While requested it is
//! stored as a [`PendingApproval`] on its thread and the agent run suspends.
//! A [`Decision`] resolves it:
//! - `Approve` runs the tool once and appends its result as a tool turn.
//! - `Reject` appends the reason as an error tool turn without running the tool.
//! - `Skip` appends nothing; the call is dropped from what the model sees.

mod operator;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApprovalError, DecisionError, StateError};
use crate::llm::ModelToolCall;
use crate::sql::QueryRequest;
use crate::state::{ConversationState, ThreadId, Turn};
use crate::tools::ToolExecution;

pub use operator::{INVALID_OPTION_MESSAGE, SELECT_PROMPT, prompt_decision};

pub const DEFAULT_REJECT_REASON: &str = "the database is offline.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Approve,
    Reject,
    Skip,
}

impl DecisionKind {
    pub const ALL: [DecisionKind; 3] = [DecisionKind::Approve, DecisionKind::Reject, DecisionKind::Skip];

    /// The word an operator types for this decision.
    pub fn operator_word(&self) -> &'static str {
        match self {
            DecisionKind::Approve => "accept",
            DecisionKind::Reject => "reject",
            DecisionKind::Skip => "skip",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operator_word())
    }
}

impl FromStr for DecisionKind {
    type Err = DecisionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "accept" | "approve" => Ok(DecisionKind::Approve),
            "reject" => Ok(DecisionKind::Reject),
            "skip" => Ok(DecisionKind::Skip),
            _ => Err(DecisionError::Unknown(value.trim().to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject { reason: String },
    Skip,
}

impl Decision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Decision::Reject {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Approve => DecisionKind::Approve,
            Decision::Reject { .. } => DecisionKind::Reject,
            Decision::Skip => DecisionKind::Skip,
        }
    }

    /// Parses operator input such as `accept`, `skip`, `reject` or
    /// `reject: the table is archived`. A bare `reject` uses `default_reason`.
    pub fn parse(input: &str, default_reason: &str) -> Result<Self, DecisionError> {
        let input = input.trim();
        let (word, rest) = match input.find(|c: char| c.is_whitespace() || c == ':') {
            Some(idx) => (&input[..idx], &input[idx..]),
            None => (input, ""),
        };

        let kind = word.parse::<DecisionKind>().map_err(|_| DecisionError::Unknown(input.to_string()))?;
        let rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ':').trim();

        match kind {
            DecisionKind::Approve | DecisionKind::Skip if !rest.is_empty() => {
                Err(DecisionError::Unknown(input.to_string()))
            }
            DecisionKind::Approve => Ok(Decision::Approve),
            DecisionKind::Skip => Ok(Decision::Skip),
            DecisionKind::Reject if rest.is_empty() => Ok(Decision::reject(default_reason)),
            DecisionKind::Reject => Ok(Decision::reject(rest)),
        }
    }
}

/// A gated tool call waiting for an operator decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: Uuid,
    pub thread_id: ThreadId,
    pub action: ModelToolCall,
    pub description: String,
    pub created_at: DateTime<Utc>,
    /// Calls from the same model step that still have to run after this one.
    #[serde(default)]
    pub remaining: Vec<ModelToolCall>,
}

impl PendingApproval {
    pub fn new(thread_id: ThreadId, action: ModelToolCall, remaining: Vec<ModelToolCall>) -> Self {
        let description = describe_action(&action);
        Self {
            id: Uuid::new_v4(),
            thread_id,
            action,
            description,
            created_at: Utc::now(),
            remaining,
        }
    }

    /// The SQL this approval would run, for `execute_query` style calls.
    pub fn query_request(&self) -> Option<QueryRequest> {
        let query = self.action.arguments.get("query")?.as_str()?;
        Some(QueryRequest {
            query: query.to_string(),
            requested_at: self.created_at,
        })
    }
}

fn describe_action(action: &ModelToolCall) -> String {
    format!(
        "Tool execution requires approval\n\nTool: {}\nArgs: {}",
        action.name, action.arguments
    )
}

/// How a pending approval was resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub pending: PendingApproval,
    pub decision: Decision,
    /// Present only when the tool actually ran.
    pub execution: Option<ToolExecution>,
    /// The turn appended to the thread; `None` for `Skip`.
    pub turn: Option<Turn>,
}

/// Intercepts configured tools and parks them until a human decides.
#[derive(Clone)]
pub struct ApprovalGate {
    state: Arc<dyn ConversationState>,
    policies: HashMap<String, Vec<DecisionKind>>,
}

impl fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl ApprovalGate {
    pub fn new(state: Arc<dyn ConversationState>) -> Self {
        Self {
            state,
            policies: HashMap::new(),
        }
    }

    /// Gates `tool`, accepting only `allowed` decisions for it.
    pub fn interrupt_on(mut self, tool: impl Into<String>, allowed: &[DecisionKind]) -> Self {
        self.policies.insert(tool.into(), allowed.to_vec());
        self
    }

    pub fn intercepts(&self, tool: &str) -> bool {
        self.policies.contains_key(tool)
    }

    pub fn allowed_decisions(&self, tool: &str) -> &[DecisionKind] {
        self.policies
            .get(tool)
            .map(Vec::as_slice)
            .unwrap_or(&DecisionKind::ALL)
    }

    pub fn state(&self) -> &Arc<dyn ConversationState> {
        &self.state
    }

    /// Suspends `call` on `thread_id`. Fails without touching the existing
    /// approval if the thread already has one.
    pub async fn request(
        &self,
        thread_id: &ThreadId,
        call: ModelToolCall,
        remaining: Vec<ModelToolCall>,
    ) -> Result<PendingApproval, StateError> {
        let pending = PendingApproval::new(thread_id.clone(), call, remaining);
        if let Err(err) = self.state.set_pending(thread_id, pending.clone()).await {
            tracing::warn!(thread = %thread_id, error = %err, "approval request refused");
            return Err(err);
        }

        tracing::info!(
            thread = %thread_id,
            approval = %pending.id,
            tool = %pending.action.name,
            "approval requested"
        );
        Ok(pending)
    }

    pub fn validate(&self, pending: &PendingApproval, decision: &Decision) -> Result<(), DecisionError> {
        let kind = decision.kind();
        if self.allowed_decisions(&pending.action.name).contains(&kind) {
            Ok(())
        } else {
            Err(DecisionError::NotAllowed {
                decision: kind.to_string(),
                tool: pending.action.name.clone(),
            })
        }
    }

    /// Applies `decision` to the thread's pending approval. `run` is invoked
    /// once on approval and never otherwise. The approval is cleared in the
    /// same store write that records its outcome turn, so an invalid decision
    /// or a failed write leaves it pending. Resolving with nothing pending
    /// fails and appends nothing.
    pub async fn resolve<F, Fut>(
        &self,
        thread_id: &ThreadId,
        decision: Decision,
        run: F,
    ) -> Result<Resolution, ApprovalError>
    where
        F: FnOnce(ModelToolCall) -> Fut,
        Fut: Future<Output = ToolExecution>,
    {
        let Some(pending) = self.state.pending(thread_id).await? else {
            return Err(StateError::NoPendingApproval {
                thread_id: thread_id.to_string(),
            }
            .into());
        };
        self.validate(&pending, &decision)?;

        let (execution, turn) = match &decision {
            Decision::Approve => {
                let execution = run(pending.action.clone()).await;
                let turn = Turn::tool_result(
                    &pending.action,
                    execution.result_text.clone(),
                    execution.is_error,
                );
                (Some(execution), Some(turn))
            }
            Decision::Reject { reason } => {
                (None, Some(Turn::tool_result(&pending.action, reason.clone(), true)))
            }
            Decision::Skip => (None, None),
        };

        let pending = self
            .state
            .resolve_pending(thread_id, pending.id, turn.clone())
            .await?;

        tracing::info!(
            thread = %thread_id,
            approval = %pending.id,
            decision = %decision.kind(),
            "approval resolved"
        );

        Ok(Resolution {
            pending,
            decision,
            execution,
            turn,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::state::{InMemoryConversationState, TurnRole};

    fn query_call(id: &str, query: &str) -> ModelToolCall {
        ModelToolCall {
            id: id.to_string(),
            name: "execute_query".to_string(),
            arguments: json!({"query": query}),
        }
    }

    fn gate() -> ApprovalGate {
        ApprovalGate::new(Arc::new(InMemoryConversationState::new()))
            .interrupt_on("execute_query", &DecisionKind::ALL)
    }

    fn ok_run(calls: &AtomicUsize) -> impl FnOnce(ModelToolCall) -> std::future::Ready<ToolExecution> + '_ {
        move |_call| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(ToolExecution {
                result_text: "[(412, '2013-12-22 00:00:00')]".to_string(),
                is_error: false,
                done_message: None,
            })
        }
    }

    #[test]
    fn parse_accepts_operator_words() {
        assert_eq!(Decision::parse("accept", DEFAULT_REJECT_REASON), Ok(Decision::Approve));
        assert_eq!(Decision::parse(" SKIP ", DEFAULT_REJECT_REASON), Ok(Decision::Skip));
        assert_eq!(
            Decision::parse("reject", DEFAULT_REJECT_REASON),
            Ok(Decision::reject("the database is offline."))
        );
        assert_eq!(
            Decision::parse("reject: use the archive", DEFAULT_REJECT_REASON),
            Ok(Decision::reject("use the archive"))
        );
        assert!(Decision::parse("yes", DEFAULT_REJECT_REASON).is_err());
        assert!(Decision::parse("accept everything", DEFAULT_REJECT_REASON).is_err());
        assert!(Decision::parse("", DEFAULT_REJECT_REASON).is_err());
    }

    #[test]
    fn pending_approval_describes_the_query() {
        let pending = PendingApproval::new(
            ThreadId::from("1"),
            query_call("call_1", "SELECT * FROM Invoice LIMIT 1"),
            Vec::new(),
        );

        assert!(pending.description.starts_with("Tool execution requires approval"));
        assert!(pending.description.contains("Tool: execute_query"));
        assert_eq!(
            pending.query_request().map(|request| request.query),
            Some("SELECT * FROM Invoice LIMIT 1".to_string())
        );
    }

    #[tokio::test]
    async fn approve_runs_once_and_appends_one_tool_turn() {
        let gate = gate();
        let thread = ThreadId::from("1");
        let calls = AtomicUsize::new(0);
        gate.request(&thread, query_call("call_1", "SELECT 1"), Vec::new())
            .await
            .expect("requested");

        let resolution = gate
            .resolve(&thread, Decision::Approve, ok_run(&calls))
            .await
            .expect("resolved");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let history = gate.state().history(&thread).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, TurnRole::Tool);
        assert_eq!(history[0].content, "[(412, '2013-12-22 00:00:00')]");
        assert_eq!(resolution.turn.as_ref(), Some(&history[0]));
    }

    #[tokio::test]
    async fn reject_appends_reason_without_running() {
        let gate = gate();
        let thread = ThreadId::from("1");
        let calls = AtomicUsize::new(0);
        gate.request(&thread, query_call("call_1", "SELECT 1"), Vec::new())
            .await
            .expect("requested");

        gate.resolve(&thread, Decision::reject("the database is offline."), ok_run(&calls))
            .await
            .expect("resolved");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let history = gate.state().history(&thread).await.expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "the database is offline.");
        assert!(history[0].is_error);

        // The thread stays usable for the next request.
        gate.request(&thread, query_call("call_2", "SELECT 2"), Vec::new())
            .await
            .expect("thread is resumable");
    }

    #[tokio::test]
    async fn skip_appends_nothing() {
        let gate = gate();
        let thread = ThreadId::from("1");
        let calls = AtomicUsize::new(0);
        gate.request(&thread, query_call("call_1", "SELECT 1"), Vec::new())
            .await
            .expect("requested");

        let resolution = gate
            .resolve(&thread, Decision::Skip, ok_run(&calls))
            .await
            .expect("resolved");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(resolution.turn.is_none());
        assert!(gate.state().history(&thread).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn resolving_twice_is_rejected() {
        let gate = gate();
        let thread = ThreadId::from("1");
        let calls = AtomicUsize::new(0);
        gate.request(&thread, query_call("call_1", "SELECT 1"), Vec::new())
            .await
            .expect("requested");
        gate.resolve(&thread, Decision::Approve, ok_run(&calls))
            .await
            .expect("first resolve");

        let err = gate
            .resolve(&thread, Decision::Approve, ok_run(&calls))
            .await
            .expect_err("second resolve");

        assert!(matches!(
            err,
            ApprovalError::State(StateError::NoPendingApproval { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.state().history(&thread).await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn disallowed_decision_keeps_approval_pending() {
        let gate = ApprovalGate::new(Arc::new(InMemoryConversationState::new()))
            .interrupt_on("execute_query", &[DecisionKind::Approve, DecisionKind::Reject]);
        let thread = ThreadId::from("1");
        let calls = AtomicUsize::new(0);
        gate.request(&thread, query_call("call_1", "SELECT 1"), Vec::new())
            .await
            .expect("requested");

        let err = gate
            .resolve(&thread, Decision::Skip, ok_run(&calls))
            .await
            .expect_err("skip not allowed");

        assert!(matches!(
            err,
            ApprovalError::Decision(DecisionError::NotAllowed { .. })
        ));
        assert!(gate.state().pending(&thread).await.expect("pending").is_some());
    }

    /// Wraps the in-memory store and fails every resolve write.
    #[derive(Default)]
    struct FailingWrites {
        inner: InMemoryConversationState,
    }

    #[async_trait::async_trait]
    impl ConversationState for FailingWrites {
        async fn append(&self, thread_id: &ThreadId, turn: Turn) -> Result<(), StateError> {
            self.inner.append(thread_id, turn).await
        }

        async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Turn>, StateError> {
            self.inner.history(thread_id).await
        }

        async fn set_pending(
            &self,
            thread_id: &ThreadId,
            pending: PendingApproval,
        ) -> Result<(), StateError> {
            self.inner.set_pending(thread_id, pending).await
        }

        async fn pending(
            &self,
            thread_id: &ThreadId,
        ) -> Result<Option<PendingApproval>, StateError> {
            self.inner.pending(thread_id).await
        }

        async fn resolve_pending(
            &self,
            _thread_id: &ThreadId,
            _approval_id: Uuid,
            _turn: Option<Turn>,
        ) -> Result<PendingApproval, StateError> {
            Err(StateError::Storage("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_write_keeps_the_approval_for_a_retry() {
        let store = Arc::new(FailingWrites::default());
        let gate = ApprovalGate::new(store.clone())
            .interrupt_on("execute_query", &DecisionKind::ALL);
        let thread = ThreadId::from("1");
        let calls = AtomicUsize::new(0);
        let requested = gate
            .request(&thread, query_call("call_1", "SELECT 1"), Vec::new())
            .await
            .expect("requested");

        let err = gate
            .resolve(&thread, Decision::Approve, ok_run(&calls))
            .await
            .expect_err("write fails");

        assert!(matches!(err, ApprovalError::State(StateError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let pending = store.pending(&thread).await.expect("pending");
        assert_eq!(pending.map(|pending| pending.id), Some(requested.id));
        assert!(store.history(&thread).await.expect("history").is_empty());

        // The same approval can be answered again against a healthy store.
        let retry = ApprovalGate::new(Arc::new(InMemoryConversationState::new()));
        retry
            .state()
            .set_pending(&thread, requested.clone())
            .await
            .expect("restored");
        let resolution = retry
            .resolve(&thread, Decision::reject("try later"), ok_run(&calls))
            .await
            .expect("resolved");
        assert_eq!(resolution.pending.id, requested.id);
    }

    #[tokio::test]
    async fn concurrent_request_does_not_overwrite() {
        let gate = gate();
        let thread = ThreadId::from("1");
        let first = gate
            .request(&thread, query_call("call_1", "SELECT 1"), Vec::new())
            .await
            .expect("requested");

        let err = gate
            .request(&thread, query_call("call_2", "SELECT 2"), Vec::new())
            .await
            .expect_err("second request");

        assert!(matches!(err, StateError::ConcurrentPending { .. }));
        let current = gate.state().pending(&thread).await.expect("pending");
        assert_eq!(current.map(|pending| pending.id), Some(first.id));
    }
}
