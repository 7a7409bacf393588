use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StateError;
use crate::hitl::PendingApproval;
use crate::state::{ConversationState, ConversationThread, ThreadId, Turn};

/// Volatile store for single-process use. Threads live until the process exits.
#[derive(Debug, Default)]
pub struct InMemoryConversationState {
    threads: Mutex<HashMap<ThreadId, ConversationThread>>,
}

impl InMemoryConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_threads<R>(
        &self,
        f: impl FnOnce(&mut HashMap<ThreadId, ConversationThread>) -> R,
    ) -> Result<R, StateError> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| StateError::Storage("conversation state lock poisoned".to_string()))?;
        Ok(f(&mut threads))
    }
}

#[async_trait]
impl ConversationState for InMemoryConversationState {
    async fn append(&self, thread_id: &ThreadId, turn: Turn) -> Result<(), StateError> {
        self.with_threads(|threads| {
            threads.entry(thread_id.clone()).or_default().turns.push(turn);
        })
    }

    async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Turn>, StateError> {
        self.with_threads(|threads| {
            threads
                .get(thread_id)
                .map(|thread| thread.turns.clone())
                .unwrap_or_default()
        })
    }

    async fn set_pending(
        &self,
        thread_id: &ThreadId,
        pending: PendingApproval,
    ) -> Result<(), StateError> {
        self.with_threads(|threads| {
            let thread = threads.entry(thread_id.clone()).or_default();
            if let Some(existing) = &thread.pending {
                return Err(StateError::ConcurrentPending {
                    thread_id: thread_id.to_string(),
                    existing: existing.id.to_string(),
                });
            }
            thread.pending = Some(pending);
            Ok(())
        })?
    }

    async fn pending(&self, thread_id: &ThreadId) -> Result<Option<PendingApproval>, StateError> {
        self.with_threads(|threads| {
            threads
                .get(thread_id)
                .and_then(|thread| thread.pending.clone())
        })
    }

    async fn resolve_pending(
        &self,
        thread_id: &ThreadId,
        approval_id: Uuid,
        turn: Option<Turn>,
    ) -> Result<PendingApproval, StateError> {
        self.with_threads(|threads| {
            let thread = threads
                .get_mut(thread_id)
                .filter(|thread| {
                    thread
                        .pending
                        .as_ref()
                        .is_some_and(|pending| pending.id == approval_id)
                })
                .ok_or_else(|| StateError::NoPendingApproval {
                    thread_id: thread_id.to_string(),
                })?;
            thread.turns.extend(turn);
            thread
                .pending
                .take()
                .ok_or_else(|| StateError::NoPendingApproval {
                    thread_id: thread_id.to_string(),
                })
        })?
    }

    async fn thread(&self, thread_id: &ThreadId) -> Result<ConversationThread, StateError> {
        self.with_threads(|threads| threads.get(thread_id).cloned().unwrap_or_default())
    }
}
