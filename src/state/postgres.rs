use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::StateError;
use crate::hitl::PendingApproval;
use crate::state::{ConversationState, ThreadId, Turn};

/// Durable store backed by Postgres. Pending approvals survive restarts, so an
/// operator can answer long after the run that raised them has exited.
#[derive(Debug, Clone)]
pub struct PgConversationState {
    pool: PgPool,
}

impl PgConversationState {
    pub async fn connect(database_url: &str) -> Result<Self, StateError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let state = Self { pool };
        state.run_migrations().await?;
        Ok(state)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StateError> {
        // Postgres rejects several commands in one prepared statement.
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS agent_turns (
                seq BIGSERIAL PRIMARY KEY,
                thread_id TEXT NOT NULL,
                role TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS agent_pending_approvals (
                thread_id TEXT PRIMARY KEY,
                approval_id UUID NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_agent_turns_thread ON agent_turns(thread_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        tracing::debug!("conversation state tables ready");
        Ok(())
    }
}

#[async_trait]
impl ConversationState for PgConversationState {
    async fn append(&self, thread_id: &ThreadId, turn: Turn) -> Result<(), StateError> {
        let mut conn = self.pool.acquire().await?;
        insert_turn(&mut conn, thread_id, &turn).await
    }

    async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Turn>, StateError> {
        let rows: Vec<(Json<Turn>,)> =
            sqlx::query_as("SELECT payload FROM agent_turns WHERE thread_id = $1 ORDER BY seq ASC")
                .bind(thread_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(Json(turn),)| turn).collect())
    }

    async fn set_pending(
        &self,
        thread_id: &ThreadId,
        pending: PendingApproval,
    ) -> Result<(), StateError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agent_pending_approvals (thread_id, approval_id, payload, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (thread_id) DO NOTHING
            "#,
        )
        .bind(thread_id.as_str())
        .bind(pending.id)
        .bind(Json(&pending))
        .bind(pending.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self
                .pending(thread_id)
                .await?
                .map(|existing| existing.id.to_string())
                .unwrap_or_default();
            return Err(StateError::ConcurrentPending {
                thread_id: thread_id.to_string(),
                existing,
            });
        }
        Ok(())
    }

    async fn pending(&self, thread_id: &ThreadId) -> Result<Option<PendingApproval>, StateError> {
        let row: Option<(Json<PendingApproval>,)> =
            sqlx::query_as("SELECT payload FROM agent_pending_approvals WHERE thread_id = $1")
                .bind(thread_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(Json(pending),)| pending))
    }

    async fn resolve_pending(
        &self,
        thread_id: &ThreadId,
        approval_id: Uuid,
        turn: Option<Turn>,
    ) -> Result<PendingApproval, StateError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Json<PendingApproval>,)> = sqlx::query_as(
            "DELETE FROM agent_pending_approvals \
             WHERE thread_id = $1 AND approval_id = $2 RETURNING payload",
        )
        .bind(thread_id.as_str())
        .bind(approval_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((Json(pending),)) = row else {
            return Err(StateError::NoPendingApproval {
                thread_id: thread_id.to_string(),
            });
        };

        if let Some(turn) = turn {
            insert_turn(&mut tx, thread_id, &turn).await?;
        }
        tx.commit().await?;
        Ok(pending)
    }
}

async fn insert_turn(
    conn: &mut PgConnection,
    thread_id: &ThreadId,
    turn: &Turn,
) -> Result<(), StateError> {
    sqlx::query("INSERT INTO agent_turns (thread_id, role, payload) VALUES ($1, $2, $3)")
        .bind(thread_id.as_str())
        .bind(turn.role.as_str())
        .bind(Json(turn))
        .execute(conn)
        .await?;
    Ok(())
}
