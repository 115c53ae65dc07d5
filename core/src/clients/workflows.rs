use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};

use super::WorkflowResumer;
use crate::error::ClientError;
use crate::types::{ResumeOutcome, Resumption};

/// Paused workflow steps tracked in the `paused_workflows` table
///
/// Resuming flips the row out of `paused` and notifies listeners on the
/// `workflow_resumed` channel in the same statement.
#[derive(Debug, Clone)]
pub struct PgWorkflows {
    pool: PgPool,
}

/// Stored state of a paused step
#[derive(Debug, Clone)]
pub struct PausedWorkflow {
    pub execution_id: String,
    pub status: String,
    pub outcome: Option<JsonValue>,
}

impl PgWorkflows {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, token: &str) -> Result<Option<PausedWorkflow>, ClientError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id, status, outcome
            FROM paused_workflows
            WHERE task_token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PausedWorkflow {
            execution_id: r.get("execution_id"),
            status: r.get("status"),
            outcome: r.get("outcome"),
        }))
    }
}

#[async_trait]
impl WorkflowResumer for PgWorkflows {
    async fn pause(&self, execution_id: &str, token: &str) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            INSERT INTO paused_workflows (task_token, execution_id, status)
            VALUES ($1, $2, 'paused')
            ON CONFLICT (task_token) DO NOTHING
            "#,
        )
        .bind(token)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn resume(
        &self,
        token: &str,
        outcome: &ResumeOutcome,
    ) -> Result<Resumption, ClientError> {
        let status = if outcome.is_success() {
            "succeeded"
        } else {
            "failed"
        };

        let resumed = sqlx::query(
            r#"
            WITH resumed AS (
                UPDATE paused_workflows
                SET status = $2,
                    outcome = $3,
                    resumed_at = NOW()
                WHERE task_token = $1
                  AND status = 'paused'
                RETURNING execution_id
            )
            SELECT pg_notify('workflow_resumed', execution_id) FROM resumed
            "#,
        )
        .bind(token)
        .bind(status)
        .bind(outcome.to_payload())
        .fetch_optional(&self.pool)
        .await?;

        if resumed.is_some() {
            return Ok(Resumption::Delivered);
        }

        // Nothing was paused on this token: either it was used or never existed
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT status FROM paused_workflows WHERE task_token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Ok(Resumption::AlreadyConsumed),
            None => Err(ClientError::UnknownToken),
        }
    }
}
