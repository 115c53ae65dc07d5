use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;

use super::ReviewService;
use crate::error::ClientError;
use crate::types::Teardown;

/// Review resources tracked in the `review_flows` table
///
/// Opened reviews are announced on the `review_started` channel.
#[derive(Debug, Clone)]
pub struct PgReviewFlows {
    pool: PgPool,
}

impl PgReviewFlows {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Names of resources still registered for an execution
    pub async fn active_for(&self, execution_id: &str) -> Result<Vec<String>, ClientError> {
        let names = sqlx::query_scalar(
            r#"
            SELECT name FROM review_flows
            WHERE execution_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }
}

#[async_trait]
impl ReviewService for PgReviewFlows {
    async fn create(&self, resource_name: &str, execution_id: &str) -> Result<(), ClientError> {
        sqlx::query(
            r#"
            INSERT INTO review_flows (name, execution_id)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(resource_name)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn teardown(&self, resource_name: &str) -> Result<Teardown, ClientError> {
        let result = sqlx::query("DELETE FROM review_flows WHERE name = $1")
            .bind(resource_name)
            .execute(&self.pool)
            .await?;

        Ok(if result.rows_affected() == 0 {
            Teardown::AlreadyRemoved
        } else {
            Teardown::Removed
        })
    }

    async fn announce_started(
        &self,
        resource_name: &str,
        execution_id: &str,
    ) -> Result<(), ClientError> {
        let payload = json!({
            "type": "REVIEW_STARTED",
            "name": execution_id,
            "resource": resource_name,
        });

        sqlx::query("SELECT pg_notify('review_started', $1)")
            .bind(payload.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_helpers::test_pool;

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_teardown_is_idempotent() {
        let pool = test_pool().await;
        let flows = PgReviewFlows::new(pool);

        flows.create("flow-E1", "E1").await.unwrap();
        flows.create("flow-E1", "E1").await.unwrap();
        assert_eq!(flows.active_for("E1").await.unwrap(), vec!["flow-E1"]);

        assert_eq!(flows.teardown("flow-E1").await.unwrap(), Teardown::Removed);
        assert_eq!(
            flows.teardown("flow-E1").await.unwrap(),
            Teardown::AlreadyRemoved
        );
        assert!(flows.active_for("E1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore] // Requires database
    async fn test_announce_started_notifies_listeners() {
        let pool = test_pool().await;
        let mut listener = sqlx::postgres::PgListener::connect_with(&pool).await.unwrap();
        listener.listen("review_started").await.unwrap();

        let flows = PgReviewFlows::new(pool);
        flows.announce_started("flow-E1", "E1").await.unwrap();

        let notification = listener.recv().await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(notification.payload()).unwrap();
        assert_eq!(payload["type"], "REVIEW_STARTED");
        assert_eq!(payload["name"], "E1");
    }
}
