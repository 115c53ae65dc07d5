use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::Ledger;
use crate::config::validate_identifier;
use crate::error::LedgerError;
use crate::types::{LedgerIndex, LedgerRecord, Page};

/// Postgres-backed ledger
///
/// `DELETE ... RETURNING` gives the conditional delete: when two
/// transactions race for the same row, exactly one gets it back.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
    table: String,
}

impl PgLedger {
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if it does not exist yet
    pub async fn ensure_table(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                execution_id TEXT NOT NULL,
                idx TEXT NOT NULL,
                task_token TEXT,
                metadata JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (execution_id, idx)
            )
            "#,
            table = self.table
        ))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create ledger table '{}'", self.table))?;

        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> LedgerRecord {
    let idx: String = row.get("idx");
    LedgerRecord {
        execution_id: row.get("execution_id"),
        index: LedgerIndex::from(idx),
        task_token: row.get("task_token"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn put_record(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (execution_id, idx, task_token, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (execution_id, idx)
            DO UPDATE SET
                task_token = EXCLUDED.task_token,
                metadata = EXCLUDED.metadata,
                created_at = EXCLUDED.created_at
            "#,
            table = self.table
        ))
        .bind(&record.execution_id)
        .bind(record.index.as_str())
        .bind(&record.task_token)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_record(
        &self,
        execution_id: &str,
        index: &LedgerIndex,
    ) -> Result<Option<LedgerRecord>, LedgerError> {
        let row = sqlx::query(&format!(
            r#"
            DELETE FROM {table}
            WHERE execution_id = $1
              AND idx = $2
            RETURNING execution_id, idx, task_token, metadata, created_at
            "#,
            table = self.table
        ))
        .bind(execution_id)
        .bind(index.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row))
    }

    async fn scan(
        &self,
        execution_id: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Page, LedgerError> {
        // Fetch one extra row to learn whether another page exists
        let rows = sqlx::query(&format!(
            r#"
            SELECT execution_id, idx, task_token, metadata, created_at
            FROM {table}
            WHERE execution_id = $1
              AND ($2::text IS NULL OR idx > $2)
            ORDER BY idx ASC
            LIMIT $3
            "#,
            table = self.table
        ))
        .bind(execution_id)
        .bind(cursor)
        .bind(i64::from(page_size) + 1)
        .fetch_all(&self.pool)
        .await?;

        let mut records: Vec<LedgerRecord> = rows.iter().map(record_from_row).collect();
        let has_more = records.len() > page_size as usize;
        records.truncate(page_size as usize);

        let next_cursor = if has_more {
            records.last().map(|record| record.index.to_string())
        } else {
            None
        };

        Ok(Page {
            records,
            next_cursor,
        })
    }
}
