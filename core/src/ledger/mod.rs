//! Execution ledger
//!
//! Holds one record per outstanding subtask of an execution plus the
//! `TASK_TOKEN` sentinel. Records are ordered by index within an execution.
//!
//! - `put_record` writes (or overwrites) a record
//! - `delete_record` is conditional: it returns the removed record, or `None`
//!   when nothing was there. Concurrent callers never both observe the same
//!   record as removed by them.
//! - `scan` pages through an execution's records with a keyset cursor

mod memory;
mod postgres;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::LedgerError;
use crate::types::{LedgerIndex, LedgerRecord, Page};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn put_record(&self, record: LedgerRecord) -> Result<(), LedgerError>;

    async fn delete_record(
        &self,
        execution_id: &str,
        index: &LedgerIndex,
    ) -> Result<Option<LedgerRecord>, LedgerError>;

    async fn scan(
        &self,
        execution_id: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Page, LedgerError>;
}

/// What is left of an execution after a completion
#[derive(Debug, Clone, PartialEq)]
pub enum Remaining {
    /// Nothing at all, the execution was already finalized
    None,
    /// Exactly one record
    Single(LedgerRecord),
    /// More than one record; the scan stopped early
    Several,
}

impl Remaining {
    pub fn label(&self) -> &'static str {
        match self {
            Remaining::None => "none",
            Remaining::Single(record) if record.is_sentinel() => "sentinel",
            Remaining::Single(_) => "single",
            Remaining::Several => "several",
        }
    }
}

/// Early-exit scan: stop as soon as two records were seen or pages run out
pub async fn remaining_records(
    ledger: &dyn Ledger,
    execution_id: &str,
    page_size: u32,
) -> Result<Remaining, LedgerError> {
    let mut seen: Vec<LedgerRecord> = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = ledger
            .scan(execution_id, page_size, cursor.as_deref())
            .await?;
        seen.extend(page.records);

        if seen.len() > 1 {
            return Ok(Remaining::Several);
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(match seen.pop() {
        Some(record) => Remaining::Single(record),
        None => Remaining::None,
    })
}

/// Full scan of an execution's records, in index order
pub async fn list_execution(
    ledger: &dyn Ledger,
    execution_id: &str,
    page_size: u32,
) -> Result<Vec<LedgerRecord>, LedgerError> {
    let mut records = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = ledger
            .scan(execution_id, page_size, cursor.as_deref())
            .await?;
        records.extend(page.records);

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(records),
        }
    }
}

/// Outstanding work of one execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatus {
    pub execution_id: String,
    /// Subtask identifiers still awaiting review, in index order
    pub outstanding: Vec<String>,
    /// Whether the continuation token is still held
    pub awaiting_resume: bool,
}

impl ExecutionStatus {
    /// Nothing outstanding and no token: finalized, or never opened
    pub fn is_closed(&self) -> bool {
        self.outstanding.is_empty() && !self.awaiting_resume
    }
}

pub async fn execution_status(
    ledger: &dyn Ledger,
    execution_id: &str,
    page_size: u32,
) -> Result<ExecutionStatus, LedgerError> {
    let records = list_execution(ledger, execution_id, page_size).await?;
    let (sentinels, subtasks): (Vec<_>, Vec<_>) =
        records.into_iter().partition(LedgerRecord::is_sentinel);

    Ok(ExecutionStatus {
        execution_id: execution_id.to_string(),
        outstanding: subtasks
            .into_iter()
            .map(|record| record.index.as_str().to_string())
            .collect(),
        awaiting_resume: !sentinels.is_empty(),
    })
}
