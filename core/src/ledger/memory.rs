use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::Ledger;
use crate::error::LedgerError;
use crate::types::{LedgerIndex, LedgerRecord, Page};

type Key = (String, String);

/// Process-local ledger, ordered like the durable store
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    records: Arc<Mutex<BTreeMap<Key, LedgerRecord>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of an execution, in index order
    pub async fn records(&self, execution_id: &str) -> Vec<LedgerRecord> {
        let records = self.records.lock().await;
        records
            .range(execution_range(execution_id, None))
            .take_while(|((exec, _), _)| exec == execution_id)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

fn execution_range(execution_id: &str, cursor: Option<&str>) -> (Bound<Key>, Bound<Key>) {
    let start = match cursor {
        Some(after) => Bound::Excluded((execution_id.to_string(), after.to_string())),
        None => Bound::Included((execution_id.to_string(), String::new())),
    };
    (start, Bound::Unbounded)
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn put_record(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        let key = (record.execution_id.clone(), record.index.to_string());
        self.records.lock().await.insert(key, record);
        Ok(())
    }

    async fn delete_record(
        &self,
        execution_id: &str,
        index: &LedgerIndex,
    ) -> Result<Option<LedgerRecord>, LedgerError> {
        let key = (execution_id.to_string(), index.to_string());
        Ok(self.records.lock().await.remove(&key))
    }

    async fn scan(
        &self,
        execution_id: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Page, LedgerError> {
        let records = self.records.lock().await;

        // One record of lookahead tells whether another page exists
        let mut window: Vec<LedgerRecord> = records
            .range(execution_range(execution_id, cursor))
            .take_while(|((exec, _), _)| exec == execution_id)
            .take(page_size as usize + 1)
            .map(|(_, record)| record.clone())
            .collect();

        let has_more = window.len() > page_size as usize;
        window.truncate(page_size as usize);
        let next_cursor = if has_more {
            window.last().map(|record| record.index.to_string())
        } else {
            None
        };

        Ok(Page {
            records: window,
            next_cursor,
        })
    }
}
