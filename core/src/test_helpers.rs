//! Test doubles for the handler's injected collaborators

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::clients::{ReviewService, WorkflowResumer};
use crate::config::HandlerConfig;
use crate::error::{ClientError, LedgerError};
use crate::handler::CompletionHandler;
use crate::ledger::{Ledger, MemoryLedger};
use crate::types::{LedgerIndex, LedgerRecord, Page, ResumeOutcome, Resumption, Teardown};

/// Handler settings with instant retries
pub fn fast_config() -> HandlerConfig {
    HandlerConfig {
        retry_backoff_ms: 1,
        call_timeout_secs: 5,
        ..HandlerConfig::default()
    }
}

/// Review service that records calls and can be told to fail
#[derive(Default)]
pub struct RecordingReviewService {
    created: Mutex<Vec<String>>,
    announced: Mutex<Vec<String>>,
    teardowns: Mutex<Vec<String>>,
    removed: Mutex<HashSet<String>>,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
}

impl RecordingReviewService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` teardown calls
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    pub fn mark_removed(&self, resource: &str) {
        self.removed.lock().unwrap().insert(resource.to_string());
    }

    pub fn teardowns(&self) -> Vec<String> {
        self.teardowns.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn announced(&self) -> Vec<String> {
        self.announced.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewService for RecordingReviewService {
    async fn create(&self, resource_name: &str, _execution_id: &str) -> Result<(), ClientError> {
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("service unavailable".to_string()));
        }
        self.created.lock().unwrap().push(resource_name.to_string());
        Ok(())
    }

    async fn teardown(&self, resource_name: &str) -> Result<Teardown, ClientError> {
        self.teardowns.lock().unwrap().push(resource_name.to_string());

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("service unavailable".to_string()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::Rejected("throttled".to_string()));
        }

        if self.removed.lock().unwrap().insert(resource_name.to_string()) {
            Ok(Teardown::Removed)
        } else {
            Ok(Teardown::AlreadyRemoved)
        }
    }

    async fn announce_started(
        &self,
        resource_name: &str,
        _execution_id: &str,
    ) -> Result<(), ClientError> {
        self.announced.lock().unwrap().push(resource_name.to_string());
        Ok(())
    }
}

/// Orchestrator double: records resumes, consumes tokens on first use
#[derive(Default)]
pub struct RecordingResumer {
    paused: Mutex<Vec<(String, String)>>,
    resumes: Mutex<Vec<(String, ResumeOutcome)>>,
    consumed: Mutex<HashSet<String>>,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
    unknown_tokens: AtomicBool,
}

impl RecordingResumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Answer every resume as if the token had never been issued
    pub fn reject_tokens(&self) {
        self.unknown_tokens.store(true, Ordering::SeqCst);
    }

    pub fn consume(&self, token: &str) {
        self.consumed.lock().unwrap().insert(token.to_string());
    }

    /// Resumes that reached the orchestrator for real
    pub fn delivered(&self) -> Vec<(String, ResumeOutcome)> {
        self.resumes.lock().unwrap().clone()
    }

    pub fn paused(&self) -> Vec<(String, String)> {
        self.paused.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowResumer for RecordingResumer {
    async fn pause(&self, execution_id: &str, token: &str) -> Result<(), ClientError> {
        self.paused
            .lock()
            .unwrap()
            .push((execution_id.to_string(), token.to_string()));
        Ok(())
    }

    async fn resume(
        &self,
        token: &str,
        outcome: &ResumeOutcome,
    ) -> Result<Resumption, ClientError> {
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("orchestrator unavailable".to_string()));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::Rejected("throttled".to_string()));
        }
        if self.unknown_tokens.load(Ordering::SeqCst) {
            return Err(ClientError::UnknownToken);
        }

        if !self.consumed.lock().unwrap().insert(token.to_string()) {
            return Ok(Resumption::AlreadyConsumed);
        }
        self.resumes
            .lock()
            .unwrap()
            .push((token.to_string(), outcome.clone()));
        Ok(Resumption::Delivered)
    }
}

/// Ledger wrapper that fails selected operations
pub struct FlakyLedger {
    pub inner: MemoryLedger,
    fail_scans: AtomicBool,
    scan_failures_left: AtomicU32,
    fail_deletes: AtomicBool,
    fail_sentinel_puts: AtomicBool,
}

impl FlakyLedger {
    pub fn new(inner: MemoryLedger) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_scans: AtomicBool::new(false),
            scan_failures_left: AtomicU32::new(0),
            fail_deletes: AtomicBool::new(false),
            fail_sentinel_puts: AtomicBool::new(false),
        })
    }

    pub fn fail_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next `n` scans
    pub fn fail_next_scans(&self, n: u32) {
        self.scan_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sentinel_puts(&self, fail: bool) {
        self.fail_sentinel_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn put_record(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        if record.is_sentinel() && self.fail_sentinel_puts.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("write rejected".to_string()));
        }
        self.inner.put_record(record).await
    }

    async fn delete_record(
        &self,
        execution_id: &str,
        index: &LedgerIndex,
    ) -> Result<Option<LedgerRecord>, LedgerError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("connection reset".to_string()));
        }
        self.inner.delete_record(execution_id, index).await
    }

    async fn scan(
        &self,
        execution_id: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<Page, LedgerError> {
        let transient = self
            .scan_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || self.fail_scans.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("connection reset".to_string()));
        }
        self.inner.scan(execution_id, page_size, cursor).await
    }
}

/// Seed `<execution_id>-<suffix>` subtask records plus the sentinel
pub async fn seed_execution(ledger: &dyn Ledger, execution_id: &str, suffixes: &[&str], token: &str) {
    for suffix in suffixes {
        let id = format!("{}-{}", execution_id, suffix);
        ledger
            .put_record(LedgerRecord::subtask(execution_id, &id, json!({})))
            .await
            .unwrap();
    }
    ledger
        .put_record(LedgerRecord::sentinel(execution_id, token))
        .await
        .unwrap();
}

/// Handler wired to the given doubles
pub fn handler_with(
    ledger: Arc<dyn Ledger>,
    review: Arc<RecordingReviewService>,
    resumer: Arc<RecordingResumer>,
) -> CompletionHandler {
    CompletionHandler::new(ledger, review, resumer, fast_config()).unwrap()
}
