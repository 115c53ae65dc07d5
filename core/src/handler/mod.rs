//! Completion event handler
//!
//! One invocation per subtask-completion notification:
//!
//! 1. Parse the execution id out of the subtask identifier
//! 2. Delete the subtask's ledger record
//! 3. Scan what is left of the execution, stopping early
//! 4. If only the sentinel remains, finalize: conditionally delete the
//!    sentinel, tear down the review resource, resume the workflow
//!
//! Invocations are stateless and may run concurrently for the same
//! execution. The conditional sentinel delete in step 4 is the only point
//! where they serialize: the one invocation that gets the sentinel back
//! finalizes, every other one stops.

use anyhow::Context;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::clients::{ReviewService, WorkflowResumer};
use crate::config::HandlerConfig;
use crate::error::{BarrierError, ClientError, LedgerError};
use crate::ledger::{remaining_records, Ledger, Remaining};
use crate::notification::{CompletionNotification, SubtaskId};
use crate::types::{LedgerIndex, LedgerRecord, ResumeOutcome, Resumption, Teardown};


/// What a single invocation did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HandleOutcome {
    /// Other subtasks are still outstanding
    Pending {
        execution_id: String,
        duplicate: bool,
    },
    /// Nothing left to finalize, or another invocation won the sentinel
    AlreadyFinalized {
        execution_id: String,
        duplicate: bool,
    },
    Finalized(Finalization),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finalization {
    pub execution_id: String,
    pub resource: String,
    pub teardown: TeardownStatus,
    pub resumption: Resumption,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum TeardownStatus {
    Removed,
    AlreadyRemoved,
    /// Left for out-of-band cleanup
    Failed(String),
}

#[derive(Clone)]
pub struct CompletionHandler {
    ledger: Arc<dyn Ledger>,
    review: Arc<dyn ReviewService>,
    workflows: Arc<dyn WorkflowResumer>,
    config: HandlerConfig,
}

impl CompletionHandler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        review: Arc<dyn ReviewService>,
        workflows: Arc<dyn WorkflowResumer>,
        config: HandlerConfig,
    ) -> anyhow::Result<Self> {
        config.validate().context("Invalid handler configuration")?;
        Ok(Self {
            ledger,
            review,
            workflows,
            config,
        })
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// `handle`, repeated while the error is retryable
    ///
    /// Safe because a repeated notification is treated as a duplicate.
    pub async fn handle_retrying(
        &self,
        notification: &CompletionNotification,
    ) -> Result<HandleOutcome, BarrierError> {
        let mut attempt = 1;
        loop {
            match self.handle(notification).await {
                Err(err) if err.is_retryable() && attempt < self.config.delivery_attempts => {
                    warn!(
                        subtask_id = %notification.subtask_id,
                        attempt,
                        error = %err,
                        "Notification failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    #[instrument(
        skip_all,
        fields(subtask_id = %notification.subtask_id, remaining = tracing::field::Empty)
    )]
    pub async fn handle(
        &self,
        notification: &CompletionNotification,
    ) -> Result<HandleOutcome, BarrierError> {
        let subtask = SubtaskId::parse(&notification.subtask_id, self.config.separator())?;
        let execution_id = subtask.execution_id();
        info!(execution_id, "Subtask completed");

        let index = LedgerIndex::Subtask(subtask.as_str().to_string());
        let removed = self
            .ledger_call(self.ledger.delete_record(execution_id, &index))
            .await?;

        // A missing record means this notification was seen before. Keep going:
        // the earlier delivery may have stopped before finalizing.
        let duplicate = removed.is_none();
        if duplicate {
            warn!(execution_id, "Subtask record already gone, duplicate delivery");
        } else {
            debug!(execution_id, "Subtask record deleted");
        }

        let remaining = self
            .ledger_call(remaining_records(
                self.ledger.as_ref(),
                execution_id,
                self.config.page_size,
            ))
            .await?;

        Span::current().record("remaining", remaining.label());

        match remaining {
            Remaining::Several => {
                info!(execution_id, "Subtasks remain to be reviewed");
                Ok(HandleOutcome::Pending {
                    execution_id: execution_id.to_string(),
                    duplicate,
                })
            }
            Remaining::Single(record) if record.is_sentinel() => {
                info!(execution_id, "All subtasks reviewed");
                self.finalize(execution_id, duplicate).await
            }
            Remaining::Single(record) => {
                warn!(
                    execution_id,
                    index = %record.index,
                    "Lone remaining record is not the sentinel"
                );
                Ok(HandleOutcome::Pending {
                    execution_id: execution_id.to_string(),
                    duplicate,
                })
            }
            Remaining::None => {
                debug!(execution_id, "No records left, execution already finalized");
                Ok(HandleOutcome::AlreadyFinalized {
                    execution_id: execution_id.to_string(),
                    duplicate,
                })
            }
        }
    }

    async fn finalize(
        &self,
        execution_id: &str,
        duplicate: bool,
    ) -> Result<HandleOutcome, BarrierError> {
        let sentinel = self
            .ledger_call(self.ledger.delete_record(execution_id, &LedgerIndex::TaskToken))
            .await?;

        let Some(sentinel) = sentinel else {
            info!(execution_id, "Sentinel already taken by a concurrent invocation");
            return Ok(HandleOutcome::AlreadyFinalized {
                execution_id: execution_id.to_string(),
                duplicate,
            });
        };
        info!(execution_id, "Token record deleted");

        let resource = self.config.resource_name(execution_id);

        let Some(token) = sentinel.task_token.clone() else {
            let err = BarrierError::CorruptSentinel {
                execution_id: execution_id.to_string(),
            };
            error!(execution_id, error = %err, "Cannot resume workflow");
            self.teardown(&resource).await;
            return Err(err);
        };

        let teardown = self.teardown(&resource).await;

        let outcome = ResumeOutcome::success(json!({ "ExecutionId": execution_id }));
        match self.resume(&token, &outcome).await {
            Ok(resumption) => Ok(HandleOutcome::Finalized(Finalization {
                execution_id: execution_id.to_string(),
                resource,
                teardown,
                resumption,
            })),
            Err(source) => {
                self.rearm(sentinel).await;
                Err(BarrierError::ResumeFailed {
                    execution_id: execution_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Never fails the invocation: resumption must still be attempted
    async fn teardown(&self, resource: &str) -> TeardownStatus {
        let mut attempt = 1;
        loop {
            match self.client_call(self.review.teardown(resource)).await {
                Ok(Teardown::Removed) => {
                    info!(resource, "Review resource deleted");
                    return TeardownStatus::Removed;
                }
                Ok(Teardown::AlreadyRemoved) => {
                    warn!(resource, "Review resource was already deleted");
                    return TeardownStatus::AlreadyRemoved;
                }
                Err(source) if attempt < self.config.teardown_attempts => {
                    warn!(resource, attempt, error = %source, "Teardown failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                Err(source) => {
                    let err = BarrierError::TeardownFailed {
                        resource: resource.to_string(),
                        source,
                    };
                    error!(resource, error = %err, "Review resource needs manual cleanup");
                    return TeardownStatus::Failed(err.to_string());
                }
            }
        }
    }

    async fn resume(
        &self,
        token: &str,
        outcome: &ResumeOutcome,
    ) -> Result<Resumption, ClientError> {
        let mut attempt = 1;
        loop {
            match self.client_call(self.workflows.resume(token, outcome)).await {
                Ok(Resumption::Delivered) => {
                    info!("Success sent to workflow");
                    return Ok(Resumption::Delivered);
                }
                Ok(Resumption::AlreadyConsumed) => {
                    warn!("Continuation token already consumed");
                    return Ok(Resumption::AlreadyConsumed);
                }
                Err(source) if source.is_stale_token() => {
                    warn!(error = %source, "Continuation token is stale, treating as consumed");
                    return Ok(Resumption::AlreadyConsumed);
                }
                Err(source) if attempt < self.config.resume_attempts => {
                    warn!(attempt, error = %source, "Resume failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                Err(source) => return Err(source),
            }
        }
    }

    /// Put the sentinel back so a redelivered notification can finalize again
    async fn rearm(&self, sentinel: LedgerRecord) {
        let execution_id = sentinel.execution_id.clone();
        match self.ledger_call(self.ledger.put_record(sentinel)).await {
            Ok(()) => warn!(execution_id, "Resume failed, sentinel restored for redelivery"),
            Err(err) => error!(
                execution_id,
                error = %err,
                "Resume failed and sentinel could not be restored, workflow stays paused"
            ),
        }
    }

    async fn ledger_call<T, F>(&self, call: F) -> Result<T, BarrierError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        bounded(self.config.call_timeout(), call, LedgerError::Timeout)
            .await
            .map_err(BarrierError::from)
    }

    async fn client_call<T, F>(&self, call: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        bounded(self.config.call_timeout(), call, ClientError::Timeout).await
    }
}

async fn bounded<T, E, F>(limit: Duration, call: F, on_timeout: fn(Duration) -> E) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}
