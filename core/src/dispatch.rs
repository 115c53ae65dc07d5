//! Review dispatcher
//!
//! Producer side of the ledger: opens the review phase of an execution by
//! creating its review resource, writing one ledger record per subtask and
//! finally the sentinel that carries the continuation token.

use anyhow::{Context, Result};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::clients::{ReviewService, WorkflowResumer};
use crate::config::HandlerConfig;
use crate::ledger::Ledger;
use crate::notification::SubtaskId;
use crate::types::{LedgerIndex, LedgerRecord, ResumeOutcome};

/// One subtask to launch
#[derive(Debug, Clone)]
pub struct SubtaskSpec {
    /// Defaults to the subtask's 1-based position
    pub suffix: Option<String>,
    pub metadata: JsonValue,
}

impl SubtaskSpec {
    pub fn new(metadata: JsonValue) -> Self {
        Self {
            suffix: None,
            metadata,
        }
    }

    pub fn with_suffix(suffix: impl Into<String>, metadata: JsonValue) -> Self {
        Self {
            suffix: Some(suffix.into()),
            metadata,
        }
    }
}

/// Review opened for an execution
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Subtask identifiers now outstanding
    Opened(Vec<String>),
    /// No subtasks: the workflow was resumed right away
    Skipped,
}

/// What `try_open` managed to write before failing
#[derive(Default)]
struct Progress {
    resource: Option<String>,
    subtasks: Vec<String>,
}

#[derive(Clone)]
pub struct ReviewDispatcher {
    ledger: Arc<dyn Ledger>,
    review: Arc<dyn ReviewService>,
    workflows: Arc<dyn WorkflowResumer>,
    config: HandlerConfig,
}

impl ReviewDispatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        review: Arc<dyn ReviewService>,
        workflows: Arc<dyn WorkflowResumer>,
        config: HandlerConfig,
    ) -> Result<Self> {
        config.validate().context("Invalid handler configuration")?;
        Ok(Self {
            ledger,
            review,
            workflows,
            config,
        })
    }

    /// Open the review phase of `execution_id`, paused on `token`
    ///
    /// On failure, whatever was already written is removed and the workflow is
    /// resumed with a `ReviewSetupFailed` outcome before the error is returned.
    #[instrument(skip(self, token, subtasks), fields(subtasks = subtasks.len()))]
    pub async fn open_review(
        &self,
        execution_id: &str,
        token: &str,
        subtasks: Vec<SubtaskSpec>,
    ) -> Result<Dispatch> {
        let mut progress = Progress::default();
        let err = match self.try_open(execution_id, token, subtasks, &mut progress).await {
            Ok(dispatch) => return Ok(dispatch),
            Err(err) => err,
        };

        error!(execution_id, error = %err, "Review setup failed");
        self.roll_back(execution_id, progress).await;

        let outcome = ResumeOutcome::failure("ReviewSetupFailed", format!("{:#}", err));
        match self.workflows.resume(token, &outcome).await {
            Ok(_) => info!(execution_id, "Failure sent to workflow"),
            Err(resume_err) => {
                error!(execution_id, error = %resume_err, "Failure could not be sent to workflow")
            }
        }
        Err(err)
    }

    async fn try_open(
        &self,
        execution_id: &str,
        token: &str,
        subtasks: Vec<SubtaskSpec>,
        progress: &mut Progress,
    ) -> Result<Dispatch> {
        let separator = self.config.separator();

        // Validate every identifier before writing anything
        let mut planned = Vec::with_capacity(subtasks.len());
        for (position, subtask) in subtasks.into_iter().enumerate() {
            let suffix = subtask
                .suffix
                .unwrap_or_else(|| (position + 1).to_string());
            let id = SubtaskId::compose(execution_id, separator, &suffix)?;
            planned.push((id, subtask.metadata));
        }

        self.workflows
            .pause(execution_id, token)
            .await
            .context("Failed to register paused workflow")?;

        let resource = self.config.resource_name(execution_id);
        self.review
            .create(&resource, execution_id)
            .await
            .with_context(|| format!("Failed to create review resource '{}'", resource))?;
        progress.resource = Some(resource.clone());
        info!(execution_id, resource, "Review resource created");

        if planned.is_empty() {
            info!(execution_id, "No human review needed");
            self.review
                .teardown(&resource)
                .await
                .with_context(|| format!("Failed to delete review resource '{}'", resource))?;
            progress.resource = None;
            self.workflows
                .resume(token, &ResumeOutcome::success(json!({})))
                .await
                .context("Failed to resume workflow")?;
            info!(execution_id, "Success sent to workflow");
            return Ok(Dispatch::Skipped);
        }

        for (id, metadata) in planned {
            self.ledger
                .put_record(LedgerRecord::subtask(execution_id, id.as_str(), metadata))
                .await
                .with_context(|| format!("Failed to record subtask '{}'", id.as_str()))?;
            progress.subtasks.push(id.as_str().to_string());
        }
        info!(execution_id, count = progress.subtasks.len(), "Subtask records added");

        // Written last so a completion can never see the sentinel alone too early
        self.ledger
            .put_record(LedgerRecord::sentinel(execution_id, token))
            .await
            .context("Failed to record continuation token")?;
        info!(execution_id, "Added token to ledger");

        // The review is live from here on; a lost announcement must not undo it
        if let Err(err) = self.review.announce_started(&resource, execution_id).await {
            warn!(execution_id, error = %err, "Review-started notification not sent");
        } else {
            info!(execution_id, "Review-started notification sent");
        }

        Ok(Dispatch::Opened(std::mem::take(&mut progress.subtasks)))
    }

    /// Best effort: leftovers are logged for out-of-band cleanup
    async fn roll_back(&self, execution_id: &str, progress: Progress) {
        for id in progress.subtasks {
            let index = LedgerIndex::Subtask(id);
            if let Err(err) = self.ledger.delete_record(execution_id, &index).await {
                error!(execution_id, subtask_id = %index, error = %err, "Subtask record left behind");
            }
        }

        if let Some(resource) = progress.resource {
            match self.review.teardown(&resource).await {
                Ok(_) => info!(execution_id, resource, "Review resource deleted"),
                Err(err) => {
                    error!(resource, error = %err, "Review resource needs manual cleanup")
                }
            }
        }
    }
}
