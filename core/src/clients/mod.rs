//! Call surfaces of the two external collaborators
//!
//! The handler only sees these traits; the Postgres implementations here are
//! the registries the deployment's orchestrator and review service share.

mod review_flows;
mod workflows;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::types::{ResumeOutcome, Resumption, Teardown};

pub use review_flows::PgReviewFlows;
pub use workflows::PgWorkflows;

/// Per-execution human-review resource
#[async_trait]
pub trait ReviewService: Send + Sync {
    /// Register the resource for an execution; creating an existing one is a no-op
    async fn create(&self, resource_name: &str, execution_id: &str) -> Result<(), ClientError>;

    /// Remove the resource; removing a missing one reports `AlreadyRemoved`
    async fn teardown(&self, resource_name: &str) -> Result<Teardown, ClientError>;

    /// Tell reviewers that the resource is open for work
    async fn announce_started(
        &self,
        resource_name: &str,
        execution_id: &str,
    ) -> Result<(), ClientError>;
}

/// Orchestrator pause/resume contract
#[async_trait]
pub trait WorkflowResumer: Send + Sync {
    /// Record that `execution_id` is paused waiting on `token`
    async fn pause(&self, execution_id: &str, token: &str) -> Result<(), ClientError>;

    /// Continue the workflow paused on `token`
    ///
    /// A token that was already used reports `AlreadyConsumed` instead of failing.
    async fn resume(&self, token: &str, outcome: &ResumeOutcome)
        -> Result<Resumption, ClientError>;
}
