//! Job persistence trait.
//!
//! Jobs and their results are stored keyed by job id and tenant id, enough
//! to list jobs, compare two results of the same target and aggregate
//! rating distributions without re-running anything.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ids::{JobId, TenantId};
use crate::types::job::{JobFilter, JobSummary, ReviewJob};
use crate::types::result::ReviewResult;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly created job.
    async fn insert(&self, job: &ReviewJob) -> Result<()>;

    /// Replace the stored job with its latest state.
    async fn update(&self, job: &ReviewJob) -> Result<()>;

    /// Get a job by id.
    async fn get(&self, id: JobId) -> Result<Option<ReviewJob>>;

    /// List jobs for a tenant, newest first.
    async fn list(&self, tenant_id: TenantId, filter: &JobFilter) -> Result<Vec<JobSummary>>;

    /// Results of completed jobs for one ontology entry, newest first.
    async fn completed_for_target(
        &self,
        tenant_id: TenantId,
        entry_id: &str,
    ) -> Result<Vec<ReviewResult>>;

    /// Results of all completed jobs for a tenant.
    async fn completed_results(&self, tenant_id: TenantId) -> Result<Vec<ReviewResult>>;
}
