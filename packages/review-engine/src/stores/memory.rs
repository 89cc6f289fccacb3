//! In-memory job store for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::traits::store::JobStore;
use crate::types::ids::{JobId, TenantId};
use crate::types::job::{JobFilter, JobState, JobSummary, ReviewJob};
use crate::types::result::ReviewResult;

/// In-memory job storage.
///
/// Not suitable for production as jobs are lost on restart.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, ReviewJob>>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of stored jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    /// Clear all stored jobs.
    pub fn clear(&self) {
        self.jobs.write().unwrap().clear();
    }

    /// Tenant's jobs matching `keep`, newest first.
    fn tenant_jobs(&self, tenant_id: TenantId, keep: impl Fn(&ReviewJob) -> bool) -> Vec<ReviewJob> {
        let mut jobs: Vec<ReviewJob> = self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|job| job.tenant_id == tenant_id && keep(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs
    }

    fn completed(&self, tenant_id: TenantId, entry_id: Option<&str>) -> Vec<ReviewResult> {
        self.tenant_jobs(tenant_id, |job| {
            job.state == JobState::Complete
                && entry_id.map_or(true, |id| {
                    job.target.as_ref().map(|t| t.entry_id.as_str()) == Some(id)
                })
        })
        .into_iter()
        .filter_map(|job| job.result)
        .collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &ReviewJob) -> Result<()> {
        self.jobs.write().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn update(&self, job: &ReviewJob) -> Result<()> {
        self.jobs.write().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<ReviewJob>> {
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    async fn list(&self, tenant_id: TenantId, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        let summaries = self
            .tenant_jobs(tenant_id, |job| filter.matches(job))
            .iter()
            .map(ReviewJob::summary)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(summaries)
    }

    async fn completed_for_target(
        &self,
        tenant_id: TenantId,
        entry_id: &str,
    ) -> Result<Vec<ReviewResult>> {
        Ok(self.completed(tenant_id, Some(entry_id)))
    }

    async fn completed_results(&self, tenant_id: TenantId) -> Result<Vec<ReviewResult>> {
        Ok(self.completed(tenant_id, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use crate::types::ids::RequesterId;
    use crate::types::job::{ReviewInput, ReviewRequest};
    use crate::types::verdict::Rating;

    fn job(tenant_id: TenantId) -> ReviewJob {
        let request = ReviewRequest::new(
            tenant_id,
            RequesterId::new(),
            ReviewInput::question("Do we need a DPO?"),
        );
        ReviewJob::new(&request, 10_000)
    }

    fn completed_job(tenant_id: TenantId, target: &str, rating: Rating) -> ReviewJob {
        let mut job = job(tenant_id);
        let mut result = fixtures::result(target, &[("a", rating)]);
        result.job_id = job.id;
        job.target = Some(result.target.clone());
        job.state = JobState::Complete;
        job.result = Some(result);
        job
    }

    #[tokio::test]
    async fn test_insert_get_update() {
        let store = MemoryJobStore::new();
        let mut job = job(TenantId::new());

        store.insert(&job).await.unwrap();
        assert_eq!(store.job_count(), 1);

        job.state = JobState::Identifying;
        store.update(&job).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Identifying);
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_tenant_scoped_and_limited() {
        let store = MemoryJobStore::new();
        let tenant = TenantId::new();
        for _ in 0..3 {
            store.insert(&job(tenant)).await.unwrap();
        }
        store.insert(&job(TenantId::new())).await.unwrap();

        let all = store.list(tenant, &JobFilter::new()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|s| s.tenant_id == tenant));
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let limited = store
            .list(tenant, &JobFilter::new().with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_for_target_skips_other_targets_and_states() {
        let store = MemoryJobStore::new();
        let tenant = TenantId::new();
        store
            .insert(&completed_job(tenant, "privacy", Rating::Green))
            .await
            .unwrap();
        store
            .insert(&completed_job(tenant, "privacy", Rating::Red))
            .await
            .unwrap();
        store
            .insert(&completed_job(tenant, "hr", Rating::Amber))
            .await
            .unwrap();
        store.insert(&job(tenant)).await.unwrap();

        let privacy = store.completed_for_target(tenant, "privacy").await.unwrap();
        assert_eq!(privacy.len(), 2);
        assert!(privacy.iter().all(|r| r.target.entry_id == "privacy"));

        let all = store.completed_results(tenant).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(store
            .completed_results(TenantId::new())
            .await
            .unwrap()
            .is_empty());
    }
}
