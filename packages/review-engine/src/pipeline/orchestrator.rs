//! Job orchestration: the state machine, scheduling and the aggregation
//! barrier.
//!
//! Every job gets a runner task, a cancellation token and a lock over its
//! record. All state transitions and event emissions happen under that
//! lock, so sequence numbers follow occurrence order and exactly one
//! terminal event is published per job.
//!
//! Deadlines are layered. Identifying gets `identify_fraction` of the job
//! deadline; processing runs until the job deadline minus the verification
//! reserve (`verify_fraction`); verification gets its reserve, clipped to
//! the job deadline. Each collaborator call carries its own timeout inside
//! those windows.

use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::assemble::{assemble, missing_elements, AssemblyInput};
use super::classify::{classify, decompose, Classification};
use super::evaluate::{EvaluationUnit, TaskRun};
use super::history::{compare_results, rating_distribution, RatingDistribution, ResultComparison};
use super::verify::CitationVerifier;
use crate::error::{ErrorCode, Result, ReviewError};
use crate::stores::memory::MemoryJobStore;
use crate::traits::knowledge::{AuthoritativeSource, KnowledgeSource};
use crate::traits::model::LanguageModel;
use crate::traits::publisher::{EventPublisher, NullPublisher};
use crate::traits::store::JobStore;
use crate::types::config::ReviewConfig;
use crate::types::event::{EventKind, ProgressEvent};
use crate::types::ids::{JobId, TenantId};
use crate::types::job::{
    JobError, JobFilter, JobState, JobSummary, ResultStatus, ReviewInput, ReviewJob, ReviewRequest,
    TargetMatch,
};
use crate::types::ontology::{Criterion, CriterionId, Ontology};
use crate::types::result::{FailedCriterion, ReviewResult};
use crate::types::task::{EvaluationTask, TaskFailure, TaskStatus};

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    model: Arc<dyn LanguageModel>,
    authority: Arc<dyn AuthoritativeSource>,
    sources: Vec<Arc<dyn KnowledgeSource>>,
    store: Option<Arc<dyn JobStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    ontology: Ontology,
    tenant_ontologies: HashMap<TenantId, Ontology>,
    config: ReviewConfig,
    tenant_configs: HashMap<TenantId, ReviewConfig>,
}

impl OrchestratorBuilder {
    pub fn new(model: Arc<dyn LanguageModel>, authority: Arc<dyn AuthoritativeSource>) -> Self {
        Self {
            model,
            authority,
            sources: Vec::new(),
            store: None,
            publisher: None,
            ontology: Ontology::default(),
            tenant_ontologies: HashMap::new(),
            config: ReviewConfig::default(),
            tenant_configs: HashMap::new(),
        }
    }

    /// Add a knowledge source queried for every criterion.
    pub fn with_source(mut self, source: Arc<dyn KnowledgeSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Job store. Defaults to [`MemoryJobStore`].
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Progress event sink. Defaults to [`NullPublisher`].
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Ontology used for tenants without their own.
    pub fn with_ontology(mut self, ontology: Ontology) -> Self {
        self.ontology = ontology;
        self
    }

    pub fn with_tenant_ontology(mut self, tenant_id: TenantId, ontology: Ontology) -> Self {
        self.tenant_ontologies.insert(tenant_id, ontology);
        self
    }

    /// Base configuration. Its worker counts size the shared pools.
    pub fn with_config(mut self, config: ReviewConfig) -> Self {
        self.config = config;
        self
    }

    /// Per-tenant override. Pool sizes always come from the base config.
    pub fn with_tenant_config(mut self, tenant_id: TenantId, config: ReviewConfig) -> Self {
        self.tenant_configs.insert(tenant_id, config);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        for (tenant_id, config) in &self.tenant_configs {
            config
                .validate()
                .map_err(|e| ReviewError::Config(format!("tenant {tenant_id}: {e}")))?;
        }

        let inner = Inner {
            evaluation_permits: Arc::new(Semaphore::new(self.config.evaluation_workers)),
            verification_permits: Arc::new(Semaphore::new(self.config.verification_workers)),
            model: self.model,
            authority: self.authority,
            sources: Arc::new(self.sources),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryJobStore::new())),
            publisher: self.publisher.unwrap_or_else(|| Arc::new(NullPublisher)),
            ontology: self.ontology,
            tenant_ontologies: self.tenant_ontologies,
            config: Arc::new(self.config),
            tenant_configs: self
                .tenant_configs
                .into_iter()
                .map(|(tenant, config)| (tenant, Arc::new(config)))
                .collect(),
            live: StdMutex::new(HashMap::new()),
        };
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}

/// Runs review jobs. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    model: Arc<dyn LanguageModel>,
    authority: Arc<dyn AuthoritativeSource>,
    sources: Arc<Vec<Arc<dyn KnowledgeSource>>>,
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn EventPublisher>,
    ontology: Ontology,
    tenant_ontologies: HashMap<TenantId, Ontology>,
    config: Arc<ReviewConfig>,
    tenant_configs: HashMap<TenantId, Arc<ReviewConfig>>,
    evaluation_permits: Arc<Semaphore>,
    verification_permits: Arc<Semaphore>,
    live: StdMutex<HashMap<JobId, Arc<LiveJob>>>,
}

/// A job whose runner is still alive.
struct LiveJob {
    id: JobId,
    cancel: CancellationToken,
    cell: Mutex<JobCell>,
}

struct JobCell {
    job: ReviewJob,
    next_sequence: u64,
}

impl JobCell {
    fn event(
        &mut self,
        kind: EventKind,
        criterion: Option<CriterionId>,
        message: String,
    ) -> ProgressEvent {
        let event = ProgressEvent {
            job_id: self.job.id,
            sequence: self.next_sequence,
            stage: self.job.state,
            kind,
            criterion,
            message,
            at: Utc::now(),
        };
        self.next_sequence += 1;
        event
    }
}

impl Orchestrator {
    pub fn builder(
        model: Arc<dyn LanguageModel>,
        authority: Arc<dyn AuthoritativeSource>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(model, authority)
    }

    /// Base configuration.
    pub fn config(&self) -> &ReviewConfig {
        &self.inner.config
    }

    /// Validate and persist a job, spawn its runner and return immediately.
    pub async fn start(&self, request: ReviewRequest) -> Result<JobId> {
        let inner = &self.inner;
        if request.input.text().trim().is_empty() {
            return Err(ReviewError::InvalidRequest {
                reason: "input text is empty".into(),
            });
        }
        if request.deadline_ms == Some(0) {
            return Err(ReviewError::InvalidRequest {
                reason: "deadline must be positive".into(),
            });
        }
        let ontology = inner.ontology_for(request.tenant_id);
        if ontology.is_empty() {
            return Err(ReviewError::InvalidRequest {
                reason: format!("no ontology configured for tenant {}", request.tenant_id),
            });
        }
        if let Some(entry_id) = &request.confirmed_target {
            if ontology.entry(entry_id).is_none() {
                return Err(ReviewError::InvalidRequest {
                    reason: format!("unknown ontology entry {entry_id}"),
                });
            }
        }

        let config = inner.config_for(request.tenant_id);
        let deadline_ms = request.deadline_ms.unwrap_or(config.default_deadline_ms);
        let job = ReviewJob::new(&request, deadline_ms);
        let job_id = job.id;
        let deadline = Instant::now() + job.deadline();

        inner.store.insert(&job).await?;
        let live = Arc::new(LiveJob {
            id: job_id,
            cancel: CancellationToken::new(),
            cell: Mutex::new(JobCell {
                job,
                next_sequence: 0,
            }),
        });
        inner.live_jobs().insert(job_id, live.clone());
        inner.emit(&live, None, "review job accepted").await;

        info!(
            %job_id,
            tenant_id = %request.tenant_id,
            deadline_ms,
            question = request.input.is_question(),
            "review job started"
        );

        let runner = inner.clone();
        tokio::spawn(runner.run(live, request.confirmed_target, config, deadline));
        Ok(job_id)
    }

    /// Cancel a job. Idempotent: a job that already ended keeps, and
    /// returns, its terminal state.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobState> {
        if let Some(live) = self.inner.live_job(job_id) {
            let mut cell = live.cell.lock().await;
            if cell.job.is_terminal() {
                return Ok(cell.job.state);
            }
            live.cancel.cancel();
            self.inner
                .finish_locked(&mut cell, JobState::Cancelled, None, None)
                .await;
            info!(%job_id, "review job cancelled");
            return Ok(JobState::Cancelled);
        }

        match self.inner.store.get(job_id).await? {
            Some(job) if job.is_terminal() => Ok(job.state),
            Some(job) => {
                // No runner owns this job any more; close the record and
                // start a fresh stream that holds only the terminal event.
                let mut cell = JobCell {
                    job,
                    next_sequence: 0,
                };
                self.inner
                    .finish_locked(&mut cell, JobState::Cancelled, None, None)
                    .await;
                info!(%job_id, "orphaned review job cancelled");
                Ok(cell.job.state)
            }
            None => Err(ReviewError::JobNotFound(job_id)),
        }
    }

    /// The result if the job is `Complete`, otherwise why not.
    pub async fn get_result(&self, job_id: JobId) -> Result<ResultStatus> {
        let job = self.get_job(job_id).await?;
        match job.state {
            JobState::Complete => job
                .result
                .map(|result| ResultStatus::Ready(Box::new(result)))
                .ok_or_else(|| ReviewError::Internal(format!("job {job_id} complete without result"))),
            JobState::Error => Ok(ResultStatus::Failed(job.error.unwrap_or_else(|| {
                JobError::new(ErrorCode::InternalFault, "job failed without an error record")
            }))),
            JobState::Cancelled => Ok(ResultStatus::Cancelled),
            state => Ok(ResultStatus::Pending(state)),
        }
    }

    /// Current job record.
    pub async fn get_job(&self, job_id: JobId) -> Result<ReviewJob> {
        if let Some(live) = self.inner.live_job(job_id) {
            return Ok(live.cell.lock().await.job.clone());
        }
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or(ReviewError::JobNotFound(job_id))
    }

    pub async fn list_jobs(&self, tenant_id: TenantId, filter: &JobFilter) -> Result<Vec<JobSummary>> {
        self.inner.store.list(tenant_id, filter).await
    }

    /// Compare two completed jobs of the same tenant and target.
    pub async fn compare(&self, before: JobId, after: JobId) -> Result<ResultComparison> {
        let before = self.get_job(before).await?;
        let after = self.get_job(after).await?;
        if before.tenant_id != after.tenant_id {
            return Err(ReviewError::InvalidRequest {
                reason: "jobs belong to different tenants".into(),
            });
        }
        let (Some(a), Some(b)) = (&before.result, &after.result) else {
            return Err(ReviewError::InvalidRequest {
                reason: "both jobs must be complete".into(),
            });
        };
        compare_results(a, b)
    }

    /// Overall rating counts over a tenant's completed jobs, optionally for
    /// one ontology entry.
    pub async fn rating_distribution(
        &self,
        tenant_id: TenantId,
        entry_id: Option<&str>,
    ) -> Result<RatingDistribution> {
        let results = match entry_id {
            Some(entry_id) => self.inner.store.completed_for_target(tenant_id, entry_id).await?,
            None => self.inner.store.completed_results(tenant_id).await?,
        };
        Ok(rating_distribution(&results))
    }
}

impl Inner {
    fn config_for(&self, tenant_id: TenantId) -> Arc<ReviewConfig> {
        self.tenant_configs
            .get(&tenant_id)
            .cloned()
            .unwrap_or_else(|| self.config.clone())
    }

    fn ontology_for(&self, tenant_id: TenantId) -> &Ontology {
        self.tenant_ontologies
            .get(&tenant_id)
            .unwrap_or(&self.ontology)
    }

    fn live_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<LiveJob>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_job(&self, job_id: JobId) -> Option<Arc<LiveJob>> {
        self.live_jobs().get(&job_id).cloned()
    }

    async fn persist(&self, job: &ReviewJob) {
        if let Err(e) = self.store.update(job).await {
            warn!(job_id = %job.id, error = %e, "failed to persist job");
        }
    }

    /// Publish a progress event unless the job already ended.
    async fn emit(&self, live: &LiveJob, criterion: Option<CriterionId>, message: impl Into<String>) {
        let mut cell = live.cell.lock().await;
        if cell.job.is_terminal() {
            return;
        }
        let event = cell.event(EventKind::Progress, criterion, message.into());
        self.publisher.publish(event);
    }

    /// Move a running job to `next`. Returns false if the job already ended.
    async fn transition(&self, live: &LiveJob, next: JobState, message: impl Into<String>) -> bool {
        let mut cell = live.cell.lock().await;
        if cell.job.is_terminal() {
            return false;
        }
        if !cell.job.state.can_transition_to(next) {
            let error = JobError::new(
                ErrorCode::InternalFault,
                format!("illegal transition {} -> {}", cell.job.state, next),
            );
            self.finish_locked(&mut cell, JobState::Error, Some(error), None)
                .await;
            return false;
        }

        info!(from = %cell.job.state, to = %next, "job state changed");
        cell.job.state = next;
        cell.job.updated_at = Utc::now();
        let event = cell.event(EventKind::Progress, None, message.into());
        self.publisher.publish(event);
        self.persist(&cell.job).await;
        true
    }

    async fn fail(&self, live: &LiveJob, error: JobError) -> bool {
        warn!(code = %error.code, message = %error.message, "review job failed");
        let mut cell = live.cell.lock().await;
        self.finish_locked(&mut cell, JobState::Error, Some(error), None)
            .await
    }

    async fn complete(&self, live: &LiveJob, result: ReviewResult) -> bool {
        let mut cell = live.cell.lock().await;
        for task in cell.job.tasks.iter_mut() {
            task.citations = result
                .citations
                .iter()
                .filter(|c| c.criterion_id == task.criterion_id)
                .cloned()
                .collect();
        }
        self.finish_locked(&mut cell, JobState::Complete, None, Some(result))
            .await
    }

    /// Enter a terminal state and publish the terminal event. The caller
    /// holds the job lock.
    async fn finish_locked(
        &self,
        cell: &mut JobCell,
        state: JobState,
        error: Option<JobError>,
        result: Option<ReviewResult>,
    ) -> bool {
        if cell.job.is_terminal() || !cell.job.state.can_transition_to(state) {
            return false;
        }
        let Some(kind) = EventKind::for_terminal_state(state) else {
            return false;
        };

        let leftover = match (&state, &error) {
            (JobState::Cancelled, _) => Some(TaskFailure::new(ErrorCode::Cancelled, "job cancelled")),
            (JobState::Error, Some(error)) => Some(TaskFailure::new(error.code, "job failed")),
            _ => None,
        };
        if let Some(failure) = leftover {
            for task in cell.job.tasks.iter_mut().filter(|t| !t.is_terminal()) {
                task.fail(failure.clone());
            }
        }

        let now = Utc::now();
        cell.job.state = state;
        cell.job.error = error;
        cell.job.result = result;
        cell.job.finished_at = Some(now);
        cell.job.updated_at = now;

        let message = match (&cell.job.result, &cell.job.error) {
            (Some(result), _) => format!(
                "review complete: overall {}, confidence {:?}",
                result.overall, result.confidence
            )
            .to_lowercase(),
            (None, Some(error)) => error.to_string(),
            (None, None) => "review job cancelled".to_string(),
        };
        let event = cell.event(kind, None, message);
        self.publisher.publish(event);
        self.persist(&cell.job).await;

        info!(job_id = %cell.job.id, state = %state, "review job finished");
        true
    }

    #[instrument(skip_all, fields(job_id = %live.id))]
    async fn run(
        self: Arc<Self>,
        live: Arc<LiveJob>,
        confirmed_target: Option<String>,
        config: Arc<ReviewConfig>,
        deadline: Instant,
    ) {
        match self.drive(&live, confirmed_target, &config, deadline).await {
            Ok(()) => {}
            Err(ReviewError::Cancelled) => debug!("runner stopped after cancellation"),
            Err(e) => {
                self.fail(&live, JobError::new(e.code(), e.to_string()))
                    .await;
            }
        }
        self.live_jobs().remove(&live.id);
    }

    async fn drive(
        &self,
        live: &LiveJob,
        confirmed_target: Option<String>,
        config: &Arc<ReviewConfig>,
        deadline: Instant,
    ) -> Result<()> {
        let (tenant_id, input, total) = {
            let cell = live.cell.lock().await;
            (cell.job.tenant_id, cell.job.input.clone(), cell.job.deadline())
        };

        // Identifying
        if !self
            .transition(live, JobState::Identifying, "identifying review target")
            .await
        {
            return Ok(());
        }
        let ontology = self.ontology_for(tenant_id);
        let identify_deadline = (Instant::now() + config.identify_budget(total)).min(deadline);

        let target = match confirmed_target {
            Some(entry_id) => {
                let entry = ontology.entry(&entry_id).ok_or_else(|| {
                    ReviewError::Internal(format!("confirmed entry {entry_id} disappeared"))
                })?;
                TargetMatch {
                    entry_id: entry.id.clone(),
                    name: entry.name.clone(),
                    confidence: 1.0,
                }
            }
            None => match classify(
                self.model.as_ref(),
                ontology,
                input.text(),
                config,
                &live.cancel,
                identify_deadline,
            )
            .await
            {
                Ok(Classification::Matched(target)) => target,
                Ok(Classification::Ambiguous(candidates)) => {
                    let message = format!(
                        "no ontology entry matched with confidence of at least {:.2}; confirm one of {} candidate(s)",
                        config.classification_threshold,
                        candidates.len()
                    );
                    self.fail(
                        live,
                        JobError::new(ErrorCode::ClassificationAmbiguous, message)
                            .with_candidates(candidates),
                    )
                    .await;
                    return Ok(());
                }
                Err(ReviewError::Timeout { .. }) => {
                    self.fail(live, stage_timeout("classification", deadline))
                        .await;
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        let entry = ontology
            .entry(&target.entry_id)
            .ok_or_else(|| ReviewError::Internal(format!("unknown entry {}", target.entry_id)))?;
        let criteria = if input.is_question() {
            decompose(
                self.model.as_ref(),
                entry,
                input.text(),
                config,
                &live.cancel,
                identify_deadline,
            )
            .await?
        } else {
            entry.criteria.clone()
        };
        if criteria.is_empty() {
            self.fail(
                live,
                JobError::new(
                    ErrorCode::InternalFault,
                    format!("ontology entry {} has no criteria", entry.id),
                ),
            )
            .await;
            return Ok(());
        }

        {
            let mut cell = live.cell.lock().await;
            if cell.job.is_terminal() {
                return Ok(());
            }
            cell.job.target = Some(target.clone());
            cell.job.criteria = criteria.clone();
            cell.job.tasks = criteria
                .iter()
                .map(|c| EvaluationTask::new(c.id.clone()))
                .collect();
        }
        info!(entry = %target.entry_id, confidence = target.confidence, criteria = criteria.len(), "target identified");

        // Processing
        if !self
            .transition(
                live,
                JobState::Processing,
                format!("evaluating {} criteria for {}", criteria.len(), target.name),
            )
            .await
        {
            return Ok(());
        }
        let processing_deadline = deadline
            .checked_sub(config.verify_budget(total))
            .unwrap_or(deadline);
        let deadline_hit = self
            .process(live, tenant_id, &input, &criteria, config, processing_deadline)
            .await?;

        let (verdicts, failed, citations) = {
            let cell = live.cell.lock().await;
            if cell.job.is_terminal() {
                return Ok(());
            }
            let mut verdicts = Vec::new();
            let mut failed = Vec::new();
            let mut citations = Vec::new();
            for task in &cell.job.tasks {
                match (&task.verdict, &task.failure) {
                    (Some(verdict), _) if task.status == TaskStatus::Succeeded => {
                        verdicts.push(verdict.clone());
                        citations.extend(task.citations.iter().cloned());
                    }
                    (_, Some(failure)) => failed.push(FailedCriterion {
                        criterion_id: task.criterion_id.clone(),
                        failure: failure.clone(),
                    }),
                    _ => {
                        return Err(ReviewError::Internal(format!(
                            "task {} not terminal after barrier",
                            task.criterion_id
                        )))
                    }
                }
            }
            self.persist(&cell.job).await;
            (verdicts, failed, citations)
        };

        if verdicts.is_empty() {
            let (code, message) = if deadline_hit {
                (
                    ErrorCode::JobDeadlineExceeded,
                    "job deadline reached before any criterion was evaluated",
                )
            } else {
                (ErrorCode::NoVerdicts, "every evaluation task failed")
            };
            self.fail(live, JobError::new(code, message)).await;
            return Ok(());
        }

        // VerifyingCitations
        if !self
            .transition(
                live,
                JobState::VerifyingCitations,
                format!("verifying {} citations", citations.len()),
            )
            .await
        {
            return Ok(());
        }
        let verify_deadline = (Instant::now() + config.verify_budget(total)).min(deadline);
        let verifier = CitationVerifier::new(
            self.authority.clone(),
            self.verification_permits.clone(),
            config.clone(),
        );
        let citations = verifier
            .verify(citations, verify_deadline, &live.cancel)
            .await?;

        // Complete
        let missing = match &input {
            ReviewInput::Document { text, .. } => missing_elements(entry, text),
            ReviewInput::Question { .. } => Vec::new(),
        };
        let result = assemble(AssemblyInput {
            job_id: live.id,
            target: &target,
            criteria: &criteria,
            verdicts,
            failed,
            citations,
            missing_elements: missing,
            config: config.as_ref(),
        })?;
        self.complete(live, result).await;
        Ok(())
    }

    /// Fan evaluation tasks out and wait at the barrier. Returns whether the
    /// processing deadline fired.
    async fn process(
        &self,
        live: &LiveJob,
        tenant_id: TenantId,
        input: &ReviewInput,
        criteria: &[Criterion],
        config: &Arc<ReviewConfig>,
        processing_deadline: Instant,
    ) -> Result<bool> {
        let unit = EvaluationUnit::new(self.model.clone(), self.sources.clone(), config.clone());
        let source_text: Arc<str> = Arc::from(input.text());
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<usize>();
        let mut set = JoinSet::new();

        for (index, criterion) in criteria.iter().cloned().enumerate() {
            let unit = unit.clone();
            let permits = self.evaluation_permits.clone();
            let cancel = live.cancel.child_token();
            let started = started_tx.clone();
            let text = source_text.clone();
            let config = config.clone();

            set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return (index, TaskRun {
                            attempts: 0,
                            outcome: Err(TaskFailure::new(ErrorCode::Cancelled, "job cancelled")),
                        });
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(e) => {
                            return (index, TaskRun {
                                attempts: 0,
                                outcome: Err(TaskFailure::new(ErrorCode::InternalFault, e.to_string())),
                            });
                        }
                    },
                };
                let _ = started.send(index);
                let run = run_task(
                    &unit,
                    tenant_id,
                    &criterion,
                    &text,
                    &cancel,
                    &config,
                    processing_deadline,
                )
                .await;
                (index, run)
            });
        }
        drop(started_tx);

        let barrier = tokio::time::sleep_until(processing_deadline);
        tokio::pin!(barrier);
        let mut deadline_hit = false;
        loop {
            tokio::select! {
                biased;
                _ = live.cancel.cancelled() => {
                    set.abort_all();
                    return Err(ReviewError::Cancelled);
                }
                _ = &mut barrier => {
                    while let Ok(index) = started_rx.try_recv() {
                        self.task_started(live, criteria, index).await;
                    }
                    for (index, run) in drain_finished(&mut set) {
                        self.task_finished(live, criteria, index, run).await;
                    }
                    warn!(pending = set.len(), "processing deadline reached, aborting running tasks");
                    set.abort_all();
                    deadline_hit = true;
                    break;
                }
                Some(index) = started_rx.recv() => self.task_started(live, criteria, index).await,
                joined = set.join_next() => match joined {
                    Some(Ok((index, run))) => self.task_finished(live, criteria, index, run).await,
                    Some(Err(e)) => warn!(error = %e, "evaluation task aborted"),
                    None => break,
                },
            }
        }

        if deadline_hit {
            let mut cell = live.cell.lock().await;
            for task in cell.job.tasks.iter_mut().filter(|t| !t.is_terminal()) {
                task.fail(TaskFailure::new(
                    ErrorCode::JobDeadlineExceeded,
                    "job deadline reached before the task finished",
                ));
            }
        }
        Ok(deadline_hit)
    }

    async fn task_started(&self, live: &LiveJob, criteria: &[Criterion], index: usize) {
        let mut cell = live.cell.lock().await;
        if cell.job.is_terminal() {
            return;
        }
        let Some(task) = cell.job.tasks.get_mut(index) else {
            return;
        };
        if task.status != TaskStatus::Pending {
            return;
        }
        task.mark_running();
        let criterion = &criteria[index];
        let event = cell.event(
            EventKind::Progress,
            Some(criterion.id.clone()),
            format!("evaluating {}", criterion.name),
        );
        self.publisher.publish(event);
    }

    async fn task_finished(&self, live: &LiveJob, criteria: &[Criterion], index: usize, run: TaskRun) {
        let mut cell = live.cell.lock().await;
        if cell.job.is_terminal() {
            return;
        }
        let Some(task) = cell.job.tasks.get_mut(index) else {
            return;
        };
        task.attempts = run.attempts;
        let message = match run.outcome {
            Ok(evaluation) => {
                let message = format!("rated {}", evaluation.verdict.rating);
                task.succeed(evaluation.verdict, evaluation.citations);
                message
            }
            Err(failure) => {
                warn!(criterion = %task.criterion_id, code = %failure.code, message = %failure.message, "evaluation task failed");
                let message = format!("not evaluated: {}", failure.code);
                task.fail(failure);
                message
            }
        };
        let event = cell.event(EventKind::Progress, Some(criteria[index].id.clone()), message);
        self.publisher.publish(event);
    }
}

/// One evaluation task under its own timeout, with panics contained.
///
/// A timeout is terminal unless `retry_timeouts` is set and a second full
/// attempt still fits before `deadline`.
async fn run_task(
    unit: &EvaluationUnit,
    tenant_id: TenantId,
    criterion: &Criterion,
    text: &str,
    cancel: &CancellationToken,
    config: &ReviewConfig,
    deadline: Instant,
) -> TaskRun {
    let timeout = config.task_timeout();
    let mut attempts = 0;
    let mut retried = false;
    loop {
        let attempt = AssertUnwindSafe(tokio::time::timeout(
            timeout,
            unit.evaluate(tenant_id, criterion, text, cancel),
        ))
        .catch_unwind()
        .await;

        let run = match attempt {
            Ok(Ok(run)) => run,
            Ok(Err(_)) => TaskRun {
                attempts: 1,
                outcome: Err(TaskFailure::new(
                    ErrorCode::TaskTimeout,
                    format!("task exceeded {}ms", timeout.as_millis()),
                )),
            },
            Err(panic) => TaskRun {
                attempts: 1,
                outcome: Err(TaskFailure::new(
                    ErrorCode::InternalFault,
                    format!("evaluation panicked: {}", panic_message(panic.as_ref())),
                )),
            },
        };
        attempts += run.attempts;

        let timed_out = matches!(&run.outcome, Err(f) if f.code == ErrorCode::TaskTimeout);
        let fits = Instant::now() + timeout <= deadline;
        if timed_out && config.retry_timeouts && !retried && fits && !cancel.is_cancelled() {
            warn!(criterion = %criterion.id, "task timed out, retrying once");
            retried = true;
            continue;
        }
        return TaskRun {
            attempts,
            outcome: run.outcome,
        };
    }
}

/// Outputs of tasks that already finished but were not joined yet.
fn drain_finished<T: 'static>(set: &mut JoinSet<T>) -> Vec<T> {
    let mut finished = Vec::new();
    while let Some(joined) = set.try_join_next() {
        match joined {
            Ok(output) => finished.push(output),
            Err(e) => warn!(error = %e, "evaluation task aborted"),
        }
    }
    finished
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Job error for a stage that ran out of time.
fn stage_timeout(stage: &str, deadline: Instant) -> JobError {
    if Instant::now() >= deadline {
        JobError::new(
            ErrorCode::JobDeadlineExceeded,
            format!("job deadline reached during {stage}"),
        )
    } else {
        JobError::new(
            ErrorCode::TaskTimeout,
            format!("{stage} did not finish within its time budget"),
        )
    }
}
