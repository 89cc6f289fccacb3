//! End-to-end review jobs against mock collaborators.
//!
//! Time is paused in every test, so deadlines and delays run instantly and
//! deterministically.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use review_engine::testing::fixtures::{self, PRIVACY_CRITERIA};
use review_engine::testing::{MockAuthority, MockKnowledgeSource, MockModel, MockReply, RecordingPublisher};
use review_engine::{
    Change, Confidence, ErrorCode, EventHub, EventKind, GapKind, JobFilter, JobId, JobState,
    KnowledgeSource, Locator, Ontology, OntologyEntry, Orchestrator, Rating, ResultStatus,
    ReviewConfig, ReviewError, ReviewJob, ReviewRequest, ReviewResult, SourceKind, TaskStatus,
    TenantId, VerificationStatus,
};
use tokio::time::Instant;

const GDPR_TEXT: &str = "Personal data shall be processed lawfully, fairly and in a transparent manner.";
const GDPR_QUOTE: &str = "personal data shall be processed lawfully";

struct Harness {
    orchestrator: Orchestrator,
    model: Arc<MockModel>,
    authority: Arc<MockAuthority>,
    events: Arc<RecordingPublisher>,
    sources: Vec<Arc<MockKnowledgeSource>>,
    tenant: TenantId,
}

fn green() -> String {
    fixtures::verdict_json(
        Rating::Green,
        "The policy meets the criterion.",
        &[("GDPR", "Art. 5", GDPR_QUOTE)],
    )
}

fn red() -> String {
    fixtures::verdict_json(
        Rating::Red,
        "The policy does not address the criterion.",
        &[("GDPR", "Art. 5", GDPR_QUOTE)],
    )
}

/// Classifies as privacy; `overrides` win over the all-green defaults.
fn model(overrides: Vec<(&str, Vec<MockReply>)>) -> MockModel {
    let mut model = MockModel::new().with_classification(&[("privacy", 0.92), ("hr", 0.05)]);
    for (name, replies) in overrides {
        model = model.with_verdict_replies(name, replies);
    }
    for name in PRIVACY_CRITERIA {
        model = model.with_verdict(name, green());
    }
    model
}

fn library() -> MockKnowledgeSource {
    MockKnowledgeSource::new("policy library", SourceKind::TenantDocument)
        .with_excerpt("privacy.pdf", "We process personal data lawfully and report breaches.")
}

fn authority() -> MockAuthority {
    MockAuthority::new().with_text(
        Locator::new(SourceKind::Legislation, "GDPR").with_section("Art. 5"),
        GDPR_TEXT,
    )
}

fn harness(model: MockModel, sources: Vec<MockKnowledgeSource>, authority: MockAuthority) -> Harness {
    harness_with(model, sources, authority, fixtures::ontology(), ReviewConfig::default())
}

fn harness_with(
    model: MockModel,
    sources: Vec<MockKnowledgeSource>,
    authority: MockAuthority,
    ontology: Ontology,
    config: ReviewConfig,
) -> Harness {
    let model = Arc::new(model);
    let authority = Arc::new(authority);
    let events = RecordingPublisher::new();

    let mut builder = Orchestrator::builder(model.clone(), authority.clone())
        .with_ontology(ontology)
        .with_config(config)
        .with_publisher(events.clone());
    let sources: Vec<Arc<MockKnowledgeSource>> = sources.into_iter().map(Arc::new).collect();
    for source in &sources {
        builder = builder.with_source(source.clone() as Arc<dyn KnowledgeSource>);
    }

    Harness {
        orchestrator: builder.build().unwrap(),
        model,
        authority,
        events,
        sources,
        tenant: TenantId::new(),
    }
}

impl Harness {
    async fn run(&self, request: ReviewRequest) -> (JobId, ReviewJob) {
        let job_id = self.orchestrator.start(request).await.unwrap();
        self.events.wait_for_terminal(job_id).await;
        let job = self.orchestrator.get_job(job_id).await.unwrap();
        (job_id, job)
    }

    async fn result(&self, job_id: JobId) -> ReviewResult {
        match self.orchestrator.get_result(job_id).await.unwrap() {
            ResultStatus::Ready(result) => *result,
            other => panic!("expected a ready result, got {other:?}"),
        }
    }

    fn document(&self) -> ReviewRequest {
        fixtures::document_request(self.tenant)
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_green_and_verified_is_green_high() {
    let h = harness(model(vec![]), vec![library()], authority());
    let (job_id, job) = h.run(h.document()).await;

    assert_eq!(job.state, JobState::Complete);
    let result = h.result(job_id).await;
    assert_eq!(result.overall, Rating::Green);
    assert_eq!(result.confidence, Confidence::High);
    assert_eq!(result.verdicts.len(), 5);
    assert!(result.gaps.is_empty());
    assert!(result
        .citations
        .iter()
        .all(|c| c.status == VerificationStatus::Verified));
    // Identical citations share one lookup.
    assert_eq!(h.authority.lookup_count(), 1);
    assert!(job.tasks.iter().all(|t| t.status == TaskStatus::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_red_makes_overall_red() {
    let h = harness(
        model(vec![("Breach notification", vec![MockReply::text(red())])]),
        vec![library()],
        authority(),
    );
    let (job_id, _) = h.run(h.document()).await;

    let result = h.result(job_id).await;
    assert_eq!(result.overall, Rating::Red);
    assert_eq!(result.verdict("p2").map(|v| v.rating), Some(Rating::Red));
    let gap = result.gaps_for("p2").next().unwrap();
    assert_eq!(gap.kind, GapKind::NonGreen { rating: Rating::Red });
    assert!(result.actions.iter().any(|a| a.criteria.contains(&"p2".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_no_excerpts_caps_at_amber_with_gap() {
    let empty = MockKnowledgeSource::new("policy library", SourceKind::TenantDocument);
    let h = harness(model(vec![]), vec![empty], authority());
    let (job_id, _) = h.run(h.document()).await;

    let result = h.result(job_id).await;
    assert_eq!(result.overall, Rating::Amber);
    assert!(result.verdicts.iter().all(|v| v.rating == Rating::Amber && v.capped));
    assert!(result.confidence <= Confidence::Medium);

    let no_evidence: Vec<_> = result
        .gaps
        .iter()
        .filter(|g| g.kind == GapKind::NoEvidence)
        .collect();
    assert_eq!(no_evidence.len(), 5);
    assert!(no_evidence.iter().all(|g| g.detail.starts_with("no evidence found")));
    assert!(result.verdicts[0]
        .justification
        .contains("No evidence found in: policy library."));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_with_running_tasks_completes_with_partial_verdicts() {
    let slow = || vec![MockReply::text(green()).after(Duration::from_secs(60))];
    let h = harness(
        model(vec![("Data subject rights", slow()), ("Retention schedule", slow())]),
        vec![library()],
        authority(),
    );

    let started = Instant::now();
    let (job_id, job) = h
        .run(h.document().with_deadline(Duration::from_secs(10)))
        .await;
    assert!(started.elapsed() <= Duration::from_secs(10));

    assert_eq!(job.state, JobState::Complete);
    let result = h.result(job_id).await;
    assert_eq!(result.verdicts.len(), 3);
    assert_eq!(result.failed.len(), 2);
    assert!(result
        .failed
        .iter()
        .all(|f| f.failure.code == ErrorCode::JobDeadlineExceeded));
    assert!(result.confidence <= Confidence::Medium);
    assert!(result.gaps.iter().any(|g| g.kind == GapKind::NotEvaluated));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_authority_removes_citations_and_completes() {
    let h = harness(model(vec![]), vec![library()], authority().unreachable());
    let (job_id, job) = h.run(h.document()).await;

    assert_eq!(job.state, JobState::Complete);
    let result = h.result(job_id).await;
    assert!(result
        .citations
        .iter()
        .all(|c| c.status == VerificationStatus::Removed));
    assert!(result.citations[0]
        .note
        .as_deref()
        .unwrap_or_default()
        .starts_with("verification_unavailable"));
    assert!(result
        .verdicts
        .iter()
        .all(|v| v.justification.starts_with("This assessment is uncertain")));
    assert!(result
        .verdicts
        .iter()
        .all(|v| v.rating != Rating::Green && v.capped));
    assert_eq!(result.overall, Rating::Amber);
    assert_eq!(result.confidence, Confidence::Low);
}

#[tokio::test(start_paused = true)]
async fn test_low_classification_confidence_errors_with_candidates() {
    let ontology = Ontology::new(vec![
        fixtures::privacy_entry(),
        OntologyEntry::new("hr", "HR handbook"),
        OntologyEntry::new("security", "Information security policy"),
        OntologyEntry::new("retention", "Records retention policy"),
    ]);
    let model = MockModel::new().with_classification(&[
        ("privacy", 0.45),
        ("hr", 0.30),
        ("security", 0.20),
        ("retention", 0.05),
    ]);
    let h = harness_with(model, vec![library()], authority(), ontology, ReviewConfig::default());
    let (job_id, job) = h.run(h.document()).await;

    assert_eq!(job.state, JobState::Error);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::ClassificationAmbiguous);
    let ids: Vec<_> = error.candidates.iter().map(|c| c.entry_id.as_str()).collect();
    assert_eq!(ids, vec!["privacy", "hr", "security"]);

    assert!(h
        .events
        .events_for(job_id)
        .iter()
        .all(|e| e.stage != JobState::Processing));
    assert_eq!(h.model.calls_for("structured_verdict"), 0);
    assert!(matches!(
        h.orchestrator.get_result(job_id).await.unwrap(),
        ResultStatus::Failed(e) if e.code == ErrorCode::ClassificationAmbiguous
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_classification_is_malformed_output() {
    let model = MockModel::new().with_replies(
        "classification",
        None,
        vec![MockReply::text("not json"), MockReply::text("still not json")],
    );
    let h = harness(model, vec![library()], authority());
    let (job_id, job) = h.run(h.document()).await;

    assert_eq!(job.state, JobState::Error);
    let error = job.error.unwrap();
    assert_eq!(error.code, ErrorCode::MalformedOutput);
    assert!(error.candidates.is_empty());
    assert_eq!(h.model.calls_for("classification"), 2);
    assert_eq!(h.model.calls_for("structured_verdict"), 0);
    assert_eq!(h.events.terminal_events(job_id)[0].kind, EventKind::Error);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_target_skips_classification() {
    let model = MockModel::new().with_classification(&[("privacy", 0.1)]);
    let model = PRIVACY_CRITERIA
        .iter()
        .fold(model, |m, name| m.with_verdict(name, green()));
    let h = harness(model, vec![library()], authority());

    let (_, job) = h.run(h.document().with_confirmed_target("privacy")).await;
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(h.model.calls_for("classification"), 0);
    assert_eq!(job.target.map(|t| t.confidence), Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_idempotent_with_single_terminal_event() {
    let slow = || vec![MockReply::text(green()).after(Duration::from_secs(100))];
    let overrides = PRIVACY_CRITERIA.iter().map(|name| (*name, slow())).collect();
    let h = harness(model(overrides), vec![library()], authority());

    let job_id = h.orchestrator.start(h.document()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(matches!(
        h.orchestrator.get_result(job_id).await.unwrap(),
        ResultStatus::Pending(JobState::Processing)
    ));

    assert_eq!(h.orchestrator.cancel(job_id).await.unwrap(), JobState::Cancelled);
    let model_calls = h.model.call_count();
    let searches = h.sources[0].search_count();
    assert_eq!(h.orchestrator.cancel(job_id).await.unwrap(), JobState::Cancelled);
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(h.orchestrator.cancel(job_id).await.unwrap(), JobState::Cancelled);

    // Nothing new reaches the collaborators once cancel has returned.
    assert_eq!(h.model.call_count(), model_calls);
    assert_eq!(h.sources[0].search_count(), searches);

    let terminal = h.events.terminal_events(job_id);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, EventKind::Cancelled);
    assert_eq!(h.events.events_for(job_id).last(), terminal.last());

    let job = h.orchestrator.get_job(job_id).await.unwrap();
    assert!(job.tasks.iter().all(|t| t.is_terminal() && t.verdict.is_none()));
    assert!(matches!(
        h.orchestrator.get_result(job_id).await.unwrap(),
        ResultStatus::Cancelled
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_completion_keeps_state() {
    let h = harness(model(vec![]), vec![library()], authority());
    let (job_id, _) = h.run(h.document()).await;

    assert_eq!(h.orchestrator.cancel(job_id).await.unwrap(), JobState::Complete);
    assert_eq!(h.events.terminal_events(job_id).len(), 1);
    assert!(matches!(
        h.orchestrator.cancel(JobId::new()).await,
        Err(ReviewError::JobNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_events_are_gap_free_and_end_with_terminal() {
    let h = harness(model(vec![]), vec![library()], authority());
    let (job_id, _) = h.run(h.document()).await;

    let events = h.events.events_for(job_id);
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..events.len() as u64).collect::<Vec<_>>());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::Complete));

    let stages: Vec<JobState> = events.iter().map(|e| e.stage).collect();
    let first = |state| stages.iter().position(|s| *s == state).unwrap();
    assert!(first(JobState::Identifying) < first(JobState::Processing));
    assert!(first(JobState::Processing) < first(JobState::VerifyingCitations));
    assert!(events
        .iter()
        .any(|e| e.criterion.as_deref() == Some("p1") && e.message.starts_with("rated")));
}

#[tokio::test(start_paused = true)]
async fn test_event_hub_stream_ends_after_terminal() {
    let model = Arc::new(model(vec![]));
    let hub = EventHub::new();
    let orchestrator = Orchestrator::builder(model, Arc::new(authority()))
        .with_ontology(fixtures::ontology())
        .with_source(Arc::new(library()))
        .with_publisher(Arc::new(hub.clone()))
        .build()
        .unwrap();

    let job_id = orchestrator
        .start(fixtures::document_request(TenantId::new()))
        .await
        .unwrap();
    let events: Vec<_> = hub.subscribe(job_id).collect().await;

    assert_eq!(events.last().map(|e| e.kind), Some(EventKind::Complete));
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test(start_paused = true)]
async fn test_whole_job_deadline_holds_when_model_hangs() {
    let hang = || vec![MockReply::text(green()).after(Duration::from_secs(3_600))];
    let overrides = PRIVACY_CRITERIA.iter().map(|name| (*name, hang())).collect();
    let h = harness(model(overrides), vec![library()], authority());

    let started = Instant::now();
    let (_, job) = h
        .run(h.document().with_deadline(Duration::from_secs(5)))
        .await;

    assert!(started.elapsed() <= Duration::from_secs(5));
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.error.map(|e| e.code), Some(ErrorCode::JobDeadlineExceeded));
}

#[tokio::test(start_paused = true)]
async fn test_hanging_classifier_fails_within_identify_budget() {
    let model = MockModel::new().with_replies(
        "classification",
        None,
        vec![MockReply::text("{}").after(Duration::from_secs(3_600))],
    );
    let h = harness(model, vec![library()], authority());

    let started = Instant::now();
    let (_, job) = h
        .run(h.document().with_deadline(Duration::from_secs(20)))
        .await;

    assert!(started.elapsed() <= Duration::from_secs(20));
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.error.map(|e| e.code), Some(ErrorCode::TaskTimeout));
    assert!(job.tasks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_task_failures_stay_local() {
    let h = harness(
        model(vec![
            ("Lawful basis", vec![MockReply::panic("boom")]),
            ("Retention schedule", vec![MockReply::text("not json")]),
            ("International transfers", vec![MockReply::error("rate limited")]),
        ]),
        vec![library()],
        authority(),
    );
    let (job_id, job) = h.run(h.document()).await;
    assert_eq!(job.state, JobState::Complete);

    let result = h.result(job_id).await;
    let code = |id: &str| {
        result
            .failed
            .iter()
            .find(|f| f.criterion_id == id)
            .map(|f| f.failure.code)
    };
    assert_eq!(code("p1"), Some(ErrorCode::InternalFault));
    assert_eq!(code("p4"), Some(ErrorCode::MalformedOutput));
    assert_eq!(code("p5"), Some(ErrorCode::ProviderError));
    assert_eq!(result.verdicts.len(), 2);
    assert_eq!(result.confidence, Confidence::Low);

    let retried = job.tasks.iter().find(|t| t.criterion_id == "p4").unwrap();
    assert_eq!(retried.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_every_task_failing_is_no_verdicts() {
    let broken = || vec![MockReply::error("provider down")];
    let overrides = PRIVACY_CRITERIA.iter().map(|name| (*name, broken())).collect();
    let h = harness(model(overrides), vec![library()], authority());

    let (_, job) = h.run(h.document()).await;
    assert_eq!(job.state, JobState::Error);
    assert_eq!(job.error.map(|e| e.code), Some(ErrorCode::NoVerdicts));
}

#[tokio::test(start_paused = true)]
async fn test_question_is_decomposed_into_sub_questions() {
    let decomposition = serde_json::json!({
        "sub_questions": [
            {"id": "breach", "question": "Must breaches be reported?", "priority": "high", "evidence": "legislation"},
            {"id": "dpo", "question": "Is a DPO required?", "priority": "medium", "evidence": "legislation"},
        ]
    })
    .to_string();
    let model = MockModel::new()
        .with_classification(&[("privacy", 0.9)])
        .with_replies("decomposition", None, vec![MockReply::text(decomposition)])
        .with_verdict("Must breaches be reported?", green())
        .with_verdict("Is a DPO required?", green());
    let legislation = MockKnowledgeSource::new("legislation", SourceKind::Legislation)
        .with_excerpt("GDPR", GDPR_TEXT);
    let h = harness(model, vec![legislation], authority());

    let request = fixtures::question_request(h.tenant, "What do we owe the regulator?");
    let (job_id, job) = h.run(request).await;

    assert_eq!(job.state, JobState::Complete);
    let ids: Vec<_> = job.criteria.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["breach", "dpo"]);

    let result = h.result(job_id).await;
    assert_eq!(result.overall, Rating::Green);
    assert!(!result.gaps.iter().any(|g| g.kind == GapKind::MissingElement));
}

#[tokio::test(start_paused = true)]
async fn test_missing_structural_element_is_a_gap() {
    let h = harness(model(vec![]), vec![library()], authority());
    let request = ReviewRequest::new(
        h.tenant,
        review_engine::RequesterId::new(),
        review_engine::ReviewInput::document("short.pdf", "Privacy policy. We process personal data."),
    );
    let (job_id, _) = h.run(request).await;

    let result = h.result(job_id).await;
    let missing: Vec<_> = result
        .gaps
        .iter()
        .filter(|g| g.kind == GapKind::MissingElement)
        .map(|g| g.subject.as_str())
        .collect();
    assert_eq!(missing, vec!["Contact details", "Effective date"]);
}

#[tokio::test(start_paused = true)]
async fn test_history_compares_and_aggregates() {
    let h = harness(
        model(vec![(
            "Breach notification",
            vec![MockReply::text(green()), MockReply::text(red())],
        )]),
        vec![library()],
        authority(),
    );
    let (first, _) = h.run(h.document()).await;
    let (second, _) = h.run(h.document()).await;

    let comparison = h.orchestrator.compare(first, second).await.unwrap();
    assert_eq!(comparison.overall_change, Change::Regressed);
    let changed: Vec<_> = comparison.changed().map(|d| d.criterion_id.as_str()).collect();
    assert_eq!(changed, vec!["p2"]);

    let distribution = h
        .orchestrator
        .rating_distribution(h.tenant, Some("privacy"))
        .await
        .unwrap();
    assert_eq!((distribution.green, distribution.red), (1, 1));

    let listed = h
        .orchestrator
        .list_jobs(h.tenant, &JobFilter::new().with_target("privacy"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    assert!(h
        .orchestrator
        .list_jobs(TenantId::new(), &JobFilter::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_up_front() {
    let h = harness(model(vec![]), vec![library()], authority());

    let empty = ReviewRequest::new(
        h.tenant,
        review_engine::RequesterId::new(),
        review_engine::ReviewInput::document("blank.pdf", "   "),
    );
    assert!(matches!(
        h.orchestrator.start(empty).await,
        Err(ReviewError::InvalidRequest { .. })
    ));
    assert!(matches!(
        h.orchestrator
            .start(h.document().with_confirmed_target("unknown"))
            .await,
        Err(ReviewError::InvalidRequest { .. })
    ));
    assert!(matches!(
        h.orchestrator.start(h.document().with_deadline(Duration::ZERO)).await,
        Err(ReviewError::InvalidRequest { .. })
    ));
}
