//! Compliance Review Engine
//!
//! Evaluates a policy document against a tenant-defined compliance ontology,
//! or answers a free-form compliance question, and produces a rated, cited
//! assessment in which every citation has been re-checked against its
//! authoritative source.
//!
//! # Job lifecycle
//!
//! ```text
//! Pending → Identifying → Processing → VerifyingCitations → Complete
//!                                    (any non-terminal) → Cancelled | Error
//! ```
//!
//! - **Identifying**: classify the input against the ontology (questions are
//!   also split into sub-questions)
//! - **Processing**: one evaluation unit per criterion, run concurrently on a
//!   bounded pool, joined at an aggregation barrier bound to the deadline
//! - **VerifyingCitations**: every citation is looked up and matched against
//!   the authoritative text; failures are removed, never passed through
//! - **Complete**: rollup, gaps, actions and a confidence tier
//!
//! # Usage
//!
//! ```rust,ignore
//! use review_engine::{EventHub, Orchestrator, ReviewRequest, ReviewInput};
//! use review_engine::testing::{MockModel, MockAuthority};
//!
//! let hub = EventHub::new();
//! let orchestrator = Orchestrator::builder(Arc::new(MockModel::new()), Arc::new(MockAuthority::new()))
//!     .with_ontology(ontology)
//!     .with_publisher(Arc::new(hub.clone()))
//!     .build()?;
//!
//! let job_id = orchestrator
//!     .start(ReviewRequest::new(tenant, requester, ReviewInput::document("policy.pdf", text)))
//!     .await?;
//! let events = hub.subscribe(job_id);
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator contracts (LanguageModel, KnowledgeSource, ...)
//! - [`types`] - Jobs, criteria, verdicts, citations, results
//! - [`pipeline`] - Classification, evaluation, verification, assembly
//! - [`events`] - In-process progress event hub
//! - [`stores`] - Job stores (MemoryJobStore, PostgresJobStore)
//! - [`sources`] - In-memory sources and the rate-limited model wrapper
//! - [`security`] - Credential handling
//! - [`testing`] - Mock implementations for testing

pub mod error;
pub mod events;
pub mod pipeline;
pub mod security;
pub mod sources;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

#[cfg(feature = "openai")]
pub mod ai;

pub use error::{ErrorCode, Result, ReviewError};
pub use events::EventHub;
pub use traits::{
    knowledge::{AuthoritativeDocument, AuthoritativeSource, KnowledgeSource, SearchQuery, Validity},
    model::{CompletionRequest, LanguageModel},
    publisher::{EventPublisher, NullPublisher},
    store::JobStore,
};
pub use types::{
    citation::{Citation, VerificationStatus, VerificationSummary},
    config::{Fraction, ReviewConfig, RollupPolicy},
    event::{EventKind, ProgressEvent},
    evidence::{Excerpt, Locator, SourceKind},
    ids::{CitationId, JobId, RequesterId, TenantId},
    job::{
        Candidate, JobError, JobFilter, JobState, JobSummary, ResultStatus, ReviewInput, ReviewJob,
        ReviewRequest, TargetMatch,
    },
    ontology::{Criterion, Ontology, OntologyEntry, Priority, Severity, StructuralElement},
    result::{Action, Confidence, Gap, GapKind, ReviewResult},
    task::{EvaluationTask, TaskStatus},
    verdict::{Rating, Verdict},
};

pub use pipeline::{
    compare_results, rating_distribution, Change, Orchestrator, OrchestratorBuilder,
    RatingDistribution, ResultComparison,
};

pub use sources::{MemoryAuthority, MemoryKnowledgeSource, RateLimitedModel};
pub use stores::MemoryJobStore;

#[cfg(feature = "postgres")]
pub use stores::PostgresJobStore;

pub use security::SecretString;
