//! Review pipeline.
//!
//! Stages, in job order:
//! - `classify`: match the input to an ontology entry (and split questions)
//! - `evaluate`: one evaluation unit per criterion
//! - `verify`: citation verification against the authoritative source
//! - `assemble`: rollup, gaps, actions and confidence
//!
//! `orchestrator` drives them through the job state machine.

pub mod assemble;
pub mod classify;
pub mod evaluate;
pub mod guard;
pub mod history;
pub mod matching;
pub mod orchestrator;
pub mod parse;
pub mod prompts;
pub mod rollup;
pub mod verify;

pub use assemble::{assemble, AssemblyInput};
pub use classify::Classification;
pub use evaluate::{Evaluation, EvaluationUnit, TaskRun};
pub use history::{compare_results, rating_distribution, Change, RatingDistribution, ResultComparison};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use parse::Parsed;
pub use rollup::rollup;
pub use verify::CitationVerifier;
