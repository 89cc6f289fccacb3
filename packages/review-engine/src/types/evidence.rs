//! Retrieval types: source kinds, locators, excerpts and per-criterion
//! evidence bookkeeping.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of knowledge a source provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// The tenant's own document library.
    TenantDocument,
    /// Acts, regulations and statutory instruments.
    Legislation,
    /// Court and tribunal decisions.
    CaseLaw,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::TenantDocument => "tenant_document",
            SourceKind::Legislation => "legislation",
            SourceKind::CaseLaw => "case_law",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a piece of evidence lives: act/case/document identifier plus an
/// optional section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Locator {
    pub source: SourceKind,
    pub identifier: String,
    #[serde(default)]
    pub section: Option<String>,
}

impl Locator {
    pub fn new(source: SourceKind, identifier: impl Into<String>) -> Self {
        Self {
            source,
            identifier: identifier.into(),
            section: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.section {
            Some(section) => write!(f, "{} {} {}", self.source, self.identifier, section),
            None => write!(f, "{} {}", self.source, self.identifier),
        }
    }
}

/// A ranked passage returned by a knowledge source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Excerpt {
    pub locator: Locator,
    pub text: String,

    /// Relevance score (higher is better). Scales differ between sources.
    pub score: f32,
}

impl Excerpt {
    pub fn new(locator: Locator, text: impl Into<String>) -> Self {
        Self {
            locator,
            text: text.into(),
            score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.locator.source
    }
}

/// What one knowledge source returned for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    /// Returned this many excerpts.
    Found { count: usize },
    /// Returned nothing. Recorded as "no evidence found", never omitted.
    Empty,
    /// Errored or timed out; the task carried on without it.
    Failed { message: String },
    /// Not queried because the job was cancelled.
    Skipped,
}

/// Per-source retrieval report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: String,
    pub kind: SourceKind,
    #[serde(flatten)]
    pub outcome: SourceOutcome,
}

/// Retrieval bookkeeping for one criterion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSummary {
    pub reports: Vec<SourceReport>,

    /// Excerpts that made it into the model context.
    pub context_excerpts: usize,
}

impl EvidenceSummary {
    /// Whether any source of `kind` returned at least one excerpt.
    pub fn has_evidence_of(&self, kind: SourceKind) -> bool {
        self.reports.iter().any(|r| {
            r.kind == kind && matches!(r.outcome, SourceOutcome::Found { count } if count > 0)
        })
    }

    /// Whether no source returned anything at all.
    pub fn is_empty(&self) -> bool {
        !self
            .reports
            .iter()
            .any(|r| matches!(r.outcome, SourceOutcome::Found { count } if count > 0))
    }

    /// Names of sources that returned zero excerpts.
    pub fn empty_sources(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Empty))
            .map(|r| r.source.as_str())
            .collect()
    }

    /// Names of sources that failed.
    pub fn failed_sources(&self) -> Vec<&str> {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, SourceOutcome::Failed { .. }))
            .map(|r| r.source.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: SourceKind, outcome: SourceOutcome) -> SourceReport {
        SourceReport {
            source: kind.to_string(),
            kind,
            outcome,
        }
    }

    #[test]
    fn test_has_evidence_of_required_kind() {
        let summary = EvidenceSummary {
            reports: vec![
                report(SourceKind::TenantDocument, SourceOutcome::Found { count: 3 }),
                report(SourceKind::Legislation, SourceOutcome::Empty),
            ],
            context_excerpts: 3,
        };

        assert!(summary.has_evidence_of(SourceKind::TenantDocument));
        assert!(!summary.has_evidence_of(SourceKind::Legislation));
        assert!(!summary.is_empty());
        assert_eq!(summary.empty_sources(), vec!["legislation"]);
    }

    #[test]
    fn test_failed_source_is_not_evidence() {
        let summary = EvidenceSummary {
            reports: vec![report(
                SourceKind::Legislation,
                SourceOutcome::Failed {
                    message: "unreachable".into(),
                },
            )],
            context_excerpts: 0,
        };

        assert!(summary.is_empty());
        assert_eq!(summary.failed_sources(), vec!["legislation"]);
    }

    #[test]
    fn test_locator_display() {
        let locator = Locator::new(SourceKind::Legislation, "Data Protection Act 2018")
            .with_section("s.67");
        assert_eq!(locator.to_string(), "legislation Data Protection Act 2018 s.67");
    }
}
