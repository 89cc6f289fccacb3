//! Citations and their verification status.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::evidence::Locator;
use super::ids::CitationId;
use super::ontology::CriterionId;

/// Verification status of a citation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Not yet checked. Never appears in a finished result.
    #[default]
    Unverified,
    /// Locator resolved and the source supports the asserted text.
    Verified,
    /// Resolution failed, text mismatched, source invalid or unreachable.
    Removed,
    /// Source predates reliable machine-readable originals. Explicitly
    /// labelled; not treated as verified.
    DigitisedUnverifiable,
}

impl VerificationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VerificationStatus::Unverified)
    }
}

/// A factual reference emitted by an evaluation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: CitationId,
    pub criterion_id: CriterionId,
    pub locator: Locator,
    pub asserted_text: String,
    pub status: VerificationStatus,

    /// Why the citation ended up in its status (e.g. "text mismatch").
    #[serde(default)]
    pub note: Option<String>,
}

impl Citation {
    pub fn new(
        criterion_id: impl Into<CriterionId>,
        locator: Locator,
        asserted_text: impl Into<String>,
    ) -> Self {
        Self {
            id: CitationId::new(),
            criterion_id: criterion_id.into(),
            locator,
            asserted_text: asserted_text.into(),
            status: VerificationStatus::Unverified,
            note: None,
        }
    }

    /// Finalize the verification outcome. A citation is immutable once its
    /// status is terminal; later calls are ignored.
    pub fn resolve(&mut self, status: VerificationStatus, note: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.note = note;
    }

    /// Fingerprint of (locator, asserted text). Citations with equal
    /// fingerprints share one authoritative lookup.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.locator.source.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.locator.identifier.trim().to_lowercase().as_bytes());
        hasher.update([0]);
        if let Some(section) = &self.locator.section {
            hasher.update(section.trim().to_lowercase().as_bytes());
        }
        hasher.update([0]);
        hasher.update(self.asserted_text.trim().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Counts of citations by final status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub verified: usize,
    pub removed: usize,
    pub digitised_unverifiable: usize,
}

impl VerificationSummary {
    pub fn from_citations<'a>(citations: impl IntoIterator<Item = &'a Citation>) -> Self {
        let mut summary = Self::default();
        for citation in citations {
            summary.total += 1;
            match citation.status {
                VerificationStatus::Verified => summary.verified += 1,
                VerificationStatus::Removed => summary.removed += 1,
                VerificationStatus::DigitisedUnverifiable => summary.digitised_unverifiable += 1,
                VerificationStatus::Unverified => {}
            }
        }
        summary
    }

    /// Fraction of citations that were removed (0.0 when there are none).
    pub fn removed_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.removed as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::evidence::SourceKind;

    fn citation(text: &str) -> Citation {
        Citation::new(
            "c1",
            Locator::new(SourceKind::Legislation, "GDPR").with_section("Art. 33"),
            text,
        )
    }

    #[test]
    fn test_resolve_is_write_once() {
        let mut c = citation("notify within 72 hours");
        c.resolve(VerificationStatus::Verified, None);
        c.resolve(VerificationStatus::Removed, Some("late".into()));

        assert_eq!(c.status, VerificationStatus::Verified);
        assert_eq!(c.note, None);
    }

    #[test]
    fn test_fingerprint_ignores_identifier_case() {
        let a = citation("notify within 72 hours");
        let mut b = citation("notify within 72 hours");
        b.locator.identifier = "gdpr".into();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), citation("other text").fingerprint());
    }

    #[test]
    fn test_summary_counts() {
        let mut verified = citation("a");
        verified.resolve(VerificationStatus::Verified, None);
        let mut removed = citation("b");
        removed.resolve(VerificationStatus::Removed, None);
        let mut old = citation("c");
        old.resolve(VerificationStatus::DigitisedUnverifiable, None);

        let summary = VerificationSummary::from_citations([&verified, &removed, &old]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.digitised_unverifiable, 1);
        assert!((summary.removed_fraction() - 1.0 / 3.0).abs() < f64::EPSILON);
    }
}
