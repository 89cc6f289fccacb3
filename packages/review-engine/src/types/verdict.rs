//! Ratings and verdicts.
//!
//! [`StructuredVerdict`] is what the language model is asked to produce; its
//! JSON schema is generated with `schemars` and sent with every evaluation
//! call. [`Verdict`] is the validated form kept on the task after the
//! evidence cap and citation rules have been applied.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::evidence::{EvidenceSummary, Locator};
use super::ids::CitationId;
use super::ontology::CriterionId;

/// Traffic-light rating. Ordered from best to worst, so `max` picks the
/// more severe rating.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Green,
    Amber,
    Red,
}

impl Rating {
    /// Clamp so the rating is never better than `ceiling`.
    pub fn no_better_than(self, ceiling: Rating) -> Rating {
        self.max(ceiling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Green => "green",
            Rating::Amber => "amber",
            Rating::Red => "red",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A citation as proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProposedCitation {
    /// Where the cited text lives.
    pub locator: Locator,
    /// The text the model claims the source contains.
    pub quote: String,
}

/// Structured output requested from the model for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StructuredVerdict {
    pub rating: Rating,
    pub justification: String,
    #[serde(default)]
    pub citations: Vec<ProposedCitation>,
    #[serde(default)]
    pub remediations: Vec<String>,
}

/// Validated verdict for one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub criterion_id: CriterionId,
    pub rating: Rating,
    pub justification: String,
    pub citations: Vec<CitationId>,
    pub remediations: Vec<String>,
    pub evidence: EvidenceSummary,

    /// The evidence or citation cap applied to this rating.
    pub capped: bool,
}

impl Verdict {
    pub fn is_green(&self) -> bool {
        self.rating == Rating::Green
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_better_than() {
        assert_eq!(Rating::Green.no_better_than(Rating::Amber), Rating::Amber);
        assert_eq!(Rating::Amber.no_better_than(Rating::Amber), Rating::Amber);
        assert_eq!(Rating::Red.no_better_than(Rating::Amber), Rating::Red);
    }

    #[test]
    fn test_structured_verdict_defaults_missing_lists() {
        let parsed: StructuredVerdict =
            serde_json::from_str(r#"{"rating":"amber","justification":"partial"}"#).unwrap();
        assert_eq!(parsed.rating, Rating::Amber);
        assert!(parsed.citations.is_empty());
        assert!(parsed.remediations.is_empty());
    }

    #[test]
    fn test_schema_names_rating_variants() {
        let schema = serde_json::to_value(schemars::schema_for!(StructuredVerdict)).unwrap();
        let text = schema.to_string();
        assert!(text.contains("\"green\""));
        assert!(text.contains("\"red\""));
        assert!(text.contains("justification"));
    }
}
