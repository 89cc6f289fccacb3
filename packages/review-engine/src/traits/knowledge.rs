//! Knowledge source traits.
//!
//! Two narrow contracts over retrieval backends:
//! - [`KnowledgeSource`]: ranked excerpt search (tenant document search,
//!   legislation lookup, case-law search). Each call can fail or come back
//!   empty independently.
//! - [`AuthoritativeSource`]: resolves a citation locator to the
//!   authoritative text for verification.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::evidence::{Excerpt, Locator, SourceKind};
use crate::types::ids::TenantId;

/// A search issued by an evaluation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub tenant_id: TenantId,
    pub limit: usize,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            text: text.into(),
            tenant_id,
            limit: 8,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Ranked excerpt search over one backend.
///
/// # Implementations
///
/// - `MemoryKnowledgeSource` - keyword ranking over in-memory excerpts
/// - `MockKnowledgeSource` - for testing
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Name used in evidence reports and logs.
    fn name(&self) -> &str;

    /// Kind of evidence this source provides.
    fn kind(&self) -> SourceKind;

    /// Search for excerpts relevant to the query, best first.
    ///
    /// An empty result is not an error.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Excerpt>>;
}

/// Whether an authoritative document is still in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    #[default]
    InForce,
    Superseded,
    Repealed,
}

/// The authoritative text behind a locator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeDocument {
    pub locator: Locator,
    pub text: String,
    #[serde(default)]
    pub jurisdiction: Option<String>,
    #[serde(default)]
    pub validity: Validity,

    /// Date the document stopped being in force, if any.
    #[serde(default)]
    pub valid_until: Option<NaiveDate>,

    /// Text was digitised from an original that predates reliable
    /// machine-readable versions.
    #[serde(default)]
    pub digitised: bool,
}

impl AuthoritativeDocument {
    pub fn new(locator: Locator, text: impl Into<String>) -> Self {
        Self {
            locator,
            text: text.into(),
            jurisdiction: None,
            validity: Validity::InForce,
            valid_until: None,
            digitised: false,
        }
    }

    pub fn with_jurisdiction(mut self, jurisdiction: impl Into<String>) -> Self {
        self.jurisdiction = Some(jurisdiction.into());
        self
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn valid_until(mut self, date: NaiveDate) -> Self {
        self.valid_until = Some(date);
        self
    }

    pub fn digitised(mut self) -> Self {
        self.digitised = true;
        self
    }

    /// In force on `today`.
    pub fn is_in_force(&self, today: NaiveDate) -> bool {
        if self.validity != Validity::InForce {
            return false;
        }
        match self.valid_until {
            Some(until) => today <= until,
            None => true,
        }
    }
}

/// Resolves citation locators against the authoritative source.
#[async_trait]
pub trait AuthoritativeSource: Send + Sync {
    /// Look up a locator.
    ///
    /// Returns `Ok(None)` when the locator does not exist, `Err` when the
    /// source could not be reached.
    async fn lookup(&self, locator: &Locator) -> Result<Option<AuthoritativeDocument>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_force_respects_valid_until() {
        let doc = AuthoritativeDocument::new(
            Locator::new(SourceKind::Legislation, "Old Act"),
            "text",
        )
        .valid_until(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());

        assert!(doc.is_in_force(NaiveDate::from_ymd_opt(2019, 6, 1).unwrap()));
        assert!(!doc.is_in_force(NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()));
    }

    #[test]
    fn test_repealed_is_never_in_force() {
        let doc = AuthoritativeDocument::new(
            Locator::new(SourceKind::Legislation, "Old Act"),
            "text",
        )
        .with_validity(Validity::Repealed);

        assert!(!doc.is_in_force(NaiveDate::from_ymd_opt(1990, 1, 1).unwrap()));
    }
}
