//! Tenant-defined compliance ontology.
//!
//! An ontology is a flat list of entries (policy types, question topics).
//! Each entry carries the criteria a matching input is evaluated against and
//! the structural elements a document of that type is expected to contain.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::evidence::SourceKind;

/// Stable string key of a criterion within its ontology entry.
pub type CriterionId = String;

/// Priority tier of a criterion or structural element.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Gap/action severity derived from the priority tier.
    pub fn severity(&self) -> Severity {
        match self {
            Priority::High => Severity::Critical,
            Priority::Medium => Severity::Important,
            Priority::Low => Severity::Advisory,
        }
    }
}

/// Severity tag on gaps and actions. Orders most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Important,
    Advisory,
}

/// A single compliance rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: CriterionId,
    pub name: String,
    pub description: String,
    pub priority: Priority,

    /// Which kind of source must yield excerpts for this criterion to be
    /// rated `green`.
    pub required_evidence: SourceKind,

    /// Area of the policy that remediation targets; actions are
    /// deduplicated on this key. Falls back to the criterion id.
    #[serde(default)]
    pub target_area: Option<String>,
}

impl Criterion {
    /// Create a criterion with default priority and evidence requirement.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            priority: Priority::Medium,
            required_evidence: SourceKind::TenantDocument,
            target_area: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_required_evidence(mut self, kind: SourceKind) -> Self {
        self.required_evidence = kind;
        self
    }

    pub fn with_target_area(mut self, area: impl Into<String>) -> Self {
        self.target_area = Some(area.into());
        self
    }

    /// Area used to deduplicate recommended actions.
    pub fn area(&self) -> &str {
        self.target_area.as_deref().unwrap_or(&self.id)
    }

    /// Text used as the retrieval query for this criterion.
    pub fn search_text(&self) -> String {
        if self.description.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.description)
        }
    }
}

/// A section or clause a document of this type is expected to contain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralElement {
    pub name: String,
    pub priority: Priority,

    /// Phrases whose presence (case-insensitive) shows the element exists.
    /// An empty list falls back to the element name.
    #[serde(default)]
    pub markers: Vec<String>,
}

impl StructuralElement {
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            priority,
            markers: Vec::new(),
        }
    }

    pub fn with_markers(mut self, markers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.markers = markers.into_iter().map(|m| m.into()).collect();
        self
    }

    /// Check whether the element is present in `text`.
    pub fn is_present_in(&self, text: &str) -> bool {
        let haystack = text.to_lowercase();
        if self.markers.is_empty() {
            return haystack.contains(&self.name.to_lowercase());
        }
        self.markers
            .iter()
            .any(|marker| haystack.contains(&marker.to_lowercase()))
    }
}

/// One classifiable target: a policy type or question topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub required_elements: Vec<StructuralElement>,
}

impl OntologyEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            criteria: Vec::new(),
            required_elements: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn with_element(mut self, element: StructuralElement) -> Self {
        self.required_elements.push(element);
        self
    }
}

/// The tenant's full ontology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ontology {
    pub entries: Vec<OntologyEntry>,
}

impl Ontology {
    pub fn new(entries: Vec<OntologyEntry>) -> Self {
        Self { entries }
    }

    pub fn entry(&self, id: &str) -> Option<&OntologyEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_maps_to_severity() {
        assert_eq!(Priority::High.severity(), Severity::Critical);
        assert_eq!(Priority::Medium.severity(), Severity::Important);
        assert_eq!(Priority::Low.severity(), Severity::Advisory);
        assert!(Severity::Critical < Severity::Advisory);
    }

    #[test]
    fn test_structural_element_markers() {
        let element = StructuralElement::new("Breach notification", Priority::High)
            .with_markers(["notify the regulator", "breach notification"]);

        assert!(element.is_present_in("We will NOTIFY THE REGULATOR within 72 hours."));
        assert!(!element.is_present_in("Data is retained for seven years."));
    }

    #[test]
    fn test_structural_element_falls_back_to_name() {
        let element = StructuralElement::new("Retention schedule", Priority::Low);
        assert!(element.is_present_in("See the retention schedule in annex B."));
    }

    #[test]
    fn test_criterion_area_falls_back_to_id() {
        let criterion = Criterion::new("dpo", "Data protection officer");
        assert_eq!(criterion.area(), "dpo");

        let criterion = criterion.with_target_area("governance");
        assert_eq!(criterion.area(), "governance");
    }
}
