//! Schema validation of model output.
//!
//! Every structured response goes through [`parse_structured`], which
//! returns a tagged [`Parsed`] value instead of an error: a malformed answer
//! is an expected outcome that callers retry once.

use serde::de::DeserializeOwned;

use crate::types::verdict::StructuredVerdict;

/// Outcome of validating model output against its schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Ok(T),
    Malformed { raw: String, reason: String },
}

impl<T> Parsed<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Parsed::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Parsed::Ok(value) => Some(value),
            Parsed::Malformed { .. } => None,
        }
    }

    fn malformed(raw: &str, reason: impl Into<String>) -> Self {
        Parsed::Malformed {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// Strip markdown code fences and surrounding prose, leaving the outermost
/// JSON object.
fn json_body(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Parse raw model output into `T`.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Parsed<T> {
    let Some(body) = json_body(raw) else {
        return Parsed::malformed(raw, "no JSON object in output");
    };

    match serde_json::from_str::<T>(body) {
        Ok(value) => Parsed::Ok(value),
        Err(e) => Parsed::malformed(raw, format!("schema mismatch: {}", e)),
    }
}

/// Parse and sanity-check a verdict.
///
/// Beyond the schema, a verdict must carry a justification and its
/// citations must name a locator and quote something.
pub fn parse_verdict(raw: &str) -> Parsed<StructuredVerdict> {
    let verdict = match parse_structured::<StructuredVerdict>(raw) {
        Parsed::Ok(verdict) => verdict,
        malformed => return malformed,
    };

    if verdict.justification.trim().is_empty() {
        return Parsed::malformed(raw, "empty justification");
    }
    if let Some(bad) = verdict
        .citations
        .iter()
        .find(|c| c.locator.identifier.trim().is_empty() || c.quote.trim().is_empty())
    {
        return Parsed::malformed(
            raw,
            format!("citation without identifier or quote: {:?}", bad.locator),
        );
    }

    Parsed::Ok(verdict)
}
