//! LLM prompts for the review pipeline.
//!
//! Templates use `{placeholder}` substitution. The JSON schema for each
//! response is sent alongside the prompt, so the templates only describe
//! intent.

use crate::types::evidence::Excerpt;
use crate::types::ontology::{Criterion, OntologyEntry};

/// System prompt shared by all review calls.
pub const SYSTEM_PROMPT: &str = "You are a compliance analyst. Answer only with JSON matching \
the supplied schema. Cite only text that appears in the supplied excerpts.";

/// Prompt for evaluating one criterion.
pub const EVALUATE_PROMPT: &str = r#"Evaluate the source below against one compliance criterion.

Criterion: {name}
Description: {description}
Priority: {priority}
Required evidence: {required_evidence}

Rate the source:
- green: the criterion is fully met and you can cite supporting text
- amber: partially met, unclear, or evidence is thin
- red: not met or contradicted

Give a justification, cite the excerpts you relied on (locator plus an exact
quote), and list concrete remediation steps for anything short of green.

{evidence_notes}
Excerpts:
{excerpts}

Source:
{source}"#;

/// Appended on the retry after a malformed answer.
pub const STRICT_RETRY_SUFFIX: &str = r#"

Your previous answer did not match the required JSON schema.
Respond with a single JSON object and nothing else. "rating" must be one of
"green", "amber", "red". "justification" must be non-empty. Every citation
needs a locator identifier and a non-empty quote."#;

/// Prompt for matching an input to an ontology entry.
pub const CLASSIFY_PROMPT: &str = r#"Decide which of the listed types the input below belongs to.

Return every plausible candidate with a confidence between 0 and 1. Use only
ids from the list.

Types:
{entries}

Input:
{input}"#;

/// Prompt for splitting a question into research sub-questions.
pub const DECOMPOSE_PROMPT: &str = r#"Break the compliance question below into independent sub-questions
that can each be researched on their own. Topic: {topic}.

For each sub-question give a short id, the question, its priority
(high, medium, low) and the kind of evidence needed to answer it
(tenant_document, legislation, case_law). Return at most {max} sub-questions.

Question:
{question}"#;

/// Longest slice of the input shown to the classifier.
const CLASSIFY_INPUT_CHARS: usize = 4_000;

/// Truncate on a char boundary.
fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Render excerpts as a numbered list.
pub fn format_excerpts(excerpts: &[Excerpt]) -> String {
    if excerpts.is_empty() {
        return "(none)".to_string();
    }
    excerpts
        .iter()
        .enumerate()
        .map(|(i, e)| format!("[{}] {}\n{}", i + 1, e.locator, e.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Format the evaluation prompt.
pub fn format_evaluate_prompt(
    criterion: &Criterion,
    source: &str,
    excerpts: &[Excerpt],
    evidence_notes: &[String],
    strict: bool,
) -> String {
    let notes = if evidence_notes.is_empty() {
        String::new()
    } else {
        format!("Evidence notes:\n- {}\n", evidence_notes.join("\n- "))
    };

    let mut prompt = EVALUATE_PROMPT
        .replace("{name}", &criterion.name)
        .replace("{description}", &criterion.description)
        .replace("{priority}", &format!("{:?}", criterion.priority).to_lowercase())
        .replace("{required_evidence}", criterion.required_evidence.as_str())
        .replace("{evidence_notes}", &notes)
        .replace("{excerpts}", &format_excerpts(excerpts))
        .replace("{source}", source);

    if strict {
        prompt.push_str(STRICT_RETRY_SUFFIX);
    }
    prompt
}

/// Format the classification prompt.
pub fn format_classify_prompt(entries: &[OntologyEntry], input: &str, strict: bool) -> String {
    let listing = entries
        .iter()
        .map(|e| {
            if e.description.is_empty() {
                format!("- {}: {}", e.id, e.name)
            } else {
                format!("- {}: {} ({})", e.id, e.name, e.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut prompt = CLASSIFY_PROMPT
        .replace("{entries}", &listing)
        .replace("{input}", truncate(input, CLASSIFY_INPUT_CHARS));
    if strict {
        prompt.push_str("\n\nRespond with a single JSON object matching the schema.");
    }
    prompt
}

/// Format the decomposition prompt.
pub fn format_decompose_prompt(entry: &OntologyEntry, question: &str, max: usize) -> String {
    DECOMPOSE_PROMPT
        .replace("{topic}", &entry.name)
        .replace("{max}", &max.to_string())
        .replace("{question}", question)
}
