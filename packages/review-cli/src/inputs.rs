//! Local JSON files the CLI reviews against.

use anyhow::{bail, Context, Result};
use review_engine::{
    AuthoritativeDocument, Locator, MemoryAuthority, MemoryKnowledgeSource, Ontology, SourceKind,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct Passage {
    locator: Locator,
    text: String,
}

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let raw = read_text(path)?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// `{"entries": [...]}`, the ontology every review runs against.
pub fn load_ontology(path: &Path) -> Result<Ontology> {
    let ontology: Ontology = read_json(path)?;
    if ontology.is_empty() {
        bail!("{} has no ontology entries", path.display());
    }
    Ok(ontology)
}

/// A knowledge source from `[{"locator": {...}, "text": "..."}]`.
pub fn load_source(path: &Path, name: &str, kind: SourceKind) -> Result<MemoryKnowledgeSource> {
    let passages: Vec<Passage> = read_json(path)?;
    let source = MemoryKnowledgeSource::new(name, kind);
    for passage in passages {
        source.add_shared(passage.locator, passage.text);
    }
    Ok(source)
}

/// Authoritative documents citations are verified against.
pub fn load_authority(path: Option<&Path>) -> Result<MemoryAuthority> {
    let authority = MemoryAuthority::new();
    if let Some(path) = path {
        let documents: Vec<AuthoritativeDocument> = read_json(path)?;
        for document in documents {
            authority.insert(document);
        }
    }
    Ok(authority)
}
